//! State atom configuration
//!
//! A state atom carries "the current value of X for primary key Y"; metrics
//! may join the most recent state value into their dimension key.

use serde::{Deserialize, Serialize};

/// Field layout of one state atom
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateAtomConfig {
    /// Tag id of the state atom
    pub atom_id: i32,

    /// 1-based positions identifying the primary key (e.g. uid)
    #[serde(default)]
    pub primary_fields: Vec<usize>,

    /// 1-based position of the state value field
    pub value_field: usize,
}
