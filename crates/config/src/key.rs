//! Configuration key

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier of a configuration submission: the uid of the
/// submitting package plus the operator-chosen config id
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConfigKey {
    uid: i32,
    id: i64,
}

impl ConfigKey {
    pub fn new(uid: i32, id: i64) -> Self {
        Self { uid, id }
    }

    pub fn uid(&self) -> i32 {
        self.uid
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.uid, self.id)
    }
}
