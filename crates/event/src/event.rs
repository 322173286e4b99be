//! One decoded atom
//!
//! The wire decoder (out of scope here) produces an `Event` per socket
//! message: the tag id, an elapsed-realtime timestamp, origin identity, and
//! a positional list of typed fields. Positions are 1-based to match the
//! atom schema numbering.
//!
//! An event may carry an attribution chain: a contiguous sub-range of
//! fields in which every `Int` field is a uid principal and every `Str`
//! field is the tag attributed to the preceding uid.

use crate::error::EventError;
use crate::value::{FieldKind, FieldValue};
use crate::Result;

/// One (uid, tag) entry of an attribution chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributionNode {
    pub uid: i32,
    pub tag: String,
}

/// A single decoded statistics event
#[derive(Debug, Clone)]
pub struct Event {
    tag_id: i32,
    elapsed_ns: i64,
    wall_clock_ns: Option<i64>,
    uid: i32,
    pid: i32,
    valid: bool,
    restricted: bool,
    header_only: bool,
    values: Vec<FieldValue>,
    /// 1-based inclusive positions of the attribution chain, if any
    attribution_range: Option<(usize, usize)>,
    /// 1-based positions of uid-typed fields outside the chain
    uid_field_positions: Vec<usize>,
}

impl Event {
    /// Create a new valid event with no fields
    pub fn new(tag_id: i32, elapsed_ns: i64) -> Self {
        Self {
            tag_id,
            elapsed_ns,
            wall_clock_ns: None,
            uid: 0,
            pid: 0,
            valid: true,
            restricted: false,
            header_only: false,
            values: Vec::new(),
            attribution_range: None,
            uid_field_positions: Vec::new(),
        }
    }

    /// Set the origin uid (chainable, for construction sites and tests)
    pub fn with_uid(mut self, uid: i32) -> Self {
        self.uid = uid;
        self
    }

    /// Set the origin pid
    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = pid;
        self
    }

    /// Set the wall-clock timestamp
    pub fn with_wall_clock_ns(mut self, wall_clock_ns: i64) -> Self {
        self.wall_clock_ns = Some(wall_clock_ns);
        self
    }

    /// Append a field and return self (chainable)
    pub fn with_field(mut self, value: FieldValue) -> Self {
        self.values.push(value);
        self
    }

    /// Append a field in place
    pub fn push_field(&mut self, value: FieldValue) {
        self.values.push(value);
    }

    /// Mark the event as failed to decode
    pub fn mark_invalid(&mut self) {
        self.valid = false;
    }

    /// Mark the event as restricted (SQL-store data path only)
    pub fn with_restricted(mut self) -> Self {
        self.restricted = true;
        self
    }

    /// Mark the event as having only its header parsed
    pub fn with_header_only(mut self) -> Self {
        self.header_only = true;
        self
    }

    /// Declare the attribution chain as the inclusive 1-based range
    /// `[start, end]`. Positions outside the current field list are allowed;
    /// the range is validated lazily on access.
    pub fn with_attribution_range(mut self, start: usize, end: usize) -> Self {
        self.attribution_range = Some((start, end));
        self
    }

    /// Mark the field at `position` as uid-typed, so uid normalization
    /// rewrites it
    pub fn mark_uid_field(&mut self, position: usize) {
        if !self.uid_field_positions.contains(&position) {
            self.uid_field_positions.push(position);
        }
    }

    pub fn tag_id(&self) -> i32 {
        self.tag_id
    }

    pub fn elapsed_timestamp_ns(&self) -> i64 {
        self.elapsed_ns
    }

    pub fn wall_clock_ns(&self) -> Option<i64> {
        self.wall_clock_ns
    }

    pub fn uid(&self) -> i32 {
        self.uid
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    pub fn is_parsed_header_only(&self) -> bool {
        self.header_only
    }

    /// Number of fields in the event
    pub fn num_fields(&self) -> usize {
        self.values.len()
    }

    /// All field values, in position order
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// The field at the 1-based `position`, if present
    pub fn value_at(&self, position: usize) -> Option<&FieldValue> {
        if position == 0 {
            return None;
        }
        self.values.get(position - 1)
    }

    fn typed_at(&self, position: usize, expected: FieldKind) -> Result<&FieldValue> {
        let value = self
            .value_at(position)
            .ok_or_else(|| EventError::out_of_range(position, self.values.len()))?;
        if value.kind() == expected {
            Ok(value)
        } else {
            Err(EventError::wrong_type(position, expected, value.kind()))
        }
    }

    /// Read an `Int` field
    pub fn int_at(&self, position: usize) -> Result<i32> {
        match self.typed_at(position, FieldKind::Int)? {
            FieldValue::Int(v) => Ok(*v),
            _ => unreachable!(),
        }
    }

    /// Read an `Int` or `Long` field, widened to i64
    pub fn long_at(&self, position: usize) -> Result<i64> {
        let value = self
            .value_at(position)
            .ok_or_else(|| EventError::out_of_range(position, self.values.len()))?;
        value
            .as_long()
            .ok_or_else(|| EventError::wrong_type(position, FieldKind::Long, value.kind()))
    }

    /// Read a `Float` field
    pub fn float_at(&self, position: usize) -> Result<f32> {
        match self.typed_at(position, FieldKind::Float)? {
            FieldValue::Float(v) => Ok(*v),
            _ => unreachable!(),
        }
    }

    /// Read a `Bool` field
    pub fn bool_at(&self, position: usize) -> Result<bool> {
        match self.typed_at(position, FieldKind::Bool)? {
            FieldValue::Bool(v) => Ok(*v),
            _ => unreachable!(),
        }
    }

    /// Read a `Str` field
    pub fn str_at(&self, position: usize) -> Result<&str> {
        match self.typed_at(position, FieldKind::Str)? {
            FieldValue::Str(v) => Ok(v),
            _ => unreachable!(),
        }
    }

    /// Read a `Bytes` field
    pub fn bytes_at(&self, position: usize) -> Result<&[u8]> {
        match self.typed_at(position, FieldKind::Bytes)? {
            FieldValue::Bytes(v) => Ok(v),
            _ => unreachable!(),
        }
    }

    /// Replace the field at the 1-based `position`, used by the privileged
    /// atom fixups
    pub fn set_value(&mut self, position: usize, value: FieldValue) -> Result<()> {
        if position == 0 || position > self.values.len() {
            return Err(EventError::out_of_range(position, self.values.len()));
        }
        self.values[position - 1] = value;
        Ok(())
    }

    /// The attribution chain's 1-based inclusive position range, if any
    pub fn attribution_range(&self) -> Option<(usize, usize)> {
        self.attribution_range
    }

    /// Parse the attribution chain into (uid, tag) nodes
    pub fn attribution_nodes(&self) -> Result<Vec<AttributionNode>> {
        let (start, end) = self
            .attribution_range
            .ok_or(EventError::NoAttributionChain)?;
        let mut nodes = Vec::new();
        let mut pending_uid: Option<i32> = None;
        for position in start..=end {
            match self.value_at(position) {
                Some(FieldValue::Int(uid)) => {
                    if let Some(prev) = pending_uid.take() {
                        nodes.push(AttributionNode {
                            uid: prev,
                            tag: String::new(),
                        });
                    }
                    pending_uid = Some(*uid);
                }
                Some(FieldValue::Str(tag)) => {
                    if let Some(uid) = pending_uid.take() {
                        nodes.push(AttributionNode {
                            uid,
                            tag: tag.clone(),
                        });
                    }
                }
                _ => {}
            }
        }
        if let Some(uid) = pending_uid {
            nodes.push(AttributionNode {
                uid,
                tag: String::new(),
            });
        }
        Ok(nodes)
    }

    /// The uids of the attribution chain, in order
    pub fn attribution_uids(&self) -> Vec<i32> {
        let Some((start, end)) = self.attribution_range else {
            return Vec::new();
        };
        (start..=end)
            .filter_map(|position| match self.value_at(position) {
                Some(FieldValue::Int(uid)) => Some(*uid),
                _ => None,
            })
            .collect()
    }

    /// Rewrite every uid-typed field (attribution-chain uids plus annotated
    /// uid fields) through `map`
    pub fn map_uid_fields<F: FnMut(i32) -> i32>(&mut self, mut map: F) {
        if let Some((start, end)) = self.attribution_range {
            for position in start..=end {
                let index = position - 1;
                if let Some(FieldValue::Int(uid)) = self.values.get(index) {
                    let mapped = map(*uid);
                    self.values[index] = FieldValue::Int(mapped);
                }
            }
        }
        for &position in &self.uid_field_positions {
            let Some(index) = position.checked_sub(1) else {
                continue;
            };
            if let Some(FieldValue::Int(uid)) = self.values.get(index) {
                let mapped = map(*uid);
                self.values[index] = FieldValue::Int(mapped);
            }
        }
    }
}
