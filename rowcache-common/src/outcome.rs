//! The "no change" sentinel for `update`/`update_existing`.

/// Result of a user update function run under the row lock.
///
/// A tagged sum rather than a distinguished in-band value, so a user value
/// can never be mistaken for "no change".
#[derive(Debug, Clone)]
pub enum UpdateOutcome<V> {
    /// Write `V` and fire the update callback.
    Change(V),
    /// Leave the store untouched; no write, no callback.
    NoChange,
}

impl<V> UpdateOutcome<V> {
    /// Returns the new value if this is a `Change`.
    pub fn into_value(self) -> Option<V> {
        match self {
            UpdateOutcome::Change(v) => Some(v),
            UpdateOutcome::NoChange => None,
        }
    }

    /// Returns true if this outcome carries a change.
    pub fn is_change(&self) -> bool {
        matches!(self, UpdateOutcome::Change(_))
    }
}
