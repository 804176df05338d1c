//! Small serde default-value helpers shared by config structs.

/// Default for boolean config fields that should default to `true`.
#[must_use]
#[inline]
pub(crate) fn default_true() -> bool {
    true
}
