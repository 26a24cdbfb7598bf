//! Normalization policy applied between decode and storage.
//!
//! Everything here is pure: the decoders call these helpers per item and
//! count rejections for `partial_success` accounting.

use crate::model::value::{AttrMap, Value};

/// Attribute key under which an out-of-range severity's original value is
/// retained after clamping.
pub const ORIGINAL_SEVERITY_KEY: &str = "lumen.severity.original";

/// OTLP severity numbers live in 0..=24.
pub const SEVERITY_MAX: i32 = 24;

/// Limits applied during normalization.
#[derive(Debug, Clone, Copy)]
pub struct NormalizePolicy {
    /// Attribute values larger than this many bytes are truncated.
    pub max_attribute_bytes: usize,
}

/// Clamp a severity number into 0..=24. When clamping occurs, the original
/// value is retained in the record's attributes.
pub fn clamp_severity(severity: i32, attrs: &mut AttrMap) -> i32 {
    if (0..=SEVERITY_MAX).contains(&severity) {
        return severity;
    }
    attrs.insert(
        ORIGINAL_SEVERITY_KEY.to_owned(),
        Value::Int64(i64::from(severity)),
    );
    severity.clamp(0, SEVERITY_MAX)
}

/// Truncate every oversized attribute value in place.
pub fn truncate_attrs(attrs: &mut AttrMap, max_bytes: usize) {
    for value in attrs.values_mut() {
        value.truncate(max_bytes);
    }
}

/// Canonicalize an OTLP nanosecond timestamp. OTLP carries `u64`; the
/// storage and query layers use `i64`. Values beyond `i64::MAX` are not
/// representable and the item carrying them is rejected.
pub const fn canon_time(nanos: u64) -> Option<i64> {
    if nanos > i64::MAX as u64 {
        None
    } else {
        Some(nanos as i64)
    }
}

/// Canonicalize an optional timestamp where zero means absent.
pub const fn canon_time_opt(nanos: u64) -> Option<i64> {
    if nanos == 0 {
        None
    } else {
        canon_time(nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_range_severity_untouched() {
        let mut attrs = AttrMap::new();
        assert_eq!(clamp_severity(17, &mut attrs), 17);
        assert_eq!(clamp_severity(0, &mut attrs), 0);
        assert_eq!(clamp_severity(24, &mut attrs), 24);
        assert!(attrs.is_empty());
    }

    #[test]
    fn out_of_range_severity_clamped_and_retained() {
        let mut attrs = AttrMap::new();
        assert_eq!(clamp_severity(99, &mut attrs), 24);
        assert_eq!(attrs[ORIGINAL_SEVERITY_KEY], Value::Int64(99));

        let mut attrs = AttrMap::new();
        assert_eq!(clamp_severity(-3, &mut attrs), 0);
        assert_eq!(attrs[ORIGINAL_SEVERITY_KEY], Value::Int64(-3));
    }

    #[test]
    fn truncate_only_affects_oversized_values() {
        let mut attrs = AttrMap::new();
        attrs.insert("short".into(), Value::String("ok".into()));
        attrs.insert("long".into(), Value::String("x".repeat(100)));
        truncate_attrs(&mut attrs, 10);
        assert_eq!(attrs["short"], Value::String("ok".into()));
        assert_eq!(attrs["long"], Value::String("x".repeat(10)));
    }

    #[test]
    fn timestamps_beyond_i64_are_rejected() {
        assert_eq!(canon_time(0), Some(0));
        assert_eq!(canon_time(i64::MAX as u64), Some(i64::MAX));
        assert_eq!(canon_time(i64::MAX as u64 + 1), None);
        assert_eq!(canon_time_opt(0), None);
        assert_eq!(canon_time_opt(5), Some(5));
    }
}
