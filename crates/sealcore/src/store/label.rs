//! Key labels: the identifier tying a wrapped-DEK generation to the records
//! encrypted under it.
//!
//! Three shapes exist: `active` (exactly one row), `retired::<ts>` (any
//! number), `rotating::<ts>` (zero or one, only while a rotation is open).
//! Timestamps are unix seconds.

use common::CryptoError;

/// Parsed form of an `encryption_keys.label` value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyLabel {
    /// The single key used for all new writes outside of rotation.
    Active,
    /// A superseded key, kept for decrypting records not yet migrated.
    Retired(i64),
    /// The in-flight replacement key during an open rotation.
    Rotating(i64),
}

impl KeyLabel {
    /// Parse the stored string form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidLabel`] if `s` matches none of the
    /// three recognised shapes.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        if s == "active" {
            return Ok(KeyLabel::Active);
        }
        if let Some(ts) = s.strip_prefix("retired::") {
            if let Ok(ts) = ts.parse::<i64>() {
                return Ok(KeyLabel::Retired(ts));
            }
        }
        if let Some(ts) = s.strip_prefix("rotating::") {
            if let Ok(ts) = ts.parse::<i64>() {
                return Ok(KeyLabel::Rotating(ts));
            }
        }
        Err(CryptoError::InvalidLabel(s.to_owned()))
    }

    /// `true` for the `rotating::<ts>` shape.
    pub fn is_rotating(&self) -> bool {
        matches!(self, KeyLabel::Rotating(_))
    }

    /// `true` for the `active` shape.
    pub fn is_active(&self) -> bool {
        matches!(self, KeyLabel::Active)
    }
}

impl std::fmt::Display for KeyLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyLabel::Active => f.write_str("active"),
            KeyLabel::Retired(ts) => write!(f, "retired::{ts}"),
            KeyLabel::Rotating(ts) => write!(f, "rotating::{ts}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_recognised_shapes() {
        assert_eq!(KeyLabel::parse("active").unwrap(), KeyLabel::Active);
        assert_eq!(
            KeyLabel::parse("retired::1754300000").unwrap(),
            KeyLabel::Retired(1754300000)
        );
        assert_eq!(
            KeyLabel::parse("rotating::1754300001").unwrap(),
            KeyLabel::Rotating(1754300001)
        );
    }

    #[test]
    fn parse_rejects_malformed_labels() {
        for bad in ["Active", "retired::", "rotating::abc", "retired", "", "current"] {
            assert!(
                matches!(KeyLabel::parse(bad), Err(CryptoError::InvalidLabel(_))),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn display_round_trips() {
        for label in [
            KeyLabel::Active,
            KeyLabel::Retired(1700000000),
            KeyLabel::Rotating(1700000001),
        ] {
            assert_eq!(KeyLabel::parse(&label.to_string()).unwrap(), label);
        }
    }

    #[test]
    fn shape_predicates() {
        assert!(KeyLabel::Active.is_active());
        assert!(KeyLabel::Rotating(1).is_rotating());
        assert!(!KeyLabel::Retired(1).is_rotating());
    }
}
