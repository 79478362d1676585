//! Activation rules and the rule matcher.
//!
//! An [`ActivationRule`] describes a single condition on an inbound JSON
//! message: descend the message by a flat sequence of object keys and compare
//! whatever sits at the end of that path with an expected value.
//!
//! ```rust,ignore
//! use pulse_core::{ActivationRule, matches};
//! use serde_json::json;
//!
//! let rule = ActivationRule::new(["user", "address", "street"], "Main St");
//! let message = json!({ "user": { "address": { "street": "Main St" } } });
//!
//! assert!(matches(&message, &rule)?);
//! ```
//!
//! # Equality
//!
//! Comparison is strict. The found value must have the same JSON type as the
//! expected one: `0` never matches `false`, `""` never matches `null`, and
//! `null` only matches a key that is present with an explicit `null`. Numbers
//! compare by value, so `1` and `1.0` are equal.

use std::fmt;

use serde_json::{Map, Number, Value};

use crate::error::{RuleError, RuleResult};

/// A path/value activation condition.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationRule {
    path: Vec<String>,
    expected: Value,
}

impl ActivationRule {
    /// Creates a rule from a key path and the value expected at its end.
    pub fn new<P, K>(path: P, expected: impl Into<Value>) -> Self
    where
        P: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            path: path.into_iter().map(Into::into).collect(),
            expected: expected.into(),
        }
    }

    /// The keys to descend, outermost first.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// The value the path must resolve to.
    pub fn expected(&self) -> &Value {
        &self.expected
    }

    /// Method form of [`matches`].
    pub fn matches(&self, message: &Value) -> RuleResult<bool> {
        matches(message, self)
    }
}

impl fmt::Display for ActivationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.path.join("."), self.expected)
    }
}

/// Decides whether `message` satisfies `rule`.
///
/// Returns [`RuleError::InvalidInput`] when `message` is not a JSON object or
/// is an empty one. A key missing at any level, or a non-object value in the
/// middle of the path, is a non-match.
pub fn matches(message: &Value, rule: &ActivationRule) -> RuleResult<bool> {
    validate_message(message)?;

    let mut current = message;
    for key in &rule.path {
        match current.as_object().and_then(|map| map.get(key)) {
            Some(next) => current = next,
            None => return Ok(false),
        }
    }

    Ok(strict_eq(current, &rule.expected))
}

/// Checks that `message` is a non-empty JSON object.
pub fn validate_message(message: &Value) -> RuleResult<&Map<String, Value>> {
    let Some(object) = message.as_object() else {
        return Err(RuleError::InvalidInput {
            reason: "message must be a JSON object",
        });
    };
    if object.is_empty() {
        return Err(RuleError::InvalidInput {
            reason: "message must not be empty",
        });
    }
    Ok(object)
}

fn strict_eq(found: &Value, expected: &Value) -> bool {
    match (found, expected) {
        (Value::Number(a), Value::Number(b)) => numbers_eq(a, b),
        _ => found == expected,
    }
}

// serde_json keeps integers and floats apart, so `1 == 1.0` would be false.
fn numbers_eq(a: &Number, b: &Number) -> bool {
    match (integer(a), integer(b)) {
        (Some(x), Some(y)) => x == y,
        (Some(x), None) => float_eq_integer(b, x),
        (None, Some(y)) => float_eq_integer(a, y),
        (None, None) => a.as_f64() == b.as_f64(),
    }
}

fn integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

// Exact: the float must be a whole number inside the integer range.
fn float_eq_integer(float: &Number, int: i128) -> bool {
    const MIN: f64 = -9_223_372_036_854_775_808.0; // i64::MIN
    const MAX: f64 = 18_446_744_073_709_551_616.0; // u64::MAX + 1

    match float.as_f64() {
        Some(f) if f.fract() == 0.0 && (MIN..MAX).contains(&f) => f as i128 == int,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(message: Value, path: &[&str], expected: Value) -> bool {
        matches(&message, &ActivationRule::new(path.iter().copied(), expected)).unwrap()
    }

    #[test]
    fn test_matching_paths() {
        assert!(check(json!({"a": {"b": 10}}), &["a", "b"], json!(10)));
        assert!(check(json!({"x": {"y": {"z": "ok"}}}), &["x", "y", "z"], json!("ok")));
        assert!(check(
            json!({"level1": {"level2": {"level3": 42}}}),
            &["level1", "level2", "level3"],
            json!(42)
        ));
        assert!(check(json!({"type": "ping"}), &["type"], json!("ping")));
    }

    #[test]
    fn test_nested_street() {
        let rule = ActivationRule::new(["user", "address", "street"], "Main St");

        let hit = json!({"user": {"address": {"street": "Main St"}}});
        assert_eq!(rule.matches(&hit), Ok(true));

        let miss = json!({"user": {"address": {}}});
        assert_eq!(rule.matches(&miss), Ok(false));
    }

    #[test]
    fn test_missing_key_never_matches() {
        let message = json!({"a": {"b": 1}});
        for expected in [json!(null), json!(1), json!(false), json!(""), json!({})] {
            assert!(!check(message.clone(), &["a", "c"], expected.clone()));
            assert!(!check(message.clone(), &["z"], expected));
        }
    }

    #[test]
    fn test_null_expected() {
        assert!(check(json!({"outer": {"inner": null}}), &["outer", "inner"], json!(null)));
        assert!(!check(json!({"outer": {}}), &["outer", "inner"], json!(null)));
        assert!(!check(json!({"outer": {"inner": 0}}), &["outer", "inner"], json!(null)));
    }

    #[test]
    fn test_strict_equality() {
        assert!(!check(json!({"a": {"b": 1}}), &["a", "b"], json!(2)));
        assert!(!check(json!({"a": {"b": 0}}), &["a", "b"], json!(1)));
        assert!(!check(json!({"flag": false}), &["flag"], json!(true)));
        assert!(!check(json!({"flag": false}), &["flag"], json!(0)));
        assert!(!check(json!({"flag": 1}), &["flag"], json!(true)));
        assert!(!check(json!({"s": ""}), &["s"], json!(null)));
        assert!(!check(json!({"s": ""}), &["s"], json!(false)));
        assert!(!check(json!({"n": "1"}), &["n"], json!(1)));
    }

    #[test]
    fn test_numbers_compare_by_value() {
        assert!(check(json!({"n": 1}), &["n"], json!(1.0)));
        assert!(check(json!({"n": 2.5}), &["n"], json!(2.5)));
        assert!(!check(json!({"n": -1}), &["n"], json!(u64::MAX)));
    }

    #[test]
    fn test_large_integers_do_not_round_to_floats() {
        let n = 9_007_199_254_740_993_u64;
        assert!(!check(json!({"n": n}), &["n"], json!(9_007_199_254_740_992.0)));
        assert!(!check(json!({"n": 9_007_199_254_740_992.0}), &["n"], json!(n)));
        assert!(check(json!({"n": n - 1}), &["n"], json!(9_007_199_254_740_992.0)));
        assert!(!check(json!({"n": u64::MAX}), &["n"], json!(1.8446744073709552e19)));
        assert!(!check(json!({"n": 3}), &["n"], json!(3.5)));
    }

    #[test]
    fn test_non_object_intermediate() {
        assert!(!check(json!({"a": "text"}), &["a", "b"], json!("t")));
        assert!(!check(json!({"a": [1, 2]}), &["a", "0"], json!(1)));
    }

    #[test]
    fn test_invalid_input() {
        let rule = ActivationRule::new(["a"], 1);
        for message in [json!({}), json!([]), json!(null), json!("a"), json!(3)] {
            assert!(matches!(
                matches(&message, &rule),
                Err(RuleError::InvalidInput { .. })
            ));
        }
    }

    #[test]
    fn test_display() {
        let rule = ActivationRule::new(["type", "kind"], "ping");
        assert_eq!(rule.to_string(), "type.kind=\"ping\"");
    }
}
