use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

use crate::error::{ScraperError, ScraperResult};
use crate::program::SqliteConditionType;

/// Applies `op` to already-resolved operands
///
/// Numbers and numeric strings compare numerically, everything else as text.
/// `null` only equals `null` and cannot be ordered; neither can a number
/// against non-numeric text.
pub fn compare(op: SqliteConditionType, left: &Value, right: &[Value]) -> ScraperResult<bool> {
    use SqliteConditionType::*;

    op.check_arity(right.len()).map_err(ScraperError::invalid_condition)?;

    match op {
        IsNull => Ok(left.is_null()),
        IsNotNull => Ok(!left.is_null()),
        Equals => Ok(equals(left, &right[0])),
        NotEquals => Ok(!equals(left, &right[0])),
        GreaterThan => Ok(order(left, &right[0])? == Ordering::Greater),
        GreaterThanOrEqual => Ok(order(left, &right[0])? != Ordering::Less),
        LessThan => Ok(order(left, &right[0])? == Ordering::Less),
        LessThanOrEqual => Ok(order(left, &right[0])? != Ordering::Greater),
        Like | NotLike | ILike | NotILike => {
            if left.is_null() {
                return Ok(false);
            }
            let case_insensitive = matches!(op, ILike | NotILike);
            let matched = like(left, &right[0], case_insensitive)?;
            Ok(if matches!(op, Like | ILike) { matched } else { !matched })
        }
        In | NotIn => {
            let found = flatten(right).any(|candidate| equals(left, candidate));
            Ok(if op == In { found } else { !found })
        }
        Between | NotBetween => {
            let within = order(left, &right[0])? != Ordering::Less && order(left, &right[1])? != Ordering::Greater;
            Ok(if op == Between { within } else { !within })
        }
    }
}

fn flatten(values: &[Value]) -> impl Iterator<Item = &Value> {
    values.iter().flat_map(|value| match value {
        Value::Array(items) => items.iter().collect::<Vec<_>>(),
        other => vec![other],
    })
}

/// Numeric view of a value, parsing numeric strings
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse::<f64>().ok().filter(|f| f.is_finite())
            }
        }
        _ => None,
    }
}

/// Text view of a scalar value
pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => {
            if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
                return a == b;
            }
            match (as_text(left), as_text(right)) {
                (Some(a), Some(b)) => a == b,
                _ => left == right,
            }
        }
    }
}

fn order(left: &Value, right: &Value) -> ScraperResult<Ordering> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => {
            return a
                .partial_cmp(&b)
                .ok_or_else(|| ScraperError::invalid_condition("numbers are not comparable"))
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err(ScraperError::invalid_condition(format!(
                "cannot order number against non-numeric {} / {}",
                left, right
            )))
        }
        (None, None) => {}
    }

    match (as_text(left), as_text(right)) {
        (Some(a), Some(b)) => Ok(a.cmp(&b)),
        _ => Err(ScraperError::invalid_condition(format!(
            "cannot order {} against {}",
            left, right
        ))),
    }
}

fn like(left: &Value, pattern: &Value, case_insensitive: bool) -> ScraperResult<bool> {
    let text = as_text(left)
        .ok_or_else(|| ScraperError::invalid_condition(format!("LIKE needs a scalar, got {}", left)))?;
    let pattern = as_text(pattern).ok_or_else(|| {
        ScraperError::invalid_condition(format!("LIKE pattern must be text, got {}", pattern))
    })?;

    Ok(like_regex(&pattern, case_insensitive)?.is_match(&text))
}

/// Translates a SQL LIKE pattern (`%`, `_`) into an anchored regex
pub fn like_regex(pattern: &str, case_insensitive: bool) -> ScraperResult<Regex> {
    let mut source = String::from(if case_insensitive { "(?si)^" } else { "(?s)^" });
    let mut literal = [0u8; 4];

    for c in pattern.chars() {
        match c {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut literal))),
        }
    }
    source.push('$');

    Regex::new(&source).map_err(|e| ScraperError::invalid_condition(format!("bad LIKE pattern: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use SqliteConditionType::*;

    #[test]
    fn test_numeric_vs_text_comparison() {
        assert!(compare(GreaterThan, &json!("10"), &[json!(9)]).unwrap());
        // text comparison would say "10" < "9"
        assert!(compare(LessThan, &json!("10"), &[json!("9")]).is_ok_and(|r| !r));
        assert!(compare(LessThan, &json!("apple"), &[json!("banana")]).unwrap());
        assert!(compare(Equals, &json!("3.0"), &[json!(3)]).unwrap());
        assert!(compare(NotEquals, &json!("OK"), &[json!("ok")]).unwrap());
    }

    #[test]
    fn test_like_semantics() {
        assert!(compare(Like, &json!("Hello world"), &[json!("Hello%")]).unwrap());
        assert!(!compare(Like, &json!("hello world"), &[json!("Hello%")]).unwrap());
        assert!(compare(ILike, &json!("hello world"), &[json!("HELLO_WORLD")]).unwrap());
        assert!(compare(NotLike, &json!("a.b"), &[json!("a_c")]).unwrap());
        assert!(compare(Like, &json!("1+1"), &[json!("1+1")]).unwrap());
        assert!(!compare(Like, &Value::Null, &[json!("%")]).unwrap());
        assert!(!compare(NotLike, &Value::Null, &[json!("%")]).unwrap());
    }

    #[test]
    fn test_membership_and_ranges() {
        assert!(compare(In, &json!("b"), &[json!(["a", "b"])]).unwrap());
        assert!(compare(In, &json!(2), &[json!(1), json!("2")]).unwrap());
        assert!(compare(NotIn, &json!("z"), &[json!("a")]).unwrap());
        assert!(compare(Between, &json!(5), &[json!(1), json!(5)]).unwrap());
        assert!(compare(NotBetween, &json!(6), &[json!(1), json!(5)]).unwrap());
    }

    #[test]
    fn test_nulls() {
        assert!(compare(IsNull, &Value::Null, &[json!("ignored")]).unwrap());
        assert!(compare(IsNotNull, &json!(0), &[]).unwrap());
        assert!(compare(Equals, &Value::Null, &[Value::Null]).unwrap());
        assert!(!compare(Equals, &Value::Null, &[json!("")]).unwrap());
    }

    #[test]
    fn test_type_mismatch_is_invalid_condition() {
        let err = compare(Between, &Value::Null, &[json!(1), json!(2)]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidCondition);

        let err = compare(GreaterThan, &json!([1]), &[json!(1)]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidCondition);

        let err = compare(Between, &json!(1), &[json!(1)]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidCondition);
    }

    #[test]
    fn test_number_against_word_cannot_be_ordered() {
        let err = compare(LessThan, &json!("n/a"), &[json!(9)]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidCondition);

        let err = compare(Between, &json!(4), &[json!("low"), json!(9)]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidCondition);

        // Equality still compares as text
        assert!(compare(NotEquals, &json!("n/a"), &[json!(9)]).unwrap());
    }
}
