//! Subset comparison of JSON objects.
//!
//! ```
//! use serde_json::json;
//! use testkit::maps;
//!
//! let actual = json!({"x": 1, "y": {"a": "1", "b": "2"}});
//! let actual = actual.as_object();
//!
//! assert!(maps::contains(actual, json!({"x": 1}).as_object()));
//! assert!(maps::contains(actual, json!({"y": {"a": "1"}}).as_object()));
//! assert!(!maps::contains(actual, json!({"x": 2}).as_object()));
//! ```

use serde_json::{Map, Value};

/// A JSON object, as produced by `serde_json`.
pub type JsonMap = Map<String, Value>;

/// Whether every key of `expected` is present in `actual` with an equal
/// value. Objects nested under a key are compared the same way, so they
/// only need to contain the expected keys too.
///
/// No expectation is always met, and nothing meets a real expectation.
pub fn contains(actual: Option<&JsonMap>, expected: Option<&JsonMap>) -> bool {
    contains_with_reason(actual, expected).is_ok()
}

/// Like [`contains`], but explains the first difference found.
///
/// # Errors
/// With a description of the missing key or mismatched value.
pub fn contains_with_reason(
    actual: Option<&JsonMap>,
    expected: Option<&JsonMap>,
) -> Result<(), String> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let Some(actual) = actual else {
        return Err("actual is null".to_string());
    };

    for (key, expected_value) in expected {
        let Some(actual_value) = actual.get(key) else {
            return Err(format!(
                "Actual: {}\n\tExpected: {}\n\tHint: Key '{key}' is not present in actual map",
                Value::Object(actual.clone()),
                Value::Object(expected.clone()),
            ));
        };

        if let Value::Object(expected_map) = expected_value {
            let Value::Object(actual_map) = actual_value else {
                return Err(format!(
                    "For key '{key}', expected value of type 'map' but got '{}'",
                    type_name(actual_value)
                ));
            };

            contains_with_reason(Some(actual_map), Some(expected_map))
                .map_err(|reason| format!("For key '{key}'\n\t{reason}"))?;
            continue;
        }

        if actual_value != expected_value {
            return Err(format!(
                "Actual: {}\n\tExpected: {}\n\tHint: Value for key '{key}' does not match expected value '{}({expected_value})' but got '{}({actual_value})'",
                Value::Object(actual.clone()),
                Value::Object(expected.clone()),
                type_name(expected_value),
                type_name(actual_value),
            ));
        }
    }

    Ok(())
}

/// The kind of `value`, as used in failure reasons.
fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(number) if number.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

#[cfg(test)]
mod tests {
    use super::{contains, contains_with_reason};
    use parameterized::parameterized;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    #[parameterized(
        actual = {
            json!({"a": 1, "b": 2}),
            json!({"a": 1, "b": 2}),
            json!({"a": {"b": 1}}),
            json!({"a": {"b": 1, "c": [1, 2]}, "d": null}),
            json!({}),
        },
        expected = {
            json!({"a": 1}),
            json!({"a": 1, "b": 2}),
            json!({"a": {"b": 1}}),
            json!({"a": {"c": [1, 2]}, "d": null}),
            json!({}),
        }
    )]
    fn subsets_are_contained(actual: Value, expected: Value) {
        use pretty_assertions::assert_eq;
        assert!(contains(actual.as_object(), expected.as_object()));
        assert_eq!(
            contains_with_reason(actual.as_object(), expected.as_object()),
            Ok(())
        );
    }

    #[test]
    fn missing_actual_fails() {
        let expected = json!({});
        assert!(!contains(None, expected.as_object()));
        assert_eq!(
            contains_with_reason(None, expected.as_object()),
            Err("actual is null".to_string())
        );
    }

    #[test]
    fn missing_expected_passes() {
        let actual = json!({});
        assert!(contains(actual.as_object(), None));
        assert!(contains(None, None));
    }

    #[test]
    fn missing_key_is_explained() {
        let actual = json!({"a": 1});
        let expected = json!({"b": 1});

        assert_eq!(
            contains_with_reason(actual.as_object(), expected.as_object()),
            Err(
                "Actual: {\"a\":1}\n\tExpected: {\"b\":1}\n\tHint: Key 'b' is not present in actual map"
                    .to_string()
            )
        );
    }

    #[test]
    fn value_mismatch_is_explained() {
        let actual = json!({"a": 1, "b": 2});
        let expected = json!({"a": 2});

        assert_eq!(
            contains_with_reason(actual.as_object(), expected.as_object()),
            Err("Actual: {\"a\":1,\"b\":2}\n\tExpected: {\"a\":2}\n\tHint: Value for key 'a' does not match expected value 'int(2)' but got 'int(1)'".to_string())
        );
    }

    #[test]
    fn number_kinds_must_match() {
        let actual = json!({"a": 1.0});
        let expected = json!({"a": 1});

        let reason = contains_with_reason(actual.as_object(), expected.as_object()).unwrap_err();
        assert!(
            reason.ends_with("expected value 'int(1)' but got 'float(1.0)'"),
            "{reason}"
        );
    }

    #[test]
    fn nested_mismatch_names_the_parent_key() {
        let actual = json!({"a": {"b": 1}});
        let expected = json!({"a": {"b": 2}});

        assert_eq!(
            contains_with_reason(actual.as_object(), expected.as_object()),
            Err("For key 'a'\n\tActual: {\"b\":1}\n\tExpected: {\"b\":2}\n\tHint: Value for key 'b' does not match expected value 'int(2)' but got 'int(1)'".to_string())
        );
    }

    #[test]
    fn nested_type_mismatch_is_explained() {
        let actual = json!({"a": "flat"});
        let expected = json!({"a": {"b": 2}});

        assert_eq!(
            contains_with_reason(actual.as_object(), expected.as_object()),
            Err("For key 'a', expected value of type 'map' but got 'string'".to_string())
        );
    }
}
