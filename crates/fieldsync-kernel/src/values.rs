use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Number, Value};

pub(crate) fn json_to_sql(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

pub(crate) fn sql_to_json(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

/// Column identifiers that are safe to splice into SQL.
pub(crate) fn is_ident(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn booleans_are_stored_as_integers() {
        assert_eq!(json_to_sql(&json!(true)), SqlValue::Integer(1));
        assert_eq!(json_to_sql(&json!(false)), SqlValue::Integer(0));
    }

    #[test]
    fn nested_values_are_stored_as_json_text() {
        assert_eq!(
            json_to_sql(&json!({"a": 1})),
            SqlValue::Text("{\"a\":1}".into())
        );
    }

    #[test]
    fn ident_rejects_injection() {
        assert!(is_ident("area_id"));
        assert!(!is_ident("id; DROP TABLE jobs"));
        assert!(!is_ident("1abc"));
        assert!(!is_ident(""));
    }
}
