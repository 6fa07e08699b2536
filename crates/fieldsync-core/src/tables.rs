//! Per-table rules for turning local rows into remote payloads.

use fieldsync_kernel::{Record, Table};
use serde_json::Value;

/// How a mirrored table's rows differ between the device and the remote schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteShape {
    /// Flags kept as booleans or 0/1 locally that the remote expects as integers.
    pub int_flags: &'static [&'static str],
    /// Columns that exist only for on-device ordering.
    pub local_fields: &'static [&'static str],
}

/// Applied to tables this build does not know: nothing is coerced, but
/// on-device ordering still stays local.
pub const UNKNOWN_TABLE_SHAPE: RemoteShape = RemoteShape {
    int_flags: &[],
    local_fields: &["local_sort"],
};

/// Where a logged mutation points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationTarget {
    Known(Table),
    Unknown(String),
}

impl MutationTarget {
    pub fn resolve(name: &str) -> Self {
        match Table::parse(name) {
            Some(t) => MutationTarget::Known(t),
            None => MutationTarget::Unknown(name.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            MutationTarget::Known(t) => t.as_str(),
            MutationTarget::Unknown(name) => name,
        }
    }
}

/// Remote shape of a table, or `None` when it has no remote counterpart.
pub fn remote_shape(table: Table) -> Option<RemoteShape> {
    match table {
        Table::Jobs => Some(RemoteShape {
            int_flags: &["archived"],
            local_fields: &["local_sort"],
        }),
        Table::Floors | Table::Units | Table::Areas => Some(RemoteShape {
            int_flags: &[],
            local_fields: &["local_sort"],
        }),
        Table::ChecklistItems => Some(RemoteShape {
            int_flags: &["requires_photo"],
            local_fields: &["local_sort"],
        }),
        Table::Photos => Some(RemoteShape {
            int_flags: &[],
            local_fields: &[],
        }),
        Table::Issues => Some(RemoteShape {
            int_flags: &["is_blocking", "resolved"],
            local_fields: &["local_sort"],
        }),
        Table::TimeLogs => Some(RemoteShape {
            int_flags: &["billable"],
            local_fields: &[],
        }),
        Table::PendingAssets | Table::ProvisionalChecklistItems | Table::MutationLog => None,
    }
}

fn as_int_flag(v: &Value) -> Value {
    match v {
        Value::Bool(b) => Value::from(i64::from(*b)),
        Value::Number(n) => {
            let truthy = n.as_f64().map(|f| f != 0.0).unwrap_or(false);
            Value::from(i64::from(truthy))
        }
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Value::from(1),
            "0" | "false" | "no" | "" => Value::from(0),
            _ => v.clone(),
        },
        other => other.clone(),
    }
}

/// Apply the table's coercion and stripping rules to an outbound payload.
pub fn shape_payload(shape: &RemoteShape, payload: &Record) -> Record {
    payload
        .iter()
        .filter(|(k, _)| !shape.local_fields.contains(&k.as_str()))
        .map(|(k, v)| {
            if shape.int_flags.contains(&k.as_str()) {
                (k.clone(), as_int_flag(v))
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn local_only_tables_have_no_shape() {
        for t in Table::ALL {
            assert_eq!(remote_shape(t).is_none(), t.is_local_only(), "{t}");
        }
    }

    #[test]
    fn shape_rules_only_name_real_columns() {
        for t in Table::ALL {
            if let Some(shape) = remote_shape(t) {
                for col in shape.int_flags.iter().chain(shape.local_fields) {
                    assert!(t.has_column(col), "{t}.{col}");
                }
            }
        }
    }

    #[test]
    fn flags_become_integers_and_sort_keys_are_stripped() {
        let shape = remote_shape(Table::Issues).unwrap();
        let payload = json!({
            "id": "i1",
            "is_blocking": true,
            "resolved": 0,
            "local_sort": 4,
            "title": "Leak"
        });
        let out = shape_payload(&shape, payload.as_object().unwrap());
        assert_eq!(out["is_blocking"], json!(1));
        assert_eq!(out["resolved"], json!(0));
        assert_eq!(out["title"], "Leak");
        assert!(!out.contains_key("local_sort"));
    }

    #[test]
    fn unknown_names_resolve_to_fallback() {
        assert_eq!(
            MutationTarget::resolve("areas"),
            MutationTarget::Known(Table::Areas)
        );
        let other = MutationTarget::resolve("signatures");
        assert_eq!(other, MutationTarget::Unknown("signatures".into()));
        assert_eq!(other.name(), "signatures");
    }
}
