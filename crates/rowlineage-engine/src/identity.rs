//! Deterministic row identifiers
//!
//! ```text
//! SHA-256(URL namespace ++ canonical_payload(row)) -> first 128 bits -> UUID v8
//! ```
//!
//! The payload encodes every non-trace value in column order as
//! `<tag><byte length>:<text>;` (`n;` for NULL), so no value can bleed into
//! its neighbour whatever characters it contains. Column names are not part
//! of the payload.
//!
//! Numbers are canonicalized by value: `1`, `1.0` and `Decimal("1.00")` all
//! encode as `d1:1;`, and negative zero encodes as `0`.

use chrono::SecondsFormat;
use rowlineage_core::{Row, TraceId, Value, PARENT_TRACE_COLUMN, TRACE_COLUMN};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Version nibble carried by every derived identifier
pub const DERIVED_VERSION: usize = 8;

/// Identifier derivation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeriveError {
    #[error("Column '{column}' has unsupported type {type_name}")]
    UnsupportedColumnType { column: String, type_name: String },
}

/// Derive the trace identifier of a row
pub fn derive(row: &Row) -> Result<TraceId, DeriveError> {
    let payload = canonical_payload(row)?;
    Ok(TraceId::from(uuid_from_payload(payload.as_bytes())))
}

/// Trace id carried by the row, or the derived one when absent
pub fn trace_id_or_derive(row: &Row) -> Result<TraceId, DeriveError> {
    match row.trace_id() {
        Some(id) => Ok(TraceId::new(id)),
        None => derive(row),
    }
}

/// Whether an identifier carries the derived marker
pub fn is_derived(id: &str) -> bool {
    Uuid::parse_str(id)
        .map(|uuid| uuid.get_version_num() == DERIVED_VERSION)
        .unwrap_or(false)
}

/// Canonical text hashed for a row
pub fn canonical_payload(row: &Row) -> Result<String, DeriveError> {
    let mut payload = String::new();

    for (column, value) in &row.columns {
        if is_trace_column(column) {
            continue;
        }
        encode_value(&mut payload, column, value)?;
    }

    Ok(payload)
}

/// Canonical text of one value (used for key matching as well)
pub fn canonical_value(column: &str, value: &Value) -> Result<String, DeriveError> {
    let mut out = String::new();
    encode_value(&mut out, column, value)?;
    Ok(out)
}

fn is_trace_column(column: &str) -> bool {
    column.eq_ignore_ascii_case(TRACE_COLUMN) || column.eq_ignore_ascii_case(PARENT_TRACE_COLUMN)
}

fn uuid_from_payload(payload: &[u8]) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::NAMESPACE_URL.as_bytes());
    hasher.update(payload);
    let hash = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);
    Uuid::new_v8(bytes)
}

fn encode_value(out: &mut String, column: &str, value: &Value) -> Result<(), DeriveError> {
    let (tag, text) = match value {
        Value::Null => {
            out.push_str("n;");
            return Ok(());
        }
        Value::Bool(b) => ('b', if *b { "1" } else { "0" }.to_string()),
        Value::Int(i) => ('d', i.to_string()),
        Value::Float(f) => ('d', canonical_float(column, *f)?),
        Value::Decimal(d) => ('d', canonical_decimal(d.normalize().to_string())),
        Value::Text(s) => ('s', s.clone()),
        Value::Date(d) => ('D', d.format("%Y-%m-%d").to_string()),
        Value::Timestamp(ts) => ('t', ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
        Value::Bytes(b) => ('x', hex::encode(b)),
        Value::Json(j) => ('j', canonical_json(j)),
        Value::Unsupported { type_name } => {
            return Err(DeriveError::UnsupportedColumnType {
                column: column.to_string(),
                type_name: type_name.clone(),
            })
        }
    };

    out.push(tag);
    out.push_str(&text.len().to_string());
    out.push(':');
    out.push_str(&text);
    out.push(';');
    Ok(())
}

fn canonical_float(column: &str, f: f64) -> Result<String, DeriveError> {
    if !f.is_finite() {
        return Err(DeriveError::UnsupportedColumnType {
            column: column.to_string(),
            type_name: format!("float({})", f),
        });
    }
    if f == 0.0 {
        return Ok("0".to_string());
    }
    // Shortest round-trip form, never exponent notation
    Ok(format!("{}", f))
}

fn canonical_decimal(text: String) -> String {
    if text == "-0" {
        "0".to_string()
    } else {
        text
    }
}

/// JSON with object keys sorted at every level
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(key.clone()),
                        canonical_json(&map[key])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::str::FromStr;

    fn ann() -> Row {
        Row::new().with("id", 1i64).with("name", "ann")
    }

    #[test]
    fn derive_is_deterministic() {
        let first = derive(&ann()).unwrap();
        let second = derive(&ann()).unwrap();
        assert_eq!(first, second);
        assert!(is_derived(first.as_str()));
    }

    #[test]
    fn pinned_payload() {
        // Guards against accidental changes of the payload encoding
        assert_eq!(canonical_payload(&ann()).unwrap(), "d1:1;s3:ann;");
    }

    #[test]
    fn trace_columns_are_ignored() {
        let traced = ann()
            .with(TRACE_COLUMN, "whatever")
            .with(PARENT_TRACE_COLUMN, Value::Json(json!(["a:b"])));
        assert_eq!(canonical_payload(&traced).unwrap(), canonical_payload(&ann()).unwrap());
    }

    #[test]
    fn numbers_are_canonical() {
        let int = Row::new().with("v", 1i64);
        let float = Row::new().with("v", 1.0f64);
        let decimal = Row::new().with("v", Decimal::from_str("1.00").unwrap());
        assert_eq!(derive(&int).unwrap(), derive(&float).unwrap());
        assert_eq!(derive(&int).unwrap(), derive(&decimal).unwrap());

        let neg_zero = Row::new().with("v", -0.0f64);
        let zero = Row::new().with("v", 0i64);
        assert_eq!(derive(&neg_zero).unwrap(), derive(&zero).unwrap());

        let half = Row::new().with("v", 0.5f64);
        let half_dec = Row::new().with("v", Decimal::from_str("0.50").unwrap());
        assert_eq!(derive(&half).unwrap(), derive(&half_dec).unwrap());
    }

    #[test]
    fn null_differs_from_text() {
        let null = Row::new().with("v", Value::Null);
        let marker = Row::new().with("v", "<null>");
        let empty = Row::new().with("v", "");
        assert_ne!(derive(&null).unwrap(), derive(&marker).unwrap());
        assert_ne!(derive(&null).unwrap(), derive(&empty).unwrap());
    }

    #[test]
    fn delimiter_is_unambiguous() {
        let a = Row::new().with("x", "a;s1:b").with("y", "c");
        let b = Row::new().with("x", "a").with("y", "b;s1:c");
        assert_ne!(derive(&a).unwrap(), derive(&b).unwrap());
    }

    #[test]
    fn column_order_matters() {
        let ab = Row::new().with("a", "x").with("b", "y");
        let ba = Row::new().with("b", "y").with("a", "x");
        assert_ne!(derive(&ab).unwrap(), derive(&ba).unwrap());
    }

    #[test]
    fn temporal_and_json_values() {
        let row = Row::new()
            .with("d", Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()))
            .with("t", Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()))
            .with("j", Value::Json(json!({"b": 1, "a": [true, null]})));

        assert_eq!(
            canonical_payload(&row).unwrap(),
            "D10:2024-02-29;t27:2024-01-01T00:00:00.000000Z;j23:{\"a\":[true,null],\"b\":1};"
        );

        let reordered = Row::new()
            .with("d", Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()))
            .with("t", Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()))
            .with("j", Value::Json(json!({"a": [true, null], "b": 1})));
        assert_eq!(derive(&row).unwrap(), derive(&reordered).unwrap());
    }

    #[test]
    fn unsupported_values_fail() {
        let row = Row::new().with(
            "shape",
            Value::Unsupported {
                type_name: "geometry".to_string(),
            },
        );
        assert_eq!(
            derive(&row).unwrap_err(),
            DeriveError::UnsupportedColumnType {
                column: "shape".to_string(),
                type_name: "geometry".to_string(),
            }
        );

        let nan = Row::new().with("v", f64::NAN);
        assert!(matches!(derive(&nan), Err(DeriveError::UnsupportedColumnType { .. })));
    }

    #[test]
    fn existing_trace_id_wins() {
        let row = ann().with(TRACE_COLUMN, "3f1c0b9e-1111-4111-8111-000000000001");
        assert_eq!(
            trace_id_or_derive(&row).unwrap().as_str(),
            "3f1c0b9e-1111-4111-8111-000000000001"
        );
        assert!(!is_derived("3f1c0b9e-1111-4111-8111-000000000001"));
    }
}
