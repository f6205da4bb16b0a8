use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A value bound to a named placeholder. Never interpolated into SQL text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum BindParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    List(Vec<BindParam>),
}

impl BindParam {
    pub fn is_null(&self) -> bool {
        matches!(self, BindParam::Null)
    }

    pub fn as_list(&self) -> Option<&[BindParam]> {
        match self {
            BindParam::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BindParam::Null => "null",
            BindParam::Bool(_) => "bool",
            BindParam::Int(_) => "int",
            BindParam::Float(_) => "float",
            BindParam::Text(_) => "text",
            BindParam::Timestamp(_) => "timestamp",
            BindParam::List(_) => "list",
        }
    }

    /// Decodes a JSON value. Strings always stay text; the only object
    /// accepted is the explicit `{"t": "timestamp", "v": "<rfc3339>"}` tag.
    pub fn from_json(value: Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(BindParam::Null),
            Value::Bool(flag) => Ok(BindParam::Bool(flag)),
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    Ok(BindParam::Int(int))
                } else if let Some(float) = number.as_f64() {
                    Ok(BindParam::Float(float))
                } else {
                    Err(format!("unsupported number {number}"))
                }
            }
            Value::String(text) => Ok(BindParam::Text(text)),
            Value::Array(items) => items
                .into_iter()
                .map(BindParam::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(BindParam::List),
            Value::Object(object) => match (object.get("t"), object.get("v")) {
                (Some(Value::String(tag)), Some(Value::String(text)))
                    if tag == "timestamp" && object.len() == 2 =>
                {
                    DateTime::parse_from_rfc3339(text)
                        .map(|ts| BindParam::Timestamp(ts.with_timezone(&Utc)))
                        .map_err(|err| format!("invalid timestamp '{text}': {err}"))
                }
                _ => Err("filter values must be scalars or lists".to_string()),
            },
        }
    }
}

impl<'de> Deserialize<'de> for BindParam {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        BindParam::from_json(value).map_err(serde::de::Error::custom)
    }
}

impl From<bool> for BindParam {
    fn from(value: bool) -> Self {
        BindParam::Bool(value)
    }
}

impl From<i64> for BindParam {
    fn from(value: i64) -> Self {
        BindParam::Int(value)
    }
}

impl From<f64> for BindParam {
    fn from(value: f64) -> Self {
        BindParam::Float(value)
    }
}

impl From<&str> for BindParam {
    fn from(value: &str) -> Self {
        BindParam::Text(value.to_string())
    }
}

impl From<String> for BindParam {
    fn from(value: String) -> Self {
        BindParam::Text(value)
    }
}

impl<T: Into<BindParam>> From<Vec<T>> for BindParam {
    fn from(values: Vec<T>) -> Self {
        BindParam::List(values.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_json_scalars_and_lists() {
        let decoded: BindParam = serde_json::from_value(json!([2024, "EU", 1.5, null])).unwrap();
        assert_eq!(
            decoded,
            BindParam::List(vec![
                BindParam::Int(2024),
                BindParam::Text("EU".into()),
                BindParam::Float(1.5),
                BindParam::Null,
            ])
        );
    }

    #[test]
    fn timestamp_shaped_strings_stay_text() {
        let decoded: BindParam = serde_json::from_value(json!("2024-03-01T00:00:00Z")).unwrap();
        assert_eq!(decoded, BindParam::Text("2024-03-01T00:00:00Z".into()));
    }

    #[test]
    fn tagged_objects_become_timestamps() {
        let decoded: BindParam =
            serde_json::from_value(json!({"t": "timestamp", "v": "2024-03-01T12:30:00+02:00"}))
                .unwrap();
        let BindParam::Timestamp(ts) = decoded else {
            panic!("expected timestamp, got {decoded:?}");
        };
        assert_eq!(ts.to_rfc3339(), "2024-03-01T10:30:00+00:00");

        let err = serde_json::from_value::<BindParam>(json!({"t": "timestamp", "v": "yesterday"}))
            .unwrap_err();
        assert!(err.to_string().contains("invalid timestamp"));
    }

    #[test]
    fn objects_are_refused() {
        let err = serde_json::from_value::<BindParam>(json!({"a": 1})).unwrap_err();
        assert!(err.to_string().contains("scalars or lists"));
        let err = serde_json::from_value::<BindParam>(json!({"t": "int", "v": 1})).unwrap_err();
        assert!(err.to_string().contains("scalars or lists"));
    }

    #[test]
    fn serializes_tagged() {
        let encoded = serde_json::to_value(BindParam::Int(7)).unwrap();
        assert_eq!(encoded, json!({"t": "int", "v": 7}));
    }
}
