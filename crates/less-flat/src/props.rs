//! Per-node property maps and their JSON encoding inside the property blob.
//!
//! String values never appear inline in the blob; they are stored as `{"$str": index}`
//! references into the FlatAST string table.
use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};

use crate::error::CodecError;
use crate::strings::StringTable;

const STRING_REF_KEY: &str = "$str";

pub type Properties = BTreeMap<String, PropertyValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<PropertyValue>),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Plain JSON form with strings inlined, as used on the byte-stream path.
    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::Null => Value::Null,
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Number(n) => Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null),
            PropertyValue::String(s) => Value::String(s.clone()),
            PropertyValue::Array(items) => Value::Array(items.iter().map(PropertyValue::to_json).collect()),
        }
    }

    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => PropertyValue::Null,
            Value::Bool(b) => PropertyValue::Bool(*b),
            Value::Number(n) => n.as_f64().map(PropertyValue::Number).unwrap_or(PropertyValue::Null),
            Value::String(s) => PropertyValue::String(s.clone()),
            Value::Array(items) => PropertyValue::Array(items.iter().map(PropertyValue::from_json).collect()),
            Value::Object(_) => PropertyValue::String(value.to_string()),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

pub(crate) fn encode_properties(
    properties: &[(String, PropertyValue)],
    strings: &mut StringTable,
) -> Result<Vec<u8>, CodecError> {
    if properties.is_empty() {
        return Ok(Vec::new());
    }

    let map = properties
        .iter()
        .map(|(key, value)| (key.clone(), encode_value(value, strings)))
        .collect::<Map<String, Value>>();
    Ok(serde_json::to_vec(&Value::Object(map))?)
}

fn encode_value(value: &PropertyValue, strings: &mut StringTable) -> Value {
    match value {
        PropertyValue::String(s) => {
            let mut reference = Map::with_capacity(1);
            reference.insert(STRING_REF_KEY.to_string(), Value::from(strings.intern(s)));
            Value::Object(reference)
        }
        PropertyValue::Array(items) => Value::Array(items.iter().map(|item| encode_value(item, strings)).collect()),
        other => other.to_json(),
    }
}

pub(crate) fn decode_properties(bytes: &[u8], strings: &StringTable) -> Result<Properties, CodecError> {
    if bytes.is_empty() {
        return Ok(Properties::new());
    }

    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| Ok::<_, CodecError>((key.clone(), decode_value(value, strings)?)))
            .collect(),
        _ => Ok(Properties::new()),
    }
}

fn decode_value(value: &Value, strings: &StringTable) -> Result<PropertyValue, CodecError> {
    match value {
        Value::Object(map) => match map.get(STRING_REF_KEY).and_then(Value::as_u64) {
            Some(index) => {
                let index = u32::try_from(index).map_err(|_| CodecError::StringIndexOutOfRange(u32::MAX))?;
                strings
                    .get(index)
                    .map(|s| PropertyValue::String(s.to_string()))
                    .ok_or(CodecError::StringIndexOutOfRange(index))
            }
            None => Ok(PropertyValue::from_json(value)),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| decode_value(item, strings))
            .collect::<Result<Vec<_>, _>>()
            .map(PropertyValue::Array),
        other => Ok(PropertyValue::from_json(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strings_go_through_table() {
        let mut strings = StringTable::new();
        let props = vec![
            ("unit".to_string(), PropertyValue::from("px")),
            ("value".to_string(), PropertyValue::Number(10.0)),
        ];
        let bytes = encode_properties(&props, &mut strings).unwrap();
        let raw = String::from_utf8(bytes.clone()).unwrap();
        assert!(!raw.contains("px"));
        assert_eq!(strings.index_of("px"), Some(0));

        let decoded = decode_properties(&bytes, &strings).unwrap();
        assert_eq!(decoded.get("unit"), Some(&PropertyValue::from("px")));
        assert_eq!(decoded.get("value"), Some(&PropertyValue::Number(10.0)));
    }

    #[test]
    fn test_nested_arrays() {
        let mut strings = StringTable::new();
        let props = vec![(
            "rgb".to_string(),
            PropertyValue::Array(vec![
                PropertyValue::Number(1.0),
                PropertyValue::from("x"),
                PropertyValue::Array(vec![PropertyValue::Bool(true), PropertyValue::Null]),
            ]),
        )];
        let bytes = encode_properties(&props, &mut strings).unwrap();
        let decoded = decode_properties(&bytes, &strings).unwrap();
        assert_eq!(decoded.get("rgb"), Some(&props[0].1));
    }

    #[test]
    fn test_dangling_string_reference() {
        let strings = StringTable::new();
        let err = decode_properties(br#"{"unit":{"$str":3}}"#, &strings).unwrap_err();
        assert!(matches!(err, CodecError::StringIndexOutOfRange(3)));
    }

    #[test]
    fn test_empty_blob_is_empty_map() {
        assert!(decode_properties(&[], &StringTable::new()).unwrap().is_empty());
    }
}
