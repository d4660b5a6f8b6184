use anyhow::{bail, Error};
use serde_json::Value;

/// Generate canonical json
///
/// Object keys are emitted in sorted order, so that structurally equal
/// values always serialize to the same byte sequence. Used wherever a
/// digest is computed over a json document.
pub fn to_canonical_json(value: &Value) -> Result<Vec<u8>, Error> {
    let mut data = Vec::new();
    write_canonical_json(value, &mut data)?;
    Ok(data)
}

pub fn write_canonical_json(value: &Value, output: &mut Vec<u8>) -> Result<(), Error> {
    match value {
        Value::Null => bail!("got unexpected null value"),
        Value::String(_) | Value::Number(_) | Value::Bool(_) => {
            serde_json::to_writer(output, &value)?;
        }
        Value::Array(list) => {
            output.push(b'[');
            let mut iter = list.iter();
            if let Some(item) = iter.next() {
                write_canonical_json(item, output)?;
                for item in iter {
                    output.push(b',');
                    write_canonical_json(item, output)?;
                }
            }
            output.push(b']');
        }
        Value::Object(map) => {
            output.push(b'{');
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_unstable();
            let mut iter = keys.into_iter();
            if let Some(key) = iter.next() {
                serde_json::to_writer(&mut *output, &key)?;
                output.push(b':');
                write_canonical_json(&map[key], output)?;
                for key in iter {
                    output.push(b',');
                    serde_json::to_writer(&mut *output, &key)?;
                    output.push(b':');
                    write_canonical_json(&map[key], output)?;
                }
            }
            output.push(b'}');
        }
    }
    Ok(())
}

#[test]
fn test_canonical_json_key_order() {
    let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": [2, 3], "x": true}}"#).unwrap();
    let b: Value = serde_json::from_str(r#"{"a": {"x": true, "y": [2, 3]}, "b": 1}"#).unwrap();

    let a = to_canonical_json(&a).unwrap();
    let b = to_canonical_json(&b).unwrap();

    assert_eq!(a, b);
    assert_eq!(a, br#"{"a":{"x":true,"y":[2,3]},"b":1}"#);
}

#[test]
fn test_canonical_json_rejects_null() {
    let value: Value = serde_json::from_str(r#"{"a": null}"#).unwrap();
    assert!(to_canonical_json(&value).is_err());
}
