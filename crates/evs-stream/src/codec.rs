//! Recursive payload codec.
//!
//! Replaces live stream handles with serializable references on the way out
//! and rebuilds fresh stream stubs on the way in. The codec never registers
//! anything itself; every stream it meets is reported to the caller.

use std::collections::BTreeMap;

use crate::stream::{DuplexStream, StreamId, StreamOptions};
use crate::value::Value;

/// Marker key of an encoded stream reference.
pub const STREAM_KEY: &str = "$stream";

/// Key carrying the stream options inside a reference.
pub const OPTIONS_KEY: &str = "options";

/// Replace every stream in `value` by its encoded reference.
pub fn encode(value: Value, on_stream: &mut dyn FnMut(&DuplexStream)) -> Value {
    match value {
        Value::Stream(stream) => encode_stream(&stream, on_stream),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode(item, on_stream));
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let mut out = BTreeMap::new();
            for (key, item) in map {
                out.insert(key, encode(item, on_stream));
            }
            Value::Object(out)
        }
        other => other,
    }
}

fn encode_stream(stream: &DuplexStream, on_stream: &mut dyn FnMut(&DuplexStream)) -> Value {
    on_stream(stream);

    let mut reference = BTreeMap::new();
    reference.insert(
        STREAM_KEY.to_string(),
        Value::String(stream.id().to_string()),
    );
    reference.insert(OPTIONS_KEY.to_string(), stream.options().to_value());
    Value::Object(reference)
}

/// Replace every encoded reference in `value` by a new stream stub.
pub fn decode(value: Value, on_stream: &mut dyn FnMut(&DuplexStream)) -> Value {
    match value {
        Value::Object(map) => {
            let id = match map.get(STREAM_KEY) {
                Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
                _ => None,
            };
            if let Some(id) = id {
                return decode_stream(id, map.get(OPTIONS_KEY), on_stream);
            }

            let mut out = BTreeMap::new();
            for (key, item) in map {
                out.insert(key, decode(item, on_stream));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(decode(item, on_stream));
            }
            Value::Array(out)
        }
        other => other,
    }
}

fn decode_stream(
    id: String,
    options: Option<&Value>,
    on_stream: &mut dyn FnMut(&DuplexStream),
) -> Value {
    let stream = DuplexStream::with_id(StreamId::from(id), StreamOptions::from_value(options));
    on_stream(&stream);
    Value::Stream(stream)
}

/// Encode an argument list.
pub fn encode_args(args: Vec<Value>, on_stream: &mut dyn FnMut(&DuplexStream)) -> Vec<Value> {
    args.into_iter().map(|arg| encode(arg, on_stream)).collect()
}

/// Decode an argument list.
pub fn decode_args(args: Vec<Value>, on_stream: &mut dyn FnMut(&DuplexStream)) -> Vec<Value> {
    args.into_iter().map(|arg| decode(arg, on_stream)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;
    use serde_json::json;

    fn no_streams(_: &DuplexStream) {
        panic!("unexpected stream");
    }

    #[test]
    fn test_scalars_pass_through() {
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::from(42u64),
            Value::from("text"),
            Value::Bytes(Bytes::from_static(b"\x00\x01")),
        ] {
            assert_eq!(encode(v.clone(), &mut no_streams), v);
            assert_eq!(decode(v.clone(), &mut no_streams), v);
        }
    }

    #[test]
    fn test_encode_nested_stream() {
        let stream = DuplexStream::new(StreamOptions::default());
        let payload = Value::from(vec![
            Value::from("hi"),
            Value::Object(BTreeMap::from([("file".to_string(), Value::Stream(stream.clone()))])),
        ]);

        let mut seen = Vec::new();
        let encoded = encode(payload, &mut |s| seen.push(s.id().clone()));
        assert_eq!(seen, vec![stream.id().clone()]);

        let json = encoded.to_json().unwrap();
        assert_eq!(json[0], json!("hi"));
        assert_eq!(json[1]["file"]["$stream"], json!(stream.id().as_str()));
        assert_eq!(json[1]["file"]["options"]["allowHalfOpen"], json!(false));
    }

    #[test]
    fn test_decode_builds_fresh_stub() {
        let encoded = Value::from(json!({"$stream": "abc", "options": {"allowHalfOpen": true}}));
        let mut found = Vec::new();
        let decoded = decode(encoded, &mut |s| found.push(s.clone()));

        let stream = decoded.as_stream().unwrap();
        assert_eq!(stream.id().as_str(), "abc");
        assert!(stream.options().allow_half_open);
        assert_eq!(found.len(), 1);
        assert!(found[0].ptr_eq(stream));
        assert!(!stream.is_attached());
    }

    #[test]
    fn test_marker_must_be_string() {
        let v = Value::from(json!({"$stream": 5, "x": 1}));
        assert_eq!(decode(v.clone(), &mut no_streams), v);
        let v = Value::from(json!({"$stream": ""}));
        assert_eq!(decode(v.clone(), &mut no_streams), v);
    }

    #[test]
    fn test_missing_options_default() {
        let decoded = decode(Value::from(json!({"$stream": "id-1"})), &mut |_| {});
        assert_eq!(decoded.as_stream().unwrap().options(), &StreamOptions::default());
    }

    #[test]
    fn test_oversized_high_water_mark_is_clamped() {
        use crate::stream::MAX_HIGH_WATER_MARK;

        let encoded = Value::from(json!({
            "$stream": "big",
            "options": {"highWaterMark": 1_000_000_000_000_000_000u64}
        }));
        let decoded = decode(encoded, &mut |_| {});
        assert_eq!(
            decoded.as_stream().unwrap().options().high_water_mark,
            MAX_HIGH_WATER_MARK
        );

        let zero = decode(
            Value::from(json!({"$stream": "zero", "options": {"highWaterMark": 0}})),
            &mut |_| {},
        );
        assert_eq!(zero.as_stream().unwrap().options().high_water_mark, 1);
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<u64>().prop_map(Value::from),
            "[a-z]{0,8}".prop_map(Value::from),
            (any::<bool>(), 1usize..65536).prop_map(|(half_open, hwm)| {
                Value::Stream(DuplexStream::new(StreamOptions {
                    allow_half_open: half_open,
                    high_water_mark: hwm,
                    ..StreamOptions::default()
                }))
            }),
        ]
    }

    fn payload() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(4, 64, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..6).prop_map(Value::Object),
            ]
        })
    }

    fn count_streams(v: &Value) -> usize {
        match v {
            Value::Stream(_) => 1,
            Value::Array(items) => items.iter().map(count_streams).sum(),
            Value::Object(map) => map.values().map(count_streams).sum(),
            _ => 0,
        }
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(original in payload()) {
            let mut encoded_count = 0;
            let encoded = encode(original.clone(), &mut |_| encoded_count += 1);
            prop_assert_eq!(count_streams(&encoded), 0);

            let mut decoded_count = 0;
            let decoded = decode(encoded, &mut |_| decoded_count += 1);
            prop_assert_eq!(encoded_count, decoded_count);
            prop_assert_eq!(encoded_count, count_streams(&original));
            // Streams compare by id and options.
            prop_assert_eq!(decoded, original);
        }
    }
}
