//! HTTP-facing codec layer: converts wire bytes (JSON or
//! `application/x-www-form-urlencoded`) plus path parameters into a
//! dynamically-typed message, and back.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use prost_reflect::{DeserializeOptions, DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, SerializeOptions, Value};

use crate::error::{ProxyError, Result};

/// A single registered wire format.
pub trait HttpCodec: Send + Sync {
    /// MIME subtype this codec is registered under (`"json"`, `"x-www-form-urlencoded"`).
    fn subtype(&self) -> &'static str;

    fn marshal(&self, msg: &DynamicMessage) -> Result<Vec<u8>>;

    fn unmarshal(
        &self,
        data: &[u8],
        path_params: &BTreeMap<String, String>,
        desc: &MessageDescriptor,
        allow_unknown_fields: bool,
    ) -> Result<DynamicMessage>;
}

/// A per-proxy set of registered codecs. Deliberately not global state: the
/// reference design registers codecs at process start, which couples
/// unrelated proxy instances and races at init. Each `Proxy` owns one.
pub struct CodecSet {
    json: JsonCodec,
    form: FormCodec,
}

impl Default for CodecSet {
    fn default() -> Self {
        CodecSet {
            json: JsonCodec,
            form: FormCodec,
        }
    }
}

impl CodecSet {
    pub fn by_subtype(&self, subtype: &str) -> Option<&dyn HttpCodec> {
        match subtype {
            "json" => Some(&self.json),
            "x-www-form-urlencoded" => Some(&self.form),
            _ => None,
        }
    }

    /// `json`, unconditionally: the only codec this proxy ever marshals a
    /// response through.
    pub fn json(&self) -> &JsonCodec {
        &self.json
    }
}

/// Extracts the MIME subtype from a `Content-Type`/`Accept`-style header
/// value: the substring between `/` and `;` (or to end-of-string).
pub fn content_subtype(header_value: &str) -> &str {
    let after_slash = match header_value.find('/') {
        Some(i) => &header_value[i + 1..],
        None => return "",
    };
    match after_slash.find(';') {
        Some(i) => after_slash[..i].trim(),
        None => after_slash.trim(),
    }
}

/// Decodes a single scalar value from its string form per the field's wire
/// type. Never fails for scalar kinds: parse failures yield the kind's zero
/// value. Returns `None` for message/group kinds, which are undefined here
/// and should be skipped by the caller.
pub fn decode_scalar(field: &FieldDescriptor, s: &str) -> Option<Value> {
    Some(match field.kind() {
        Kind::Enum(e) => {
            let number = e.values().find(|v| v.name() == s).map(|v| v.number()).unwrap_or(0);
            Value::EnumNumber(number)
        }
        Kind::Bool => Value::Bool(parse_bool_lenient(s).unwrap_or(false)),
        Kind::Bytes => Value::Bytes(s.as_bytes().to_vec().into()),
        Kind::String => Value::String(s.to_string()),
        Kind::Float => Value::F32(s.parse::<f32>().unwrap_or(0.0)),
        Kind::Double => Value::F64(s.parse::<f64>().unwrap_or(0.0)),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => Value::I32(s.parse::<i32>().unwrap_or(0)),
        Kind::Uint32 | Kind::Fixed32 => Value::U32(s.parse::<u32>().unwrap_or(0)),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => Value::I64(s.parse::<i64>().unwrap_or(0)),
        Kind::Uint64 | Kind::Fixed64 => Value::U64(s.parse::<u64>().unwrap_or(0)),
        Kind::Message(_) => return None,
    })
}

/// Accepts the boolean literal spellings `strconv.ParseBool` accepts, since
/// form/query values are conventionally produced by clients following that
/// convention.
fn parse_bool_lenient(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn set_path_params(msg: &mut DynamicMessage, desc: &MessageDescriptor, path_params: &BTreeMap<String, String>) {
    for (key, value) in path_params {
        if let Some(field) = desc.get_field_by_name(key) {
            if let Some(val) = decode_scalar(&field, value) {
                if let Err(e) = msg.try_set_field(&field, val) {
                    tracing::warn!(field = %key, error = %e, "failed to set path parameter during unmarshal");
                }
            }
        }
    }
}

/// JSON-protobuf codec.
pub struct JsonCodec;

impl HttpCodec for JsonCodec {
    fn subtype(&self) -> &'static str {
        "json"
    }

    fn marshal(&self, msg: &DynamicMessage) -> Result<Vec<u8>> {
        let options = SerializeOptions::new()
            .use_proto_field_name(true)
            .skip_default_fields(false);
        let mut buf = Vec::new();
        let mut serializer = serde_json::Serializer::new(&mut buf);
        msg.serialize_with_options(&mut serializer, &options)
            .map_err(|e| ProxyError::Codec(format!("failed to marshal JSON response: {e}")))?;
        Ok(buf)
    }

    fn unmarshal(
        &self,
        data: &[u8],
        path_params: &BTreeMap<String, String>,
        desc: &MessageDescriptor,
        allow_unknown_fields: bool,
    ) -> Result<DynamicMessage> {
        let mut msg = DynamicMessage::new(desc.clone());
        set_path_params(&mut msg, desc, path_params);

        if data.is_empty() {
            return Ok(msg);
        }

        let de_options = DeserializeOptions::new().deny_unknown_fields(!allow_unknown_fields);
        let mut deserializer = serde_json::Deserializer::from_slice(data);
        let body_msg = DynamicMessage::deserialize_with_options(desc.clone(), &mut deserializer, &de_options)
            .map_err(|e| ProxyError::Codec(format!("invalid JSON body: {e}")))?;

        // Body JSON overrides only the fields it actually specifies; fields
        // the path already set and the body is silent on survive untouched.
        for field in desc.fields() {
            if body_msg.has_field(&field) {
                msg.set_field(&field, body_msg.get_field(&field).into_owned());
            }
        }
        Ok(msg)
    }
}

/// `application/x-www-form-urlencoded` codec.
pub struct FormCodec;

impl HttpCodec for FormCodec {
    fn subtype(&self) -> &'static str {
        "x-www-form-urlencoded"
    }

    fn marshal(&self, _msg: &DynamicMessage) -> Result<Vec<u8>> {
        Err(ProxyError::Codec(
            "the form codec cannot marshal a response; responses are always JSON".to_string(),
        ))
    }

    fn unmarshal(
        &self,
        data: &[u8],
        path_params: &BTreeMap<String, String>,
        desc: &MessageDescriptor,
        allow_unknown_fields: bool,
    ) -> Result<DynamicMessage> {
        let mut msg = DynamicMessage::new(desc.clone());

        let mut pairs: IndexMap<String, Vec<String>> = IndexMap::new();
        for (k, v) in url::form_urlencoded::parse(data) {
            pairs.entry(k.into_owned()).or_default().push(v.into_owned());
        }
        // Path parameters take precedence on key collision.
        for (k, v) in path_params {
            pairs.insert(k.clone(), vec![v.clone()]);
        }

        for (key, values) in &pairs {
            if values.is_empty() {
                continue;
            }
            let field = match desc.get_field_by_name(key) {
                Some(f) => f,
                None => match desc.fields().find(|f| f.json_name() == key) {
                    Some(f) => f,
                    None => {
                        if allow_unknown_fields {
                            continue;
                        }
                        return Err(ProxyError::Codec(format!(
                            "message type {} has no known field named {key}",
                            desc.full_name()
                        )));
                    }
                },
            };

            if field.is_list() {
                let list: Vec<Value> = values.iter().filter_map(|v| decode_scalar(&field, v)).collect();
                if let Err(e) = msg.try_set_field(&field, Value::List(list)) {
                    tracing::warn!(field = %key, error = %e, "failed to set repeated field during unmarshal");
                }
            } else if let Some(first) = values.first() {
                if let Some(val) = decode_scalar(&field, first) {
                    if let Err(e) = msg.try_set_field(&field, val) {
                        tracing::warn!(field = %key, error = %e, "failed to set field during unmarshal");
                    }
                }
            }
        }

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::DescriptorPool;

    fn test_descriptor() -> MessageDescriptor {
        let fds = prost_types::FileDescriptorSet {
            file: vec![prost_types::FileDescriptorProto {
                name: Some("item.proto".into()),
                package: Some("test.v1".into()),
                message_type: vec![prost_types::DescriptorProto {
                    name: Some("Item".into()),
                    field: vec![
                        prost_types::FieldDescriptorProto {
                            name: Some("id".into()),
                            number: Some(1),
                            r#type: Some(3), // TYPE_INT64
                            label: Some(1),
                            json_name: Some("id".into()),
                            ..Default::default()
                        },
                        prost_types::FieldDescriptorProto {
                            name: Some("tags".into()),
                            number: Some(2),
                            r#type: Some(9), // TYPE_STRING
                            label: Some(3), // LABEL_REPEATED
                            json_name: Some("tags".into()),
                            ..Default::default()
                        },
                        prost_types::FieldDescriptorProto {
                            name: Some("name".into()),
                            number: Some(3),
                            r#type: Some(9),
                            label: Some(1),
                            json_name: Some("name".into()),
                            ..Default::default()
                        },
                        prost_types::FieldDescriptorProto {
                            name: Some("verbose".into()),
                            number: Some(4),
                            r#type: Some(8), // TYPE_BOOL
                            label: Some(1),
                            json_name: Some("verbose".into()),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
                syntax: Some("proto3".into()),
                ..Default::default()
            }],
        };
        let pool = DescriptorPool::from_file_descriptor_set(fds).expect("valid test descriptor set");
        pool.get_message_by_name("test.v1.Item").expect("Item message present")
    }

    #[test]
    fn content_subtype_extraction() {
        assert_eq!(content_subtype("application/json; charset=utf-8"), "json");
        assert_eq!(content_subtype("application/json"), "json");
        assert_eq!(
            content_subtype("application/x-www-form-urlencoded"),
            "x-www-form-urlencoded"
        );
        assert_eq!(content_subtype("garbage"), "");
    }

    #[test]
    fn json_unmarshal_merges_path_params_and_body() {
        let desc = test_descriptor();
        let mut path_params = BTreeMap::new();
        path_params.insert("id".to_string(), "7".to_string());
        let body = br#"{"tags":["a","b"]}"#;
        let msg = JsonCodec
            .unmarshal(body, &path_params, &desc, true)
            .expect("unmarshal succeeds");

        let id_field = desc.get_field_by_name("id").unwrap();
        assert_eq!(msg.get_field(&id_field).as_i64(), Some(7));

        let tags_field = desc.get_field_by_name("tags").unwrap();
        let tags = msg.get_field(&tags_field);
        let list = tags.as_list().unwrap();
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn json_body_field_overrides_path_param() {
        let desc = test_descriptor();
        let mut path_params = BTreeMap::new();
        path_params.insert("id".to_string(), "7".to_string());
        let body = br#"{"id":"99"}"#;
        let msg = JsonCodec.unmarshal(body, &path_params, &desc, true).unwrap();
        let id_field = desc.get_field_by_name("id").unwrap();
        assert_eq!(msg.get_field(&id_field).as_i64(), Some(99));
    }

    #[test]
    fn form_unmarshal_repeated_field_preserves_order() {
        let desc = test_descriptor();
        let msg = FormCodec
            .unmarshal(b"id=7&tags=a&tags=b", &BTreeMap::new(), &desc, true)
            .unwrap();
        let tags_field = desc.get_field_by_name("tags").unwrap();
        let tags = msg.get_field(&tags_field);
        let list = tags.as_list().unwrap();
        assert_eq!(list[0].as_str(), Some("a"));
        assert_eq!(list[1].as_str(), Some("b"));
    }

    #[test]
    fn form_path_param_overrides_query_collision() {
        let desc = test_descriptor();
        let mut path_params = BTreeMap::new();
        path_params.insert("id".to_string(), "42".to_string());
        let msg = FormCodec.unmarshal(b"id=7", &path_params, &desc, true).unwrap();
        let id_field = desc.get_field_by_name("id").unwrap();
        assert_eq!(msg.get_field(&id_field).as_i64(), Some(42));
    }

    #[test]
    fn form_unknown_field_strict_mode_fails() {
        let desc = test_descriptor();
        let result = FormCodec.unmarshal(b"bogus=1", &BTreeMap::new(), &desc, false);
        assert!(result.is_err());
    }

    #[test]
    fn form_unknown_field_lenient_mode_skips() {
        let desc = test_descriptor();
        let result = FormCodec.unmarshal(b"bogus=1", &BTreeMap::new(), &desc, true);
        assert!(result.is_ok());
    }

    #[test]
    fn decode_scalar_string_returns_whole_value() {
        let desc = test_descriptor();
        let field = desc.get_field_by_name("name").unwrap();
        let val = decode_scalar(&field, "dynamic-proxy").unwrap();
        assert_eq!(val.as_str(), Some("dynamic-proxy"));
    }

    #[test]
    fn decode_scalar_bool_accepts_lenient_literals() {
        let desc = test_descriptor();
        let field = desc.get_field_by_name("verbose").unwrap();
        assert_eq!(decode_scalar(&field, "true").unwrap().as_bool(), Some(true));
        assert_eq!(decode_scalar(&field, "T").unwrap().as_bool(), Some(true));
        assert_eq!(decode_scalar(&field, "0").unwrap().as_bool(), Some(false));
        assert_eq!(decode_scalar(&field, "garbage").unwrap().as_bool(), Some(false));
    }

    #[test]
    fn decode_scalar_int_failure_yields_zero() {
        let desc = test_descriptor();
        let field = desc.get_field_by_name("id").unwrap();
        assert_eq!(decode_scalar(&field, "not-a-number").unwrap().as_i64(), Some(0));
    }
}
