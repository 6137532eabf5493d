//! Recovers the `google.api.http` extension (field 72295728 on
//! `google.protobuf.MethodOptions`) from raw `FileDescriptorProto` bytes.
//!
//! The `prost_reflect::DescriptorPool` built from the same bytes is used for
//! everything else (field names, JSON names, message shapes): it decodes
//! `MethodOptions` as a standard, non-extended message and silently drops
//! any field it doesn't know about, including this one. So the http rule is
//! recovered by a second, narrow decode of the identical bytes against a
//! hand-declared shadow of just the pieces needed to read it.

use std::collections::HashMap;

use prost::Message;

use crate::error::{ProxyError, Result};

#[derive(Clone, PartialEq, Message)]
struct FileDescriptorProto {
    #[prost(string, optional, tag = "2")]
    package: Option<String>,
    #[prost(message, repeated, tag = "6")]
    service: Vec<ServiceDescriptorProto>,
}

#[derive(Clone, PartialEq, Message)]
struct ServiceDescriptorProto {
    #[prost(string, optional, tag = "1")]
    name: Option<String>,
    #[prost(message, repeated, tag = "2")]
    method: Vec<MethodDescriptorProto>,
}

#[derive(Clone, PartialEq, Message)]
struct MethodDescriptorProto {
    #[prost(string, optional, tag = "1")]
    name: Option<String>,
    #[prost(message, optional, tag = "4")]
    options: Option<MethodOptions>,
}

#[derive(Clone, PartialEq, Message)]
struct MethodOptions {
    #[prost(message, optional, tag = "72295728")]
    http: Option<HttpRule>,
}

#[derive(Clone, PartialEq, Message)]
struct HttpRule {
    #[prost(oneof = "HttpPattern", tags = "2, 3, 4, 5, 6")]
    pattern: Option<HttpPattern>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
enum HttpPattern {
    #[prost(string, tag = "2")]
    Get(String),
    #[prost(string, tag = "3")]
    Put(String),
    #[prost(string, tag = "4")]
    Post(String),
    #[prost(string, tag = "5")]
    Delete(String),
    #[prost(string, tag = "6")]
    Patch(String),
}

/// A single extracted HTTP binding: the HTTP method it binds and the raw
/// path template string (not yet compiled).
pub struct HttpBinding {
    pub method: http::Method,
    pub template: String,
}

/// Decodes `raw` (the serialized `FileDescriptorProto` bytes reflection
/// handed back) and returns, for every method carrying a supported
/// `google.api.http` pattern, its binding keyed by the method's
/// fully-qualified name (`package.Service.Method`, matching
/// `MethodDescriptor::full_name()`'s format).
///
/// Methods with no http option, or with an unsupported pattern kind
/// (`custom`, `additional_bindings` — not represented by this shadow type
/// at all), are simply absent from the result.
pub fn extract_http_rules(raw: &[u8]) -> Result<HashMap<String, HttpBinding>> {
    let file = FileDescriptorProto::decode(raw)
        .map_err(|e| ProxyError::Reflection(format!("failed to decode file descriptor for http rule extraction: {e}")))?;

    let mut out = HashMap::new();
    for service in &file.service {
        let Some(service_name) = service.name.as_deref() else {
            continue;
        };
        for method in &service.method {
            let Some(method_name) = method.name.as_deref() else {
                continue;
            };
            let Some(pattern) = method
                .options
                .as_ref()
                .and_then(|o| o.http.as_ref())
                .and_then(|h| h.pattern.as_ref())
            else {
                continue;
            };
            let (http_method, template) = match pattern {
                HttpPattern::Get(p) => (http::Method::GET, p.clone()),
                HttpPattern::Put(p) => (http::Method::PUT, p.clone()),
                HttpPattern::Post(p) => (http::Method::POST, p.clone()),
                HttpPattern::Delete(p) => (http::Method::DELETE, p.clone()),
                HttpPattern::Patch(p) => (http::Method::PATCH, p.clone()),
            };
            let full_name = match file.package.as_deref() {
                Some(pkg) if !pkg.is_empty() => format!("{pkg}.{service_name}.{method_name}"),
                _ => format!("{service_name}.{method_name}"),
            };
            out.insert(
                full_name,
                HttpBinding {
                    method: http_method,
                    template,
                },
            );
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_fixture() -> Vec<u8> {
        let file = FileDescriptorProto {
            package: Some("helloworld".to_string()),
            service: vec![ServiceDescriptorProto {
                name: Some("Greeter".to_string()),
                method: vec![MethodDescriptorProto {
                    name: Some("SayHello".to_string()),
                    options: Some(MethodOptions {
                        http: Some(HttpRule {
                            pattern: Some(HttpPattern::Get("/helloworld/{name}".to_string())),
                        }),
                    }),
                }],
            }],
        };
        file.encode_to_vec()
    }

    #[test]
    fn extracts_get_binding() {
        let rules = extract_http_rules(&encode_fixture()).unwrap();
        let binding = rules.get("helloworld.Greeter.SayHello").unwrap();
        assert_eq!(binding.method, http::Method::GET);
        assert_eq!(binding.template, "/helloworld/{name}");
    }

    #[test]
    fn method_without_http_option_is_absent() {
        let file = FileDescriptorProto {
            package: Some("pkg".to_string()),
            service: vec![ServiceDescriptorProto {
                name: Some("Svc".to_string()),
                method: vec![MethodDescriptorProto {
                    name: Some("Plain".to_string()),
                    options: None,
                }],
            }],
        };
        let rules = extract_http_rules(&file.encode_to_vec()).unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn full_name_without_package() {
        let file = FileDescriptorProto {
            package: None,
            service: vec![ServiceDescriptorProto {
                name: Some("Svc".to_string()),
                method: vec![MethodDescriptorProto {
                    name: Some("M".to_string()),
                    options: Some(MethodOptions {
                        http: Some(HttpRule {
                            pattern: Some(HttpPattern::Post("/v1/m".to_string())),
                        }),
                    }),
                }],
            }],
        };
        let rules = extract_http_rules(&file.encode_to_vec()).unwrap();
        assert!(rules.contains_key("Svc.M"));
    }
}
