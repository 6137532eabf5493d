//! The HTTP-facing entry point: resolves a target and route for an inbound
//! request, dispatches it through the matching `ReflectClient`, and wraps
//! the reply in the gateway's JSON envelope.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use http::{Request, Response, StatusCode};
use prost_reflect::DynamicMessage;

use crate::codec::{content_subtype, CodecSet, HttpCodec};
use crate::dial::DialOptions;
use crate::error::ProxyError;
use crate::metadata::{
    headers_to_metadata, metadata_to_headers, DefaultIncomingMatcher, DefaultOutgoingMatcher,
    IncomingHeaderMatcher, OutgoingHeaderMatcher,
};
use crate::reflect_client::ReflectClient;

/// Splits an inbound request path into an upstream target and the route to
/// match against that upstream's table. `None` means "no target, 404".
pub type PathExtractor = dyn Fn(&str) -> Option<(String, String)> + Send + Sync;

/// Turns a failure from anywhere in the pipeline into the HTTP response sent
/// to the caller.
pub type ErrorDecoder = dyn Fn(&ProxyError) -> Response<Bytes> + Send + Sync;

/// Tunables and pluggable seams for a `Proxy`. `Default` wires up the
/// gateway's stock behavior: plaintext dial, default header matchers, the
/// default `<first segment>:50051` path extractor, and a gRPC-status-aware
/// error decoder.
pub struct ProxyConfig {
    pub timeout: Duration,
    pub dial_opts: DialOptions,
    pub codecs: CodecSet,
    pub incoming_matcher: Box<dyn IncomingHeaderMatcher>,
    pub outgoing_matcher: Box<dyn OutgoingHeaderMatcher>,
    pub path_extractor: Box<PathExtractor>,
    pub error_decoder: Box<ErrorDecoder>,
    /// Whether JSON/form unmarshal tolerates fields the target message
    /// doesn't declare. SPEC_FULL.md leaves the default unspecified; this
    /// proxy defaults to permissive, matching typical gateway deployments
    /// fronting clients the operator doesn't fully control.
    pub allow_unknown_fields: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            timeout: Duration::from_secs(10),
            dial_opts: DialOptions::plaintext(),
            codecs: CodecSet::default(),
            incoming_matcher: Box::new(DefaultIncomingMatcher),
            outgoing_matcher: Box::new(DefaultOutgoingMatcher),
            path_extractor: Box::new(make_default_path_extractor(DEFAULT_UPSTREAM_PORT)),
            error_decoder: Box::new(default_error_decoder),
            allow_unknown_fields: true,
        }
    }
}

/// Upstream port the default path extractor appends to the URL's first
/// segment when the server binary doesn't override it via CLI flag.
const DEFAULT_UPSTREAM_PORT: u16 = 50051;

/// Builds the gateway's default path extractor: splits on `/`, rejects
/// paths with fewer than three components (including the leading empty
/// component a leading slash produces), and sets `target` to `<first
/// segment>:<default_port>` with `route` the path with `/<first segment>`
/// stripped.
pub fn make_default_path_extractor(default_port: u16) -> impl Fn(&str) -> Option<(String, String)> + Send + Sync {
    move |path: &str| {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() < 3 {
            return None;
        }
        let first = parts[1];
        if first.is_empty() {
            return None;
        }
        let prefix = format!("/{first}");
        let route = path.strip_prefix(&prefix)?.to_string();
        if route.is_empty() {
            return None;
        }
        Some((format!("{first}:{default_port}"), route))
    }
}

fn not_found() -> Response<Bytes> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Bytes::new())
        .expect("static response is well-formed")
}

/// Maps a gRPC status code to the HTTP status grpc-gateway conventionally
/// returns for it.
fn grpc_code_to_http(code: tonic::Code) -> StatusCode {
    use tonic::Code;
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::from_u16(499).expect("499 is a valid status code"),
        Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::FailedPrecondition => StatusCode::BAD_REQUEST,
        Code::Aborted => StatusCode::CONFLICT,
        Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// The gateway's default error decoder: status-mapped body for upstream RPC
/// failures, 500 for anything internal to the proxy itself.
fn default_error_decoder(err: &ProxyError) -> Response<Bytes> {
    let (status, message) = match err {
        ProxyError::Rpc(s) => (grpc_code_to_http(s.code()), s.message().to_string()),
        ProxyError::StreamingUnsupported(method) => (
            StatusCode::BAD_REQUEST,
            format!("method {method} is a streaming method and cannot be proxied"),
        ),
        ProxyError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "request timed out".to_string()),
        ProxyError::Codec(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        ProxyError::Dial(_) | ProxyError::Reflection(_) => {
            (StatusCode::BAD_GATEWAY, err.to_string())
        }
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    };
    Response::builder()
        .status(status)
        .body(Bytes::from(message))
        .expect("status/body pair is well-formed")
}

/// Dispatches inbound HTTP requests across a dynamically discovered set of
/// gRPC upstreams. Owns a first-writer-wins cache of one `ReflectClient` per
/// target (SPEC_FULL.md §4.5, §5): concurrent first-time lookups for the
/// same target may both dial, but only the first to land wins the cache
/// slot; the loser is closed rather than kept around as a second live
/// connection.
pub struct Proxy {
    config: ProxyConfig,
    clients: DashMap<String, Arc<ReflectClient>>,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Self {
        Proxy {
            config,
            clients: DashMap::new(),
        }
    }

    /// Returns the cached `ReflectClient` for `target`, dialing and
    /// discovering its routes if this is the first request for it.
    async fn client_for(&self, target: &str) -> Result<Arc<ReflectClient>, ProxyError> {
        if let Some(existing) = self.clients.get(target) {
            return Ok(existing.clone());
        }

        let built = ReflectClient::connect(target, &self.config.dial_opts).await?;

        match self.clients.entry(target.to_string()) {
            Entry::Occupied(existing) => {
                built.close();
                Ok(existing.get().clone())
            }
            Entry::Vacant(slot) => {
                slot.insert(built.clone());
                Ok(built)
            }
        }
    }

    /// Handles one inbound HTTP request end to end, never panicking: every
    /// failure path produces a response via the configured error decoder (or
    /// a bare 404 for routing misses, which SPEC_FULL.md treats as "no such
    /// resource" rather than a proxy failure).
    pub async fn handle(&self, req: Request<Bytes>) -> Response<Bytes> {
        match tokio::time::timeout(self.config.timeout, self.process(req)).await {
            Ok(response) => response,
            Err(_elapsed) => (self.config.error_decoder)(&ProxyError::Timeout),
        }
    }

    async fn process(&self, req: Request<Bytes>) -> Response<Bytes> {
        let (parts, body) = req.into_parts();

        let Some((target, route)) = (self.config.path_extractor)(parts.uri.path()) else {
            return not_found();
        };
        if target.is_empty() || route.is_empty() {
            return not_found();
        }

        let client = match self.client_for(&target).await {
            Ok(c) => c,
            Err(_) => return not_found(),
        };

        let Some((method, path_params)) = client.method_params(&parts.method, &route) else {
            return not_found();
        };

        let content_type = header_value(&parts.headers, http::header::CONTENT_TYPE);
        let accept = header_value(&parts.headers, http::header::ACCEPT);
        // An absent or unrecognized subtype falls back to JSON (SPEC_FULL.md
        // §4.3); it is never treated as a request/response codec error.
        let request_codec = self
            .config
            .codecs
            .by_subtype(content_subtype(content_type))
            .unwrap_or_else(|| self.config.codecs.json() as &dyn HttpCodec);
        let response_codec = self
            .config
            .codecs
            .by_subtype(content_subtype(accept))
            .unwrap_or_else(|| self.config.codecs.json() as &dyn HttpCodec);

        let request_msg = match parts.method {
            http::Method::GET | http::Method::DELETE => {
                let query = parts.uri.query().unwrap_or("").as_bytes();
                let form = self
                    .config
                    .codecs
                    .by_subtype("x-www-form-urlencoded")
                    .expect("form codec is always registered");
                match form.unmarshal(query, &path_params, &method.input(), self.config.allow_unknown_fields) {
                    Ok(m) => m,
                    Err(e) => return (self.config.error_decoder)(&e),
                }
            }
            http::Method::POST | http::Method::PUT | http::Method::PATCH => {
                match request_codec.unmarshal(&body, &path_params, &method.input(), self.config.allow_unknown_fields) {
                    Ok(m) => m,
                    Err(e) => return (self.config.error_decoder)(&e),
                }
            }
            _ => DynamicMessage::new(method.input()),
        };

        let metadata = headers_to_metadata(&parts.headers, self.config.incoming_matcher.as_ref());

        let (response_msg, trailing) = match client.invoke(&method, request_msg, metadata).await {
            Ok(r) => r,
            Err(e) => return (self.config.error_decoder)(&e),
        };

        let data = match response_codec.marshal(&response_msg) {
            Ok(d) => d,
            Err(e) => return (self.config.error_decoder)(&e),
        };
        let envelope = match build_envelope(&data) {
            Ok(e) => e,
            Err(e) => return (self.config.error_decoder)(&e),
        };

        let out_headers = metadata_to_headers(&trailing, self.config.outgoing_matcher.as_ref());
        let mut builder = Response::builder().status(StatusCode::OK);
        for (name, value) in out_headers.iter() {
            builder = builder.header(name, value);
        }
        builder = builder.header(
            http::header::CONTENT_TYPE,
            format!("application/{}", response_codec.subtype()),
        );
        builder
            .body(Bytes::from(envelope))
            .expect("header/body pair is well-formed")
    }
}

fn header_value(headers: &http::HeaderMap, name: http::HeaderName) -> &str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

/// Wraps marshaled response bytes in `{"status":0,"msg":"ok","data":<bytes>}`.
/// `data` is trusted to already be a valid JSON value (the only codec this
/// proxy marshals a response through is the JSON codec), so it's spliced in
/// verbatim rather than re-escaped as a string.
fn build_envelope(data: &[u8]) -> Result<Vec<u8>, ProxyError> {
    let data_str =
        std::str::from_utf8(data).map_err(|e| ProxyError::Codec(format!("response is not valid utf-8: {e}")))?;
    Ok(format!(r#"{{"status":0,"msg":"ok","data":{data_str}}}"#).into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_extractor_splits_target_and_route() {
        let extractor = make_default_path_extractor(DEFAULT_UPSTREAM_PORT);
        let (target, route) = extractor("/localhost/helloworld/dynamic-proxy").unwrap();
        assert_eq!(target, "localhost:50051");
        assert_eq!(route, "/helloworld/dynamic-proxy");
    }

    #[test]
    fn default_path_extractor_rejects_short_paths() {
        let extractor = make_default_path_extractor(DEFAULT_UPSTREAM_PORT);
        assert!(extractor("/x").is_none());
        assert!(extractor("/").is_none());
    }

    #[test]
    fn envelope_splices_data_verbatim() {
        let body = build_envelope(br#"{"name":"world"}"#).unwrap();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"{"status":0,"msg":"ok","data":{"name":"world"}}"#
        );
    }

    #[test]
    fn grpc_code_maps_not_found_to_http_404() {
        assert_eq!(grpc_code_to_http(tonic::Code::NotFound), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn handle_returns_404_for_unroutable_path() {
        let proxy = Proxy::new(ProxyConfig::default());
        let req = Request::builder().uri("/short").body(Bytes::new()).unwrap();
        let resp = proxy.handle(req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unrecognized_subtype_falls_back_to_json_codec() {
        let codecs = CodecSet::default();
        let codec = codecs.by_subtype("xml").unwrap_or_else(|| codecs.json() as &dyn HttpCodec);
        assert_eq!(codec.subtype(), "json");
    }

    #[test]
    fn absent_subtype_falls_back_to_json_codec() {
        let codecs = CodecSet::default();
        let codec = codecs
            .by_subtype(content_subtype(""))
            .unwrap_or_else(|| codecs.json() as &dyn HttpCodec);
        assert_eq!(codec.subtype(), "json");
    }

    #[tokio::test]
    async fn handle_returns_404_when_upstream_unreachable() {
        let proxy = Proxy::new(ProxyConfig::default());
        let req = Request::builder()
            .uri("/unreachable-host/helloworld/x")
            .body(Bytes::new())
            .unwrap();
        let resp = proxy.handle(req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
