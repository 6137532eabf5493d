//! Translation between inbound/outbound HTTP headers and gRPC metadata.
//!
//! Two matchers gate the translation in each direction (SPEC_FULL.md §4.5
//! step 6, §4.8): the incoming matcher decides which request headers are
//! forwarded upstream as metadata (and under what key), the outgoing
//! matcher decides which response metadata entries are copied back onto
//! the HTTP response.

use http::{HeaderMap, HeaderName, HeaderValue};
use tonic::metadata::{AsciiMetadataValue, MetadataMap};

/// Decides whether an inbound HTTP header is forwarded to the upstream as
/// gRPC metadata, and under what key.
pub trait IncomingHeaderMatcher: Send + Sync {
    /// Returns the metadata key to use, or `None` to drop the header.
    fn matches(&self, header_name: &str) -> Option<String>;
}

/// Decides whether an outbound gRPC metadata entry is copied onto the HTTP
/// response, and under what header name.
pub trait OutgoingHeaderMatcher: Send + Sync {
    /// Returns the HTTP header name to use, or `None` to drop the entry.
    fn matches(&self, metadata_key: &str) -> Option<String>;
}

/// The gateway's default incoming matcher: forward every header, lowercased,
/// except `Connection` (hop-by-hop, never meaningful to an upstream RPC).
pub struct DefaultIncomingMatcher;

impl IncomingHeaderMatcher for DefaultIncomingMatcher {
    fn matches(&self, header_name: &str) -> Option<String> {
        if header_name.eq_ignore_ascii_case("connection") {
            return None;
        }
        Some(header_name.to_ascii_lowercase())
    }
}

/// Conventional metadata-header prefix grpc-gateway implementations use for
/// headers synthesized from response trailers/headers that aren't already
/// standard HTTP headers.
pub const GRPC_METADATA_HEADER_PREFIX: &str = "Grpc-Metadata-";

/// The gateway's default outgoing matcher: accept every metadata entry,
/// prefixed with [`GRPC_METADATA_HEADER_PREFIX`].
pub struct DefaultOutgoingMatcher;

impl OutgoingHeaderMatcher for DefaultOutgoingMatcher {
    fn matches(&self, metadata_key: &str) -> Option<String> {
        Some(format!("{GRPC_METADATA_HEADER_PREFIX}{metadata_key}"))
    }
}

/// Builds the `MetadataMap` sent upstream from the inbound `HeaderMap`,
/// applying `matcher` to every header and dropping anything it rejects.
pub fn headers_to_metadata(headers: &HeaderMap, matcher: &dyn IncomingHeaderMatcher) -> MetadataMap {
    let mut md = MetadataMap::new();
    for (name, value) in headers {
        let Some(key) = matcher.matches(name.as_str()) else {
            continue;
        };
        let Ok(value_str) = value.to_str() else {
            continue;
        };
        let Ok(metadata_value) = value_str.parse::<AsciiMetadataValue>() else {
            continue;
        };
        let Ok(metadata_key) = key.parse::<tonic::metadata::AsciiMetadataKey>() else {
            continue;
        };
        md.append(metadata_key, metadata_value);
    }
    md
}

/// Builds the `HeaderMap` written to the HTTP response from the upstream's
/// returned metadata, applying `matcher` to every entry. Returns the
/// filtered map `matcher` produced — not the unfiltered metadata (see
/// SPEC_FULL.md §9's open question on this exact point).
pub fn metadata_to_headers(md: &MetadataMap, matcher: &dyn OutgoingHeaderMatcher) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for kv in md.iter() {
        let tonic::metadata::KeyAndValueRef::Ascii(key, value) = kv else {
            continue;
        };
        let Some(header_name) = matcher.matches(key.as_str()) else {
            continue;
        };
        let Ok(name) = HeaderName::try_from(header_name) else {
            continue;
        };
        let Ok(bytes) = value.to_str() else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(bytes) else {
            continue;
        };
        headers.append(name, value);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_incoming_drops_connection_header() {
        let mut headers = HeaderMap::new();
        headers.insert("Connection", HeaderValue::from_static("keep-alive"));
        headers.insert("X-Trace", HeaderValue::from_static("t1"));
        let md = headers_to_metadata(&headers, &DefaultIncomingMatcher);
        assert!(md.get("connection").is_none());
        assert_eq!(md.get("x-trace").unwrap().to_str().unwrap(), "t1");
    }

    #[test]
    fn default_incoming_lowercases_key() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Trace-Id", HeaderValue::from_static("abc"));
        let md = headers_to_metadata(&headers, &DefaultIncomingMatcher);
        assert!(md.get("x-trace-id").is_some());
    }

    #[test]
    fn default_outgoing_prefixes_key() {
        let mut md = MetadataMap::new();
        md.insert("x-request-id", "42".parse().unwrap());
        let headers = metadata_to_headers(&md, &DefaultOutgoingMatcher);
        assert_eq!(
            headers.get("Grpc-Metadata-x-request-id").unwrap().to_str().unwrap(),
            "42"
        );
    }

    #[test]
    fn outgoing_matcher_can_drop_entries() {
        struct OnlyTrace;
        impl OutgoingHeaderMatcher for OnlyTrace {
            fn matches(&self, key: &str) -> Option<String> {
                (key == "x-trace").then(|| key.to_string())
            }
        }
        let mut md = MetadataMap::new();
        md.insert("x-trace", "1".parse().unwrap());
        md.insert("x-other", "2".parse().unwrap());
        let headers = metadata_to_headers(&md, &OnlyTrace);
        assert_eq!(headers.len(), 1);
        assert!(headers.get("x-trace").is_some());
    }
}
