use std::fmt;

/// All error types produced by the proxy core.
#[derive(Debug)]
pub enum ProxyError {
    /// Dialing an upstream target failed; no client is cached for it.
    Dial(String),

    /// The upstream does not support the gRPC reflection API, or reflection
    /// itself failed (transport error, malformed descriptor bytes, ...).
    Reflection(String),

    /// A path template failed to compile; the route is dropped, not fatal.
    RouteCompile(String),

    /// No target, no client, or no matching route for an inbound request.
    RoutingMiss,

    /// Body read, query parse, JSON parse, or unknown-field rejection failure.
    Codec(String),

    /// The method resolved by the router is a streaming method; Invoke
    /// refuses to dispatch it.
    StreamingUnsupported(String),

    /// A gRPC status returned by the upstream RPC itself.
    Rpc(tonic::Status),

    /// A protobuf encoding/decoding error.
    Proto(String),

    /// An I/O error (listener bind, body read, ...).
    Io(std::io::Error),

    /// The per-request timeout elapsed before a reply could be produced.
    Timeout,
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Dial(target) => write!(f, "failed to dial upstream {target}"),
            ProxyError::Reflection(msg) => write!(f, "reflection error: {msg}"),
            ProxyError::RouteCompile(msg) => write!(f, "route compile error: {msg}"),
            ProxyError::RoutingMiss => write!(f, "no route for request"),
            ProxyError::Codec(msg) => write!(f, "codec error: {msg}"),
            ProxyError::StreamingUnsupported(method) => {
                write!(f, "streaming method {method} cannot be dispatched by this proxy")
            }
            ProxyError::Rpc(status) => {
                write!(f, "upstream error: {} - {}", status.code(), status.message())
            }
            ProxyError::Proto(msg) => write!(f, "proto error: {msg}"),
            ProxyError::Io(err) => write!(f, "I/O error: {err}"),
            ProxyError::Timeout => write!(f, "request timed out"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(err)
    }
}

impl From<tonic::Status> for ProxyError {
    fn from(status: tonic::Status) -> Self {
        ProxyError::Rpc(status)
    }
}

/// Convenience type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_routing_miss() {
        assert_eq!(ProxyError::RoutingMiss.to_string(), "no route for request");
    }

    #[test]
    fn rpc_status_conversion() {
        let status = tonic::Status::not_found("service not found");
        let err: ProxyError = status.into();
        assert!(matches!(err, ProxyError::Rpc(_)));
        assert!(err.to_string().contains("NotFound"));
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: ProxyError = io_err.into();
        assert!(matches!(err, ProxyError::Io(_)));
    }
}
