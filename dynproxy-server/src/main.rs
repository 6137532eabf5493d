use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::Response;
use clap::Parser;
use http::Request;

use dynproxy_core::{make_default_path_extractor, DialOptions, Proxy, ProxyConfig};

/// Dynamic HTTP-to-gRPC reverse proxy: discovers upstream routes via server
/// reflection at runtime, no generated stubs required.
#[derive(Parser, Debug)]
#[command(name = "dynproxy-server", version, about)]
struct Args {
    /// Address this proxy listens on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Per-request timeout, in seconds, covering the full handle pipeline
    /// (dial-or-reuse, encode, invoke, decode).
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Port appended to the first path segment by the default path
    /// extractor when resolving an upstream target.
    #[arg(long, default_value_t = 50051)]
    default_upstream_port: u16,

    /// Dial upstreams over TLS instead of plaintext.
    #[arg(long)]
    tls: bool,

    /// Skip upstream certificate verification. Only meaningful with --tls;
    /// development use only.
    #[arg(long)]
    tls_skip_verify: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let dial_opts = match (args.tls, args.tls_skip_verify) {
        (_, true) => DialOptions::tls_skip_verify(),
        (true, false) => DialOptions::tls(),
        (false, false) => DialOptions::plaintext(),
    };

    let config = ProxyConfig {
        timeout: Duration::from_secs(args.timeout_secs),
        dial_opts,
        path_extractor: Box::new(make_default_path_extractor(args.default_upstream_port)),
        ..ProxyConfig::default()
    };

    let proxy = Arc::new(Proxy::new(config));

    let app = axum::Router::new()
        .fallback(handle)
        .with_state(proxy);

    tracing::info!(listen = %args.listen, "dynproxy-server starting");

    let listener = match tokio::net::TcpListener::bind(args.listen).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %args.listen, "failed to bind listen address");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

async fn handle(State(proxy): State<Arc<Proxy>>, req: Request<axum::body::Body>) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read request body");
            return Response::builder()
                .status(http::StatusCode::BAD_REQUEST)
                .body(axum::body::Body::from(Bytes::new()))
                .expect("static response is well-formed");
        }
    };

    let req = Request::from_parts(parts, bytes);
    let response = proxy.handle(req).await;
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, axum::body::Body::from(body))
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c signal handler");
    tracing::info!("shutdown signal received");
}
