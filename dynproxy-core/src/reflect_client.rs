//! Owns one upstream connection: discovers its HTTP-annotated routes via
//! server reflection, keeps that route table fresh as the connection's
//! state changes, and dispatches unary RPCs against it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use prost_reflect::{DynamicMessage, MethodDescriptor};
use tokio::task::JoinHandle;
use tonic::metadata::MetadataMap;

use crate::dial::DialOptions;
use crate::error::{ProxyError, Result};
use crate::grpc_codec::DynamicCodec;
use crate::httprule_ext;
use crate::reflection::ReflectionClient;
use crate::router::{Router, UnescapeMode};

/// Holds one upstream connection, its discovered route table, and the
/// background task that keeps the table current.
pub struct ReflectClient {
    channel: tonic::transport::Channel,
    reflection: ReflectionClient,
    router: RwLock<Arc<Router<MethodDescriptor>>>,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ReflectClient {
    /// How often the background watcher re-polls reflection and rebuilds
    /// the route table. `tonic::transport::Channel` doesn't expose a public
    /// connectivity-state-change subscription, so periodic polling stands
    /// in for the state-transition-driven rebuild SPEC_FULL.md §5
    /// describes; the externally observable contract (router eventually
    /// reflects upstream reality, never half-built) is identical.
    const WATCH_INTERVAL: Duration = Duration::from_secs(15);

    /// Dials `target`, performs the initial route discovery, and launches
    /// the background watcher. Returns an error (with nothing cached by
    /// the caller) if the dial fails.
    pub async fn connect(target: &str, dial_opts: &DialOptions) -> Result<Arc<Self>> {
        let channel = dial_opts.dial(target).await?;
        let reflection = ReflectionClient::new(channel.clone());
        let router = build_routes(&reflection).await?;

        let client = Arc::new(ReflectClient {
            channel,
            reflection,
            router: RwLock::new(Arc::new(router)),
            watcher: std::sync::Mutex::new(None),
        });

        let weak = Arc::downgrade(&client);
        let handle = tokio::spawn(watch_loop(weak, target.to_string()));
        *client.watcher.lock().expect("watcher lock poisoned") = Some(handle);

        Ok(client)
    }

    /// Matches `(method, path)` against the current route table, returning
    /// the resolved method descriptor and captured path parameters.
    pub fn method_params(
        &self,
        method: &http::Method,
        path: &str,
    ) -> Option<(MethodDescriptor, BTreeMap<String, String>)> {
        let router = self.router.read().expect("router lock poisoned").clone();
        let (params, descriptor) = router.matches(method, path)?;
        Some((descriptor, params))
    }

    /// Issues a unary RPC. Rejects streaming methods outright (SPEC_FULL.md
    /// §4.4, invariant 4).
    pub async fn invoke(
        &self,
        method: &MethodDescriptor,
        request: DynamicMessage,
        metadata: MetadataMap,
    ) -> Result<(DynamicMessage, MetadataMap)> {
        if method.is_client_streaming() || method.is_server_streaming() {
            return Err(ProxyError::StreamingUnsupported(method.full_name().to_string()));
        }

        let path = format!("/{}/{}", method.parent_service().full_name(), method.name())
            .parse::<http::uri::PathAndQuery>()
            .map_err(|e| ProxyError::Proto(format!("invalid RPC path: {e}")))?;

        let mut client = tonic::client::Grpc::new(self.channel.clone());
        client
            .ready()
            .await
            .map_err(|e| ProxyError::Dial(format!("upstream not ready: {e}")))?;

        let mut req = tonic::Request::new(request);
        *req.metadata_mut() = metadata;

        let codec = DynamicCodec::new(method.input(), method.output());
        let response = client.unary(req, path, codec).await?;
        let trailing_headers = response.metadata().clone();
        Ok((response.into_inner(), trailing_headers))
    }

    /// Cancels the background watcher. The upstream connection itself
    /// closes when the last `Arc<ReflectClient>` referencing it is
    /// dropped.
    pub fn close(&self) {
        if let Some(handle) = self.watcher.lock().expect("watcher lock poisoned").take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn route_count(&self) -> usize {
        self.router.read().expect("router lock poisoned").len()
    }
}

impl Drop for ReflectClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Lists services, resolves each, and adds a route for every method whose
/// options carry a `google.api.http` rule with a supported pattern kind.
/// Resolve/compile failures for one service or route are logged and
/// skipped; enumeration continues.
async fn build_routes(reflection: &ReflectionClient) -> Result<Router<MethodDescriptor>> {
    let mut router = Router::new(UnescapeMode::Default);

    let services = reflection.list_services().await?;
    for service_name in services {
        if service_name.starts_with("grpc.reflection.") {
            continue;
        }
        let service = match reflection.resolve_service(&service_name).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(service = %service_name, error = %e, "failed to resolve service during route discovery");
                continue;
            }
        };
        let raw = match reflection.raw_file_descriptor_for(&service) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(service = %service_name, error = %e, "missing raw descriptor for http rule extraction");
                continue;
            }
        };
        let http_rules = match httprule_ext::extract_http_rules(&raw) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(service = %service_name, error = %e, "failed to extract http rules");
                continue;
            }
        };

        for method in service.methods() {
            let Some(binding) = http_rules.get(method.full_name()) else {
                continue;
            };
            if let Err(e) = router.add(&binding.method, &binding.template, method.clone()) {
                tracing::warn!(method = %method.full_name(), error = %e, "dropping route: template compile failed");
            }
        }
    }

    Ok(router)
}

async fn watch_loop(client: Weak<ReflectClient>, target: String) {
    let mut interval = tokio::time::interval(ReflectClient::WATCH_INTERVAL);
    interval.tick().await; // first tick fires immediately; routes are already built
    loop {
        interval.tick().await;
        let Some(client) = client.upgrade() else {
            return;
        };
        match build_routes(&client.reflection).await {
            Ok(new_router) => {
                *client.router.write().expect("router lock poisoned") = Arc::new(new_router);
            }
            Err(e) => {
                tracing::warn!(target = %target, error = %e, "route rebuild failed, keeping previous router");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_unreachable_target_fails() {
        let result = ReflectClient::connect("127.0.0.1:1", &DialOptions::plaintext()).await;
        assert!(result.is_err());
    }
}
