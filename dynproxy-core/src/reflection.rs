//! Thin client over gRPC server reflection (v1, falling back to v1alpha).
//!
//! Populates a `prost_reflect::DescriptorPool` on demand as services are
//! resolved, recursively fetching any file a returned descriptor depends on
//! (well-known types such as `google/protobuf/any.proto` in particular).
//! Also retains the raw `FileDescriptorProto` bytes behind each resolved
//! service, since `httprule_ext` needs a second, extension-aware decode of
//! those same bytes to recover `google.api.http` rules that the descriptor
//! pool silently drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use prost::Message;
use prost_reflect::DescriptorPool;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic_reflection::pb::v1;
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient as V1Client;
use tonic_reflection::pb::v1alpha;

use crate::error::{ProxyError, Result};

const VERSION_UNKNOWN: u8 = 0;
const VERSION_V1: u8 = 1;
const VERSION_V1ALPHA: u8 = 2;

/// Reflection-backed descriptor source for a single upstream connection.
pub struct ReflectionClient {
    channel: Channel,
    pool: Mutex<DescriptorPool>,
    /// Raw `FileDescriptorProto` bytes, keyed by file name, as handed back
    /// by reflection. Kept alongside the pool so `httprule_ext` can recover
    /// the `google.api.http` extension the pool itself discards.
    raw_files: Mutex<HashMap<String, Vec<u8>>>,
    version: AtomicU8,
}

impl ReflectionClient {
    pub fn new(channel: Channel) -> Self {
        ReflectionClient {
            channel,
            pool: Mutex::new(DescriptorPool::new()),
            raw_files: Mutex::new(HashMap::new()),
            version: AtomicU8::new(VERSION_UNKNOWN),
        }
    }

    /// Lists every service the upstream exposes via reflection.
    pub async fn list_services(&self) -> Result<Vec<String>> {
        let msg = v1::server_reflection_request::MessageRequest::ListServices(String::new());
        match self.reflect(msg).await? {
            v1::server_reflection_response::MessageResponse::ListServicesResponse(list) => {
                Ok(list.service.into_iter().map(|s| s.name).collect())
            }
            _ => Err(ProxyError::Reflection(
                "unexpected reflection response for list_services".to_string(),
            )),
        }
    }

    /// Resolves `service_name` (fully-qualified) to its descriptor, fetching
    /// and caching the file that declares it (and its transitive
    /// dependencies) first if necessary.
    pub async fn resolve_service(&self, service_name: &str) -> Result<prost_reflect::ServiceDescriptor> {
        {
            let pool = self.lock_pool()?;
            if let Some(svc) = pool.get_service_by_name(service_name) {
                return Ok(svc);
            }
        }

        let msg = v1::server_reflection_request::MessageRequest::FileContainingSymbol(
            service_name.to_string(),
        );
        if let v1::server_reflection_response::MessageResponse::FileDescriptorResponse(fdr) =
            self.reflect(msg).await?
        {
            self.add_file_descriptors(&fdr.file_descriptor_proto).await?;
        }

        let pool = self.lock_pool()?;
        pool.get_service_by_name(service_name)
            .ok_or_else(|| ProxyError::Reflection(format!("service not found: {service_name}")))
    }

    /// Returns the raw (extension-preserving) `FileDescriptorProto` bytes
    /// for the file that declares `service_name`. Must be called after a
    /// successful `resolve_service` for the same service.
    pub fn raw_file_descriptor_for(&self, service: &prost_reflect::ServiceDescriptor) -> Result<Vec<u8>> {
        let file_name = service.parent_file().name().to_string();
        let raw_files = self
            .raw_files
            .lock()
            .map_err(|_| ProxyError::Reflection("internal lock poisoned".to_string()))?;
        raw_files
            .get(&file_name)
            .cloned()
            .ok_or_else(|| ProxyError::Reflection(format!("no raw descriptor cached for {file_name}")))
    }

    fn lock_pool(&self) -> Result<std::sync::MutexGuard<'_, DescriptorPool>> {
        self.pool
            .lock()
            .map_err(|_| ProxyError::Reflection("internal lock poisoned".to_string()))
    }

    async fn reflect(
        &self,
        message_request: v1::server_reflection_request::MessageRequest,
    ) -> Result<v1::server_reflection_response::MessageResponse> {
        let cached = self.version.load(Ordering::Relaxed);
        match cached {
            VERSION_V1 => return self.reflect_v1(message_request).await,
            VERSION_V1ALPHA => return self.reflect_v1alpha(message_request).await,
            _ => {}
        }

        match self.reflect_v1(message_request.clone()).await {
            Ok(resp) => {
                self.version.store(VERSION_V1, Ordering::Relaxed);
                Ok(resp)
            }
            Err(e) if is_unimplemented(&e) => {
                let resp = self.reflect_v1alpha(message_request).await?;
                self.version.store(VERSION_V1ALPHA, Ordering::Relaxed);
                Ok(resp)
            }
            Err(e) => Err(e),
        }
    }

    async fn reflect_v1(
        &self,
        message_request: v1::server_reflection_request::MessageRequest,
    ) -> Result<v1::server_reflection_response::MessageResponse> {
        let request = v1::ServerReflectionRequest {
            host: String::new(),
            message_request: Some(message_request),
        };
        let (tx, rx) = mpsc::channel(1);
        tx.send(request)
            .await
            .map_err(|_| ProxyError::Reflection("failed to send reflection request".to_string()))?;
        drop(tx);

        let mut client = V1Client::new(self.channel.clone());
        let response = client
            .server_reflection_info(tonic::Request::new(ReceiverStream::new(rx)))
            .await
            .map_err(map_status_error)?;

        let mut stream = response.into_inner();
        let resp = stream
            .message()
            .await
            .map_err(|s| ProxyError::Reflection(s.to_string()))?
            .ok_or_else(|| ProxyError::Reflection("empty reflection response stream".to_string()))?;

        extract_response(resp.message_response)
    }

    async fn reflect_v1alpha(
        &self,
        message_request: v1::server_reflection_request::MessageRequest,
    ) -> Result<v1::server_reflection_response::MessageResponse> {
        let alpha_request = convert_request_to_v1alpha(message_request);
        let (tx, rx) = mpsc::channel(1);
        tx.send(alpha_request)
            .await
            .map_err(|_| ProxyError::Reflection("failed to send reflection request".to_string()))?;
        drop(tx);

        let mut client =
            v1alpha::server_reflection_client::ServerReflectionClient::new(self.channel.clone());
        let response = client
            .server_reflection_info(tonic::Request::new(ReceiverStream::new(rx)))
            .await
            .map_err(map_status_error)?;

        let mut stream = response.into_inner();
        let resp = stream
            .message()
            .await
            .map_err(|s| ProxyError::Reflection(s.to_string()))?
            .ok_or_else(|| ProxyError::Reflection("empty reflection response stream".to_string()))?;

        convert_response_from_v1alpha(resp)
    }

    /// Adds serialized `FileDescriptorProto`s to the pool, recursively
    /// fetching any dependency the upstream hasn't already handed us.
    async fn add_file_descriptors(&self, serialized_fds: &[Vec<u8>]) -> Result<()> {
        let new_files = {
            let pool = self.lock_pool()?;
            let mut raw = self
                .raw_files
                .lock()
                .map_err(|_| ProxyError::Reflection("internal lock poisoned".to_string()))?;
            let mut files = Vec::new();
            for bytes in serialized_fds {
                let fdp = prost_types::FileDescriptorProto::decode(bytes.as_slice())
                    .map_err(|e| ProxyError::Reflection(format!("failed to decode file descriptor: {e}")))?;
                let file_name = fdp.name.as_deref().unwrap_or("").to_string();
                raw.entry(file_name.clone()).or_insert_with(|| bytes.clone());
                if pool.get_file_by_name(&file_name).is_some() {
                    continue;
                }
                files.push(fdp);
            }
            files
        };

        if new_files.is_empty() {
            return Ok(());
        }

        let missing = {
            let pool = self.lock_pool()?;
            let new_names: std::collections::HashSet<_> =
                new_files.iter().filter_map(|f| f.name.as_deref()).collect();
            let mut missing_files = Vec::new();
            for fdp in &new_files {
                for dep in &fdp.dependency {
                    if pool.get_file_by_name(dep).is_none() && !new_names.contains(dep.as_str()) {
                        missing_files.push(dep.clone());
                    }
                }
            }
            missing_files
        };

        for dep_name in missing {
            let msg = v1::server_reflection_request::MessageRequest::FileByFilename(dep_name);
            if let Ok(v1::server_reflection_response::MessageResponse::FileDescriptorResponse(fdr)) =
                self.reflect(msg).await
            {
                Box::pin(self.add_file_descriptors(&fdr.file_descriptor_proto)).await?;
            }
        }

        let mut pool = self.lock_pool()?;
        let final_files: Vec<_> = new_files
            .into_iter()
            .filter(|fdp| pool.get_file_by_name(fdp.name.as_deref().unwrap_or("")).is_none())
            .collect();
        if !final_files.is_empty() {
            let fds = prost_types::FileDescriptorSet {
                file: final_files.clone(),
            };
            if pool.add_file_descriptor_set(fds).is_err() {
                // One of the files is missing a dependency we couldn't
                // resolve; add what we can instead of failing outright.
                for fdp in final_files {
                    let name = fdp.name.clone().unwrap_or_else(|| "<unknown>".to_string());
                    let single = prost_types::FileDescriptorSet { file: vec![fdp] };
                    if let Err(e) = pool.add_file_descriptor_set(single) {
                        tracing::warn!(file = %name, error = %e, "skipping unresolvable file descriptor");
                    }
                }
            }
        }
        Ok(())
    }
}

fn map_status_error(status: tonic::Status) -> ProxyError {
    if status.code() == tonic::Code::Unimplemented {
        ProxyError::Reflection("upstream does not implement server reflection".to_string())
    } else {
        ProxyError::Rpc(status)
    }
}

fn is_unimplemented(err: &ProxyError) -> bool {
    matches!(err, ProxyError::Reflection(_)) || matches!(err, ProxyError::Rpc(s) if s.code() == tonic::Code::Unimplemented)
}

fn extract_response(
    msg: Option<v1::server_reflection_response::MessageResponse>,
) -> Result<v1::server_reflection_response::MessageResponse> {
    let msg = msg.ok_or_else(|| ProxyError::Reflection("reflection response has no message".to_string()))?;
    if let v1::server_reflection_response::MessageResponse::ErrorResponse(ref err) = msg {
        return Err(ProxyError::Reflection(format!(
            "reflection error (code {}): {}",
            err.error_code, err.error_message
        )));
    }
    Ok(msg)
}

fn convert_request_to_v1alpha(
    msg: v1::server_reflection_request::MessageRequest,
) -> v1alpha::ServerReflectionRequest {
    use v1::server_reflection_request::MessageRequest;
    let alpha_msg = match msg {
        MessageRequest::FileByFilename(s) => {
            v1alpha::server_reflection_request::MessageRequest::FileByFilename(s)
        }
        MessageRequest::FileContainingSymbol(s) => {
            v1alpha::server_reflection_request::MessageRequest::FileContainingSymbol(s)
        }
        MessageRequest::FileContainingExtension(ext) => {
            v1alpha::server_reflection_request::MessageRequest::FileContainingExtension(
                v1alpha::ExtensionRequest {
                    containing_type: ext.containing_type,
                    extension_number: ext.extension_number,
                },
            )
        }
        MessageRequest::AllExtensionNumbersOfType(s) => {
            v1alpha::server_reflection_request::MessageRequest::AllExtensionNumbersOfType(s)
        }
        MessageRequest::ListServices(s) => {
            v1alpha::server_reflection_request::MessageRequest::ListServices(s)
        }
    };
    v1alpha::ServerReflectionRequest {
        host: String::new(),
        message_request: Some(alpha_msg),
    }
}

fn convert_response_from_v1alpha(
    resp: v1alpha::ServerReflectionResponse,
) -> Result<v1::server_reflection_response::MessageResponse> {
    use v1alpha::server_reflection_response::MessageResponse;
    let msg = resp
        .message_response
        .ok_or_else(|| ProxyError::Reflection("reflection response has no message".to_string()))?;

    let v1_msg = match msg {
        MessageResponse::FileDescriptorResponse(fdr) => {
            v1::server_reflection_response::MessageResponse::FileDescriptorResponse(v1::FileDescriptorResponse {
                file_descriptor_proto: fdr.file_descriptor_proto,
            })
        }
        MessageResponse::AllExtensionNumbersResponse(ext) => {
            v1::server_reflection_response::MessageResponse::AllExtensionNumbersResponse(v1::ExtensionNumberResponse {
                base_type_name: ext.base_type_name,
                extension_number: ext.extension_number,
            })
        }
        MessageResponse::ListServicesResponse(list) => {
            v1::server_reflection_response::MessageResponse::ListServicesResponse(v1::ListServiceResponse {
                service: list.service.into_iter().map(|s| v1::ServiceResponse { name: s.name }).collect(),
            })
        }
        MessageResponse::ErrorResponse(err) => {
            return Err(ProxyError::Reflection(format!(
                "reflection error (code {}): {}",
                err.error_code, err.error_message
            )));
        }
    };
    Ok(v1_msg)
}
