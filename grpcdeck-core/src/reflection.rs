//! Client for the gRPC server reflection protocol.
//!
//! Speaks `grpc.reflection.v1` and transparently falls back to `v1alpha`
//! for older servers, caching whichever version answered so negotiation
//! happens once per connection.
//!
//! Service resolution is two-tiered. The *standard* path feeds the
//! server's file descriptors straight into the local registry. When a
//! server ships malformed descriptors the standard path fails, and the
//! *lenient* path re-fetches the raw descriptor protos, runs them through
//! repair, and assembles whatever can be salvaged. Services that survive
//! neither path are still listed, carrying the error text, so the host can
//! show the user what failed.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use prost::Message;
use prost_reflect::{DescriptorPool, MethodDescriptor, ServiceDescriptor};
use prost_types::FileDescriptorProto;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic_reflection::pb::v1;
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient as V1Client;
use tonic_reflection::pb::v1alpha;
use tonic_reflection::pb::v1alpha::server_reflection_client::ServerReflectionClient as V1alphaClient;

use crate::error::{Error, Result};
use crate::registry::{self, global_registry, CombinedResolver};
use crate::repair;

/// Reflection API version: 0=unknown, 1=v1, 2=v1alpha.
const VERSION_UNKNOWN: u8 = 0;
const VERSION_V1: u8 = 1;
const VERSION_V1ALPHA: u8 = 2;

const REFLECTION_V1_SERVICE: &str = "grpc.reflection.v1.ServerReflection";
const REFLECTION_V1ALPHA_SERVICE: &str = "grpc.reflection.v1alpha.ServerReflection";

/// The four RPC shapes, derived from a method's streaming flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodType {
    Unary,
    ServerStream,
    ClientStream,
    BidiStream,
}

impl MethodType {
    pub fn of(method: &MethodDescriptor) -> Self {
        match (method.is_client_streaming(), method.is_server_streaming()) {
            (false, false) => MethodType::Unary,
            (false, true) => MethodType::ServerStream,
            (true, false) => MethodType::ClientStream,
            (true, true) => MethodType::BidiStream,
        }
    }
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MethodType::Unary => "unary",
            MethodType::ServerStream => "server streaming",
            MethodType::ClientStream => "client streaming",
            MethodType::BidiStream => "bidirectional streaming",
        };
        f.write_str(label)
    }
}

/// One method of a resolved service.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub name: String,
    pub full_name: String,
    pub method_type: MethodType,
    pub descriptor: MethodDescriptor,
}

/// A discovered service. When resolution degraded, `error` carries the
/// failure text and `methods` is empty; the service is still listed so the
/// user can see what failed.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub full_name: String,
    pub methods: Vec<MethodInfo>,
    pub descriptor: Option<ServiceDescriptor>,
    pub error: Option<String>,
}

/// Reflection-backed descriptor source for one connection.
///
/// Owns the local registry and the service cache. Not shared across
/// threads; a host driving it from several threads must serialize
/// externally.
pub struct ReflectionClient {
    channel: Channel,
    metadata: tonic::metadata::MetadataMap,
    version: AtomicU8,
    pool: DescriptorPool,
    cache: HashMap<String, ServiceInfo>,
}

impl ReflectionClient {
    pub fn new(channel: Channel) -> Self {
        Self::with_metadata(channel, tonic::metadata::MetadataMap::new())
    }

    /// Attach metadata (e.g. auth headers) to every reflection request.
    pub fn with_metadata(channel: Channel, metadata: tonic::metadata::MetadataMap) -> Self {
        ReflectionClient {
            channel,
            metadata,
            version: AtomicU8::new(VERSION_UNKNOWN),
            pool: global_registry().clone(),
            cache: HashMap::new(),
        }
    }

    /// List the server's services, excluding the reflection services
    /// themselves, resolving each one's descriptor.
    pub async fn list_services(&mut self) -> Result<Vec<ServiceInfo>> {
        let names = self.list_service_names().await?;
        let mut services = Vec::with_capacity(names.len());
        for name in names {
            if name == REFLECTION_V1_SERVICE || name == REFLECTION_V1ALPHA_SERVICE {
                continue;
            }
            services.push(self.resolve_service(&name).await);
        }
        Ok(services)
    }

    /// Look up one method on a service, resolving the service first if it
    /// is not cached.
    pub async fn method_descriptor(
        &mut self,
        service: &str,
        method: &str,
    ) -> Result<MethodDescriptor> {
        let info = self.resolve_service(service).await;
        if let Some(error) = info.error {
            return Err(Error::InvalidDescriptor(error));
        }
        info.methods
            .iter()
            .find(|m| m.name == method)
            .map(|m| m.descriptor.clone())
            .ok_or_else(|| Error::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            })
    }

    /// Drop the service cache, reset the local registry, and forget the
    /// negotiated protocol version.
    pub fn close(&mut self) {
        self.cache.clear();
        self.pool = global_registry().clone();
        self.version.store(VERSION_UNKNOWN, Ordering::Relaxed);
    }

    async fn list_service_names(&self) -> Result<Vec<String>> {
        let request = v1::server_reflection_request::MessageRequest::ListServices(String::new());
        match self.reflect(request).await? {
            v1::server_reflection_response::MessageResponse::ListServicesResponse(list) => {
                Ok(list.service.into_iter().map(|s| s.name).collect())
            }
            _ => Err(Error::InvalidDescriptor(
                "unexpected reflection response for list_services".into(),
            )),
        }
    }

    async fn resolve_service(&mut self, full_name: &str) -> ServiceInfo {
        if let Some(cached) = self.cache.get(full_name) {
            return cached.clone();
        }

        let standard_error = match self.resolve_standard(full_name).await {
            Ok(info) => {
                self.cache.insert(full_name.to_string(), info.clone());
                return info;
            }
            Err(e) => e,
        };

        match self.resolve_lenient(full_name).await {
            Ok(info) => {
                self.cache.insert(full_name.to_string(), info.clone());
                info
            }
            Err(lenient_error) => ServiceInfo {
                name: short_name(full_name).to_string(),
                full_name: full_name.to_string(),
                methods: Vec::new(),
                descriptor: None,
                error: Some(format!("{standard_error}; lenient path: {lenient_error}")),
            },
        }
    }

    /// Standard resolution: trust the server's descriptors and register
    /// them directly.
    async fn resolve_standard(&mut self, full_name: &str) -> Result<ServiceInfo> {
        let request = v1::server_reflection_request::MessageRequest::FileContainingSymbol(
            full_name.to_string(),
        );
        let response = self.reflect(request).await?;
        let v1::server_reflection_response::MessageResponse::FileDescriptorResponse(fdr) =
            response
        else {
            return Err(Error::InvalidDescriptor(
                "unexpected reflection response for file_containing_symbol".into(),
            ));
        };

        self.add_file_descriptors(&fdr.file_descriptor_proto).await?;

        self.pool
            .get_service_by_name(full_name)
            .map(|descriptor| service_info(&descriptor))
            .ok_or_else(|| {
                Error::InvalidDescriptor(format!(
                    "service {full_name} not found in resolved descriptors"
                ))
            })
    }

    /// Lenient resolution: re-fetch the raw descriptor protos, fetch any
    /// declared dependencies the global registry does not cover, repair
    /// everything, and assemble a fresh local registry.
    async fn resolve_lenient(&mut self, full_name: &str) -> Result<ServiceInfo> {
        let request = v1::server_reflection_request::MessageRequest::FileContainingSymbol(
            full_name.to_string(),
        );
        let response = self.reflect(request).await?;
        let v1::server_reflection_response::MessageResponse::FileDescriptorResponse(fdr) =
            response
        else {
            return Err(Error::InvalidDescriptor(
                "unexpected reflection response for file_containing_symbol".into(),
            ));
        };

        let mut queue = decode_file_descriptors(&fdr.file_descriptor_proto)?;
        let mut collected: HashMap<String, FileDescriptorProto> = HashMap::new();
        let mut requested: HashSet<String> = HashSet::new();

        while let Some(fdp) = queue.pop() {
            let Some(path) = fdp.name.clone() else { continue };
            if collected.contains_key(&path) {
                continue;
            }
            for dep in &fdp.dependency {
                if global_registry().get_file_by_name(dep).is_some()
                    || collected.contains_key(dep)
                    || !requested.insert(dep.clone())
                {
                    continue;
                }
                // Opportunistic: a server that cannot serve the file by
                // name may still have given us enough to assemble.
                let request =
                    v1::server_reflection_request::MessageRequest::FileByFilename(dep.clone());
                if let Ok(v1::server_reflection_response::MessageResponse::FileDescriptorResponse(
                    dep_fdr,
                )) = self.reflect(request).await
                {
                    if let Ok(files) = decode_file_descriptors(&dep_fdr.file_descriptor_proto) {
                        queue.extend(files);
                    }
                }
            }
            collected.insert(path, fdp);
        }

        let mut files: Vec<FileDescriptorProto> = collected.into_values().collect();
        {
            let resolver = CombinedResolver::new(&self.pool);
            for fdp in &mut files {
                repair::repair_file(fdp, &resolver);
            }
        }

        let assembled = registry::assemble(&self.pool, files);
        let descriptor = assembled
            .pool
            .get_service_by_name(full_name)
            .ok_or_else(|| {
                Error::InvalidDescriptor(format!(
                    "service {full_name} not found after descriptor repair"
                ))
            })?;
        let info = service_info(&descriptor);
        self.pool = assembled.pool;
        Ok(info)
    }

    /// Register serialized file descriptors into the local registry,
    /// fetching declared dependencies the registry does not know yet
    /// (transitively) before adding.
    async fn add_file_descriptors(&mut self, serialized: &[Vec<u8>]) -> Result<()> {
        let mut new_files = Vec::new();
        for fdp in decode_file_descriptors(serialized)? {
            let path = fdp.name.as_deref().unwrap_or("");
            if self.pool.get_file_by_name(path).is_none() {
                new_files.push(fdp);
            }
        }
        if new_files.is_empty() {
            return Ok(());
        }

        let new_names: HashSet<String> =
            new_files.iter().filter_map(|f| f.name.clone()).collect();
        let mut missing = Vec::new();
        for fdp in &new_files {
            for dep in &fdp.dependency {
                if self.pool.get_file_by_name(dep).is_none() && !new_names.contains(dep) {
                    missing.push(dep.clone());
                }
            }
        }
        for dep in missing {
            let request = v1::server_reflection_request::MessageRequest::FileByFilename(dep);
            if let Ok(v1::server_reflection_response::MessageResponse::FileDescriptorResponse(
                fdr,
            )) = self.reflect(request).await
            {
                Box::pin(self.add_file_descriptors(&fdr.file_descriptor_proto)).await?;
            }
        }

        // Transitive fetches may have registered some of our files already.
        let remaining: Vec<FileDescriptorProto> = new_files
            .into_iter()
            .filter(|f| {
                self.pool
                    .get_file_by_name(f.name.as_deref().unwrap_or(""))
                    .is_none()
            })
            .collect();
        if remaining.is_empty() {
            return Ok(());
        }

        let set = prost_types::FileDescriptorSet {
            file: remaining.clone(),
        };
        if let Err(batch_error) = self.pool.add_file_descriptor_set(set) {
            // One bad file must not sink the batch; register the rest
            // individually and let resolution decide whether enough landed.
            tracing::debug!(error = %batch_error, "batch descriptor registration failed, retrying per file");
            for fdp in remaining {
                let path = fdp.name.clone().unwrap_or_else(|| "<unnamed>".into());
                let single = prost_types::FileDescriptorSet { file: vec![fdp] };
                if let Err(e) = self.pool.add_file_descriptor_set(single) {
                    tracing::warn!(file = %path, error = %e, "skipping file descriptor");
                }
            }
        }
        Ok(())
    }

    /// Send one reflection request, negotiating v1 vs v1alpha on first use
    /// and caching the answer.
    async fn reflect(
        &self,
        request: v1::server_reflection_request::MessageRequest,
    ) -> Result<v1::server_reflection_response::MessageResponse> {
        match self.version.load(Ordering::Relaxed) {
            VERSION_V1 => return self.reflect_v1(request).await,
            VERSION_V1ALPHA => return self.reflect_v1alpha(request).await,
            _ => {}
        }

        match self.reflect_v1(request.clone()).await {
            Ok(response) => {
                self.version.store(VERSION_V1, Ordering::Relaxed);
                Ok(response)
            }
            Err(Error::ReflectionUnavailable) => {
                let response = self.reflect_v1alpha(request).await?;
                self.version.store(VERSION_V1ALPHA, Ordering::Relaxed);
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }

    async fn reflect_v1(
        &self,
        request: v1::server_reflection_request::MessageRequest,
    ) -> Result<v1::server_reflection_response::MessageResponse> {
        let request = v1::ServerReflectionRequest {
            host: String::new(),
            message_request: Some(request),
        };

        let (tx, rx) = mpsc::channel(1);
        tx.send(request)
            .await
            .map_err(|_| Error::TransportUnavailable("failed to queue reflection request".into()))?;
        drop(tx);

        let mut client = V1Client::new(self.channel.clone());
        let mut req = tonic::Request::new(ReceiverStream::new(rx));
        *req.metadata_mut() = self.metadata.clone();
        let response = client
            .server_reflection_info(req)
            .await
            .map_err(map_status)?;

        let mut stream = response.into_inner();
        let message = stream
            .message()
            .await
            .map_err(Error::Rpc)?
            .ok_or(Error::ReflectionUnavailable)?;

        extract_v1_response(message.message_response)
    }

    async fn reflect_v1alpha(
        &self,
        request: v1::server_reflection_request::MessageRequest,
    ) -> Result<v1::server_reflection_response::MessageResponse> {
        let request = request_to_v1alpha(request);

        let (tx, rx) = mpsc::channel(1);
        tx.send(request)
            .await
            .map_err(|_| Error::TransportUnavailable("failed to queue reflection request".into()))?;
        drop(tx);

        let mut client = V1alphaClient::new(self.channel.clone());
        let mut req = tonic::Request::new(ReceiverStream::new(rx));
        *req.metadata_mut() = self.metadata.clone();
        let response = client
            .server_reflection_info(req)
            .await
            .map_err(map_status)?;

        let mut stream = response.into_inner();
        let message = stream
            .message()
            .await
            .map_err(Error::Rpc)?
            .ok_or(Error::ReflectionUnavailable)?;

        response_from_v1alpha(message)
    }
}

fn service_info(descriptor: &ServiceDescriptor) -> ServiceInfo {
    ServiceInfo {
        name: descriptor.name().to_string(),
        full_name: descriptor.full_name().to_string(),
        methods: descriptor
            .methods()
            .map(|method| MethodInfo {
                name: method.name().to_string(),
                full_name: method.full_name().to_string(),
                method_type: MethodType::of(&method),
                descriptor: method,
            })
            .collect(),
        descriptor: Some(descriptor.clone()),
        error: None,
    }
}

fn decode_file_descriptors(serialized: &[Vec<u8>]) -> Result<Vec<FileDescriptorProto>> {
    serialized
        .iter()
        .map(|bytes| {
            FileDescriptorProto::decode(bytes.as_slice()).map_err(|e| {
                Error::InvalidDescriptor(format!("failed to decode file descriptor: {e}"))
            })
        })
        .collect()
}

fn short_name(full_name: &str) -> &str {
    full_name.rsplit('.').next().unwrap_or(full_name)
}

fn map_status(status: tonic::Status) -> Error {
    if status.code() == tonic::Code::Unimplemented {
        Error::ReflectionUnavailable
    } else {
        Error::Rpc(status)
    }
}

fn extract_v1_response(
    message: Option<v1::server_reflection_response::MessageResponse>,
) -> Result<v1::server_reflection_response::MessageResponse> {
    let message = message.ok_or_else(|| {
        Error::InvalidDescriptor("reflection response has no message".into())
    })?;

    if let v1::server_reflection_response::MessageResponse::ErrorResponse(ref error) = message {
        return Err(Error::InvalidDescriptor(format!(
            "reflection error (code {}): {}",
            error.error_code, error.error_message
        )));
    }

    Ok(message)
}

fn request_to_v1alpha(
    request: v1::server_reflection_request::MessageRequest,
) -> v1alpha::ServerReflectionRequest {
    use v1::server_reflection_request::MessageRequest;
    let message = match request {
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
        message_request: Some(message),
    }
}

fn response_from_v1alpha(
    response: v1alpha::ServerReflectionResponse,
) -> Result<v1::server_reflection_response::MessageResponse> {
    use v1alpha::server_reflection_response::MessageResponse;
    let message = response.message_response.ok_or_else(|| {
        Error::InvalidDescriptor("reflection response has no message".into())
    })?;

    let converted = match message {
        MessageResponse::FileDescriptorResponse(fdr) => {
            v1::server_reflection_response::MessageResponse::FileDescriptorResponse(
                v1::FileDescriptorResponse {
                    file_descriptor_proto: fdr.file_descriptor_proto,
                },
            )
        }
        MessageResponse::AllExtensionNumbersResponse(ext) => {
            v1::server_reflection_response::MessageResponse::AllExtensionNumbersResponse(
                v1::ExtensionNumberResponse {
                    base_type_name: ext.base_type_name,
                    extension_number: ext.extension_number,
                },
            )
        }
        MessageResponse::ListServicesResponse(list) => {
            v1::server_reflection_response::MessageResponse::ListServicesResponse(
                v1::ListServiceResponse {
                    service: list
                        .service
                        .into_iter()
                        .map(|s| v1::ServiceResponse { name: s.name })
                        .collect(),
                },
            )
        }
        MessageResponse::ErrorResponse(error) => {
            return Err(Error::InvalidDescriptor(format!(
                "reflection error (code {}): {}",
                error.error_code, error.error_message
            )));
        }
    };

    Ok(converted)
}
