//! In-process test gRPC server exposing `grpctest.TestService` with server
//! reflection (v1 and v1alpha), used by the grpcdeck-core integration
//! tests.

pub mod pb {
    tonic::include_proto!("grpctest");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("grpctest_descriptor");
}

mod service;

pub use service::TestServiceImpl;

use std::net::SocketAddr;

use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic_reflection::server::Builder as ReflectionBuilder;

use pb::test_service_server::TestServiceServer;

/// Start the server on an ephemeral port, with reflection enabled, and
/// return its address. The server runs until the returned handle is
/// aborted or the runtime shuts down.
pub async fn spawn() -> (SocketAddr, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("listener has a local address");

    let reflection_v1 = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(pb::FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("reflection service builds");
    let reflection_v1alpha = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(pb::FILE_DESCRIPTOR_SET)
        .build_v1alpha()
        .expect("reflection service builds");

    let handle = tokio::spawn(async move {
        Server::builder()
            .add_service(reflection_v1)
            .add_service(reflection_v1alpha)
            .add_service(TestServiceServer::new(TestServiceImpl))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .expect("test server exited with error");
    });

    (addr, handle)
}

/// Start the server without any reflection service, for exercising the
/// reflection-unavailable path.
pub async fn spawn_without_reflection() -> (SocketAddr, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("listener has a local address");

    let handle = tokio::spawn(async move {
        Server::builder()
            .add_service(TestServiceServer::new(TestServiceImpl))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .expect("test server exited with error");
    });

    (addr, handle)
}
