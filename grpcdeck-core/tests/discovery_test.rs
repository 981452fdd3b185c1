//! Service discovery against a live reflection-enabled server.

use grpcdeck_core::{ConnectConfig, ConnectionManager, Error, MethodType, ReflectionClient};

async fn connect(address: String) -> ConnectionManager {
    let manager = ConnectionManager::new();
    manager
        .connect(ConnectConfig {
            address,
            ..Default::default()
        })
        .await
        .expect("connect to test server");
    manager
}

async fn reflection_client() -> ReflectionClient {
    let (addr, _server) = testserver::spawn().await;
    let manager = connect(addr.to_string()).await;
    manager.reflection_client().expect("manager is connected")
}

#[tokio::test]
async fn discovers_test_service_with_classified_methods() {
    let mut reflection = reflection_client().await;

    let services = reflection.list_services().await.unwrap();
    // The reflection services themselves are filtered out.
    assert_eq!(services.len(), 1);

    let service = &services[0];
    assert_eq!(service.name, "TestService");
    assert_eq!(service.full_name, "grpctest.TestService");
    assert!(service.error.is_none(), "{:?}", service.error);

    let methods: Vec<(&str, MethodType)> = service
        .methods
        .iter()
        .map(|m| (m.name.as_str(), m.method_type))
        .collect();
    assert_eq!(
        methods,
        vec![
            ("UnaryEcho", MethodType::Unary),
            ("StreamItems", MethodType::ServerStream),
            ("CollectItems", MethodType::ClientStream),
            ("BidiEcho", MethodType::BidiStream),
        ]
    );
}

#[tokio::test]
async fn method_descriptor_resolves_input_and_output_types() {
    let mut reflection = reflection_client().await;

    let method = reflection
        .method_descriptor("grpctest.TestService", "UnaryEcho")
        .await
        .unwrap();
    assert_eq!(method.full_name(), "grpctest.TestService.UnaryEcho");
    assert_eq!(method.input().full_name(), "grpctest.EchoRequest");
    assert_eq!(method.output().full_name(), "grpctest.EchoResponse");
    assert!(!method.is_client_streaming());
    assert!(!method.is_server_streaming());
}

#[tokio::test]
async fn missing_method_reports_method_not_found() {
    let mut reflection = reflection_client().await;

    let err = reflection
        .method_descriptor("grpctest.TestService", "NoSuchMethod")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MethodNotFound { .. }));
}

#[tokio::test]
async fn close_drops_the_cache_but_resolution_still_works() {
    let mut reflection = reflection_client().await;

    let before = reflection.list_services().await.unwrap();
    reflection.close();
    let after = reflection.list_services().await.unwrap();

    assert_eq!(before.len(), after.len());
    assert_eq!(before[0].full_name, after[0].full_name);
}

#[tokio::test]
async fn server_without_reflection_reports_reflection_unavailable() {
    let (addr, _server) = testserver::spawn_without_reflection().await;
    let manager = connect(addr.to_string()).await;
    let mut reflection = manager.reflection_client().unwrap();

    let err = reflection.list_services().await.unwrap_err();
    assert!(matches!(err, Error::ReflectionUnavailable));
}
