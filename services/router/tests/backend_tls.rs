
use harness::{dead_addr, get, ClientIdentity, HttpBackend, RouterHandle, RouterOptions};
use http::StatusCode;

const BACKEND_SAN: &str = "instance-0.backend.internal";

async fn tls_router(backend: &HttpBackend, dir: &tempfile::TempDir) -> RouterHandle {
    RouterHandle::spawn_with(RouterOptions {
        backend_tls_enabled: true,
        backend_ca: Some(backend.write_cert(dir)),
        ..RouterOptions::default()
    })
    .await
    .unwrap()
}

async fn register_tls(router: &RouterHandle, uri: &str, backend: &HttpBackend, san: &str) {
    let plain_port = dead_addr().await.port();
    router
        .register_message(serde_json::json!({
            "host": backend.addr.ip().to_string(),
            "port": plain_port,
            "tls_port": backend.addr.port(),
            "uris": [uri],
            "app": "secure",
            "server_cert_domain_san": san,
        }))
        .await;
}

#[tokio::test]
async fn tls_backend_with_matching_san() {
    let dir = tempfile::tempdir().unwrap();
    let backend = HttpBackend::spawn_tls("secure", BACKEND_SAN).await.unwrap();
    let router = tls_router(&backend, &dir).await;

    register_tls(&router, "secure.example.test", &backend, BACKEND_SAN).await;

    let reply = get(router.addr, "secure.example.test", "/").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.text(), "secure");
    assert_eq!(backend.request_count(), 1);
}

#[tokio::test]
async fn tls_backend_with_wrong_san_gets_502() {
    let dir = tempfile::tempdir().unwrap();
    let backend = HttpBackend::spawn_tls("secure", BACKEND_SAN).await.unwrap();
    let router = tls_router(&backend, &dir).await;

    register_tls(&router, "mismatch.example.test", &backend, "someone-else.internal").await;

    let reply = get(router.addr, "mismatch.example.test", "/").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(backend.request_count(), 0);
}

#[tokio::test]
async fn tls_port_ignored_when_backend_tls_disabled() {
    let backend = HttpBackend::spawn("plain").await.unwrap();
    let router = RouterHandle::spawn().await.unwrap();

    router
        .register_message(serde_json::json!({
            "host": backend.addr.ip().to_string(),
            "port": backend.addr.port(),
            "tls_port": dead_addr().await.port(),
            "uris": ["plain.example.test"],
            "app": "plain",
        }))
        .await;

    let reply = get(router.addr, "plain.example.test", "/").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.text(), "plain");
}

#[tokio::test]
async fn mutual_tls_backend_accepts_router_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let identity = ClientIdentity::generate(dir.path());
    let backend = HttpBackend::spawn_mtls("mutual", BACKEND_SAN, &identity.ca_der)
        .await
        .unwrap();
    let router = RouterHandle::spawn_with(RouterOptions {
        backend_tls_enabled: true,
        backend_ca: Some(backend.write_cert(&dir)),
        backend_client_cert: Some((identity.cert_path.clone(), identity.key_path.clone())),
        ..RouterOptions::default()
    })
    .await
    .unwrap();

    register_tls(&router, "mutual.example.test", &backend, BACKEND_SAN).await;

    let reply = get(router.addr, "mutual.example.test", "/").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.text(), "mutual");
    assert_eq!(backend.request_count(), 1);
}

#[tokio::test]
async fn mutual_tls_backend_without_router_certificate_gets_502() {
    let dir = tempfile::tempdir().unwrap();
    let identity = ClientIdentity::generate(dir.path());
    let backend = HttpBackend::spawn_mtls("mutual", BACKEND_SAN, &identity.ca_der)
        .await
        .unwrap();
    let router = tls_router(&backend, &dir).await;

    register_tls(&router, "mutual.example.test", &backend, BACKEND_SAN).await;

    let reply = get(router.addr, "mutual.example.test", "/").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(backend.request_count(), 0);
}
