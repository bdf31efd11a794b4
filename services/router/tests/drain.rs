
use std::time::Duration;

use beacon_router::{DrainOutcome, DrainState};
use harness::{get, request, send, upgrade, HttpBackend, RouterHandle};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

#[tokio::test]
async fn in_flight_request_finishes_during_drain() {
    let router = RouterHandle::spawn().await.unwrap();
    let backend = HttpBackend::spawn("slow").await.unwrap();

    router.register("drain.example.test", backend.addr).await;

    let addr = router.addr;
    let in_flight = tokio::spawn(async move {
        let mut req = request("GET", "drain.example.test", "/");
        req.headers_mut().insert("x-delay-ms", "300".parse().unwrap());
        send(addr, req).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(router.drain.begin_drain());
    assert_eq!(router.drain.state(), DrainState::Draining);

    let reply = timeout(Duration::from_secs(5), in_flight)
        .await
        .expect("in-flight request hung")
        .unwrap()
        .unwrap();
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.text(), "slow");

    let outcome = timeout(Duration::from_secs(5), router.drain.wait_drained())
        .await
        .expect("drain never completed");
    assert_eq!(outcome, DrainOutcome::Completed);
    assert_eq!(router.drain.state(), DrainState::Stopped);
}

#[tokio::test]
async fn new_connections_refused_once_draining() {
    let router = RouterHandle::spawn().await.unwrap();
    let backend = HttpBackend::spawn("app").await.unwrap();

    router.register("drain.example.test", backend.addr).await;
    assert_eq!(get(router.addr, "drain.example.test", "/").await.status, StatusCode::OK);

    router.drain.begin_drain();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = timeout(
        Duration::from_secs(2),
        send(router.addr, request("GET", "drain.example.test", "/")),
    )
    .await
    .expect("connect attempt hung");
    assert!(result.is_err());
}

#[tokio::test]
async fn drain_times_out_with_stuck_request() {
    let router = RouterHandle::spawn_with(harness::RouterOptions {
        drain_timeout: Duration::from_millis(200),
        ..harness::RouterOptions::default()
    })
    .await
    .unwrap();
    let backend = HttpBackend::spawn("stuck").await.unwrap();

    router.register("stuck.example.test", backend.addr).await;

    let addr = router.addr;
    let _stuck = tokio::spawn(async move {
        let mut req = request("GET", "stuck.example.test", "/");
        req.headers_mut().insert("x-delay-ms", "3000".parse().unwrap());
        send(addr, req).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    match router.drain.wait_drained().await {
        DrainOutcome::TimedOut { remaining } => assert!(remaining >= 1),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(router.drain.state(), DrainState::Stopped);
}

#[tokio::test]
async fn client_closing_tunnel_releases_drain() {
    let router = RouterHandle::spawn().await.unwrap();
    let backend = HttpBackend::spawn("ws").await.unwrap();

    router.register("ws.example.test", backend.addr).await;

    // The backend holds its side of `/hold` open indefinitely.
    let (status, io) = upgrade(router.addr, "ws.example.test", "/hold")
        .await
        .unwrap();
    assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
    let mut io = io.unwrap();
    io.write_all(b"still here").await.unwrap();
    io.flush().await.unwrap();

    assert!(router.drain.begin_drain());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(router.drain.in_flight() >= 1);

    drop(io);

    let outcome = timeout(Duration::from_secs(2), router.drain.wait_drained())
        .await
        .expect("tunnel kept the drain open after the client left");
    assert_eq!(outcome, DrainOutcome::Completed);
    assert_eq!(router.drain.state(), DrainState::Stopped);
}

#[tokio::test]
async fn open_tunnel_keeps_drain_waiting() {
    let router = RouterHandle::spawn_with(harness::RouterOptions {
        drain_timeout: Duration::from_millis(300),
        ..harness::RouterOptions::default()
    })
    .await
    .unwrap();
    let backend = HttpBackend::spawn("ws").await.unwrap();

    router.register("ws.example.test", backend.addr).await;

    let (status, io) = upgrade(router.addr, "ws.example.test", "/socket")
        .await
        .unwrap();
    assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
    let mut io = io.unwrap();

    match router.drain.wait_drained().await {
        DrainOutcome::TimedOut { remaining } => assert!(remaining >= 1),
        other => panic!("expected timeout, got {other:?}"),
    }

    // Stopping closes the tunnel from the router side.
    let mut buf = Vec::new();
    timeout(Duration::from_secs(2), io.read_to_end(&mut buf))
        .await
        .expect("tunnel survived the stop")
        .ok();
}
