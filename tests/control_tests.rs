//! Control state machine behavior, directly and through a client's socket.

use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use rust_loadharness::client::Client;
use rust_loadharness::config::ClientSettings;
use rust_loadharness::control::{ControlSignal, ControlState, ControlStateMachine};
use rust_loadharness::lease::{Lease, NEW_LEASE};
use rust_loadharness::pacer::PacerBounds;
use rust_loadharness::transport::UdpTransport;

async fn bind() -> Arc<UdpTransport> {
    Arc::new(UdpTransport::bind("127.0.0.1:0").await.unwrap())
}

#[tokio::test]
async fn start_wakes_exactly_one_waiter() {
    let control = Arc::new(ControlStateMachine::new(ControlState::Stopped));
    let woken = Arc::new(AtomicUsize::new(0));

    let mut waiters = Vec::new();
    for _ in 0..2 {
        let control = control.clone();
        let woken = woken.clone();
        waiters.push(tokio::spawn(async move {
            let state = control.wait_for_start().await;
            woken.fetch_add(1, Ordering::SeqCst);
            state
        }));
    }
    sleep(Duration::from_millis(20)).await;
    assert_eq!(woken.load(Ordering::SeqCst), 0);

    // Each start releases one waiter; the other stays parked even though
    // the state is now running.
    control.apply(ControlSignal::Start);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(woken.load(Ordering::SeqCst), 1);

    control.apply(ControlSignal::Start);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(woken.load(Ordering::SeqCst), 2);

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), ControlState::Running);
    }
}

#[tokio::test]
async fn kill_releases_waiters_and_is_terminal() {
    let control = Arc::new(ControlStateMachine::new(ControlState::Stopped));
    let waiter = {
        let control = control.clone();
        tokio::spawn(async move { control.wait_for_start().await })
    };
    let killed = {
        let control = control.clone();
        tokio::spawn(async move { control.killed().await })
    };
    sleep(Duration::from_millis(20)).await;

    assert_eq!(control.apply(ControlSignal::Kill), ControlState::Killed);
    assert_eq!(
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap(),
        ControlState::Killed
    );
    timeout(Duration::from_secs(1), killed).await.unwrap().unwrap();

    for signal in [ControlSignal::Start, ControlSignal::Stop, ControlSignal::Kill] {
        assert_eq!(control.apply(signal), ControlState::Killed);
    }
}

#[tokio::test]
async fn repeated_signals_are_idempotent() {
    let control = ControlStateMachine::default();
    assert_eq!(control.apply(ControlSignal::Start), ControlState::Running);
    assert_eq!(control.apply(ControlSignal::Start), ControlState::Running);
    assert_eq!(control.apply(ControlSignal::Stop), ControlState::Stopped);
    assert_eq!(control.apply(ControlSignal::Stop), ControlState::Stopped);
    assert!(!control.is_running());
}

#[tokio::test]
async fn kill_datagram_ends_client_run() {
    let load_balancer = bind().await;
    let client = Client::new(
        ClientSettings {
            progress: false,
            lease_retry_timeout: Duration::from_millis(20),
            ..ClientSettings::default()
        },
        PacerBounds::default(),
        bind().await,
        load_balancer.local_addr().unwrap(),
        1,
    );
    let target = client.local_addr().unwrap();
    let run = tokio::spawn(client.clone().run());

    // Without a lease the client keeps asking for one.
    let (payload, _) = timeout(Duration::from_secs(1), load_balancer.recv(64))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, NEW_LEASE.as_bytes());

    bind().await.send_to(b"kill", target).await.unwrap();
    let result = timeout(Duration::from_secs(1), run)
        .await
        .expect("kill must end the run")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(client.control().state(), ControlState::Killed);
}

#[tokio::test]
async fn stopped_client_waits_for_start() {
    let load_balancer = bind().await;
    let frontend = bind().await;
    let client = Client::new(
        ClientSettings {
            progress: false,
            start_stopped: true,
            initial_timeout: Duration::from_millis(50),
            ..ClientSettings::default()
        },
        PacerBounds::default(),
        bind().await,
        load_balancer.local_addr().unwrap(),
        1,
    );
    client.lease().install(Lease {
        frontend: frontend.local_addr().unwrap(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
    });
    let target = client.local_addr().unwrap();
    let run = tokio::spawn(client.clone().run());

    assert!(
        timeout(Duration::from_millis(100), frontend.recv(64))
            .await
            .is_err(),
        "a stopped client sends nothing"
    );

    let controller = bind().await;
    controller.send_to(b"start", target).await.unwrap();
    let (key, _) = timeout(Duration::from_secs(1), frontend.recv(64))
        .await
        .expect("started client sends a request")
        .unwrap();
    assert_eq!(key, b"1 0");

    controller.send_to(b"kill", target).await.unwrap();
    assert!(timeout(Duration::from_secs(1), run)
        .await
        .unwrap()
        .unwrap()
        .is_ok());
}
