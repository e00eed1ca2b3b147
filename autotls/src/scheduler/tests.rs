use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::sleep;

use super::*;
use crate::store::{CredentialStore, Environment};
use crate::test_support::{issued_bundle, StubIssuer};

fn handle() -> Arc<ServerHandle> {
    Arc::new(ServerHandle::new("127.0.0.1:0".parse().unwrap(), None))
}

fn policy(check_interval: Duration) -> RenewalPolicy {
    RenewalPolicy::builder()
        .domain("example.com")
        .email("support@example.com")
        .check_interval(check_interval)
        .build()
}

fn scheduler(
    dir: &TempDir,
    issuer: StubIssuer,
    check_interval: Duration,
) -> (LifecycleScheduler<StubIssuer>, Arc<ServerHandle>) {
    let store = CredentialStore::new(dir.path());
    let engine = RenewalEngine::new(store, issuer);
    let handle = handle();
    (
        LifecycleScheduler::new(engine, policy(check_interval), handle.clone()),
        handle,
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn provision_installs_existing_valid_credentials() {
    let dir = TempDir::new().unwrap();
    CredentialStore::new(dir.path())
        .write(&issued_bundle("example.com", Environment::Production, 60))
        .unwrap();

    let issuer = StubIssuer::new(Environment::Production, 90);
    let calls = issuer.calls.clone();
    let (scheduler, handle) = scheduler(&dir, issuer, Duration::from_secs(3600));

    scheduler.provision().await;

    assert!(handle.has_secure_context());
    assert_eq!(handle.lifecycle_state(), LifecycleState::Running);
    assert_eq!(handle.secure_context_generation(), 1);
    // valid credentials on disk mean no issuance attempt at all
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn provision_issues_when_store_is_empty() {
    let dir = TempDir::new().unwrap();
    let issuer = StubIssuer::new(Environment::Production, 90);
    let (scheduler, handle) = scheduler(&dir, issuer, Duration::from_secs(3600));

    scheduler.provision().await;

    assert!(handle.has_secure_context());
    assert_eq!(handle.lifecycle_state(), LifecycleState::Running);
}

#[tokio::test(flavor = "multi_thread")]
async fn provision_degrades_when_issuance_fails() {
    let dir = TempDir::new().unwrap();
    let mut issuer = StubIssuer::new(Environment::Production, 90);
    issuer.fail_first = usize::MAX;
    let (scheduler, handle) = scheduler(&dir, issuer, Duration::from_secs(3600));

    scheduler.provision().await;

    assert!(!handle.has_secure_context());
    assert_eq!(handle.lifecycle_state(), LifecycleState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn degraded_start_recovers_on_a_later_tick() {
    let dir = TempDir::new().unwrap();
    let mut issuer = StubIssuer::new(Environment::Production, 90);
    issuer.fail_first = 1;
    let (scheduler, handle) = scheduler(&dir, issuer, Duration::from_millis(20));

    scheduler.provision().await;
    assert_eq!(handle.lifecycle_state(), LifecycleState::Idle);

    let task = scheduler.spawn();
    sleep(Duration::from_millis(300)).await;

    assert!(handle.has_secure_context());
    assert_eq!(handle.lifecycle_state(), LifecycleState::Running);
    task.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn valid_credentials_are_left_alone_by_the_loop() {
    let dir = TempDir::new().unwrap();
    CredentialStore::new(dir.path())
        .write(&issued_bundle("example.com", Environment::Production, 60))
        .unwrap();
    let issuer = StubIssuer::new(Environment::Production, 90);
    let calls = issuer.calls.clone();
    let (scheduler, handle) = scheduler(&dir, issuer, Duration::from_millis(20));

    scheduler.provision().await;
    let generation = handle.secure_context_generation();
    let task = scheduler.spawn();
    sleep(Duration::from_millis(200)).await;

    // several ticks ran; none issued, none touched the live context
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(handle.secure_context_generation(), generation);
    task.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn renewals_never_overlap() {
    let dir = TempDir::new().unwrap();
    // every issued certificate is already expired, so every tick renews
    let mut issuer = StubIssuer::new(Environment::Production, -1);
    issuer.delay = Duration::from_millis(50);
    let calls = issuer.calls.clone();
    let max_in_flight = issuer.max_in_flight.clone();
    let (scheduler, _handle) = scheduler(&dir, issuer, Duration::from_millis(10));

    scheduler.provision().await;
    let task = scheduler.spawn();
    sleep(Duration::from_millis(400)).await;
    task.abort();

    assert!(calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_failures_keep_the_retry_cadence() {
    let dir = TempDir::new().unwrap();
    let mut issuer = StubIssuer::new(Environment::Production, 90);
    issuer.fail_first = usize::MAX;
    let calls = issuer.calls.clone();
    let (scheduler, handle) = scheduler(&dir, issuer, Duration::from_millis(20));

    scheduler.provision().await;
    let task = scheduler.spawn();
    sleep(Duration::from_millis(200)).await;
    task.abort();

    // the loop keeps retrying and the process keeps running
    assert!(calls.load(Ordering::SeqCst) >= 3);
    assert_eq!(handle.lifecycle_state(), LifecycleState::Idle);
}
