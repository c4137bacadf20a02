//! Common utilities for swarm integration tests.
//!
//! Every member runs its real HTTP API on an ephemeral localhost port, so
//! tests exercise the same wire traffic a deployed swarm does.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::routing::{delete, get, put};
use axum::Router;
use bytes::Bytes;
use swarmd::api::{self, AppState};
use swarmd::config::HealthConfig;
use swarmd::types::{RegistrationRequest, SWARM_PROTOCOL_VERSION};
use swarmd::{Config, SwarmError, SwarmService, UpdateApplier};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const SECRET: &str = "integration-secret";
pub const CONTROLLER: &str = "controller";

/// What an updater was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    Begin(String),
    Apply(String),
    Discard(String),
}

/// Updater that records every call. It can be told to fail staging, or
/// to panic once a discard is recorded.
#[derive(Debug, Default)]
pub struct RecordingUpdater {
    events: Mutex<Vec<UpdateEvent>>,
    fail_begin: AtomicBool,
    panic_on_discard: AtomicBool,
}

impl RecordingUpdater {
    pub fn failing() -> Self {
        let updater = Self::default();
        updater.fail_begin.store(true, Ordering::SeqCst);
        updater
    }

    pub fn panicking_on_discard() -> Self {
        let updater = Self::default();
        updater.panic_on_discard.store(true, Ordering::SeqCst);
        updater
    }

    pub fn discards(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, UpdateEvent::Discard(_)))
            .count()
    }

    pub fn events(&self) -> Vec<UpdateEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn applied(&self, version: &str) -> bool {
        self.events()
            .contains(&UpdateEvent::Apply(version.to_string()))
    }

    pub fn discarded(&self, version: &str) -> bool {
        self.events()
            .contains(&UpdateEvent::Discard(version.to_string()))
    }

    fn record(&self, event: UpdateEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl UpdateApplier for RecordingUpdater {
    async fn begin_update(&self, version: &str, _package: Bytes) -> swarmd::Result<()> {
        if self.fail_begin.load(Ordering::SeqCst) {
            return Err(SwarmError::Updater("staging disabled".into()));
        }
        self.record(UpdateEvent::Begin(version.to_string()));
        Ok(())
    }

    async fn apply_update(&self, version: &str) -> swarmd::Result<()> {
        self.record(UpdateEvent::Apply(version.to_string()));
        Ok(())
    }

    async fn discard_update(&self, version: &str) -> swarmd::Result<()> {
        self.record(UpdateEvent::Discard(version.to_string()));
        if self.panic_on_discard.load(Ordering::SeqCst) {
            panic!("updater crashed discarding {}", version);
        }
        Ok(())
    }
}

/// Configuration with timings suited to tests. Health checks only run when
/// a test asks for them.
pub fn test_config(identifier: &str, controller_address: Option<&str>) -> Config {
    Config {
        identifier: identifier.to_string(),
        controller_address: controller_address.map(str::to_owned),
        private_key: SECRET.to_string(),
        health: HealthConfig {
            controller_interval: Duration::from_secs(3600),
            node_interval: Duration::from_secs(3600),
            settle_delay: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(50),
        },
        update_commit_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

/// A swarm member serving its API on localhost.
pub struct TestMember {
    pub service: Arc<SwarmService>,
    pub updater: Arc<RecordingUpdater>,
    pub address: String,
    cancel: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl TestMember {
    pub async fn controller(required_node_count: usize) -> Self {
        let mut config = test_config(CONTROLLER, None);
        config.update_required_node_count = required_node_count;
        Self::spawn(config, RecordingUpdater::default()).await
    }

    /// A node of `controller`, not yet registered.
    pub async fn node(identifier: &str, controller: &TestMember) -> Self {
        Self::spawn(
            test_config(identifier, Some(&controller.address)),
            RecordingUpdater::default(),
        )
        .await
    }

    /// A registered node of `controller`.
    pub async fn joined(identifier: &str, controller: &TestMember) -> Self {
        let node = Self::node(identifier, controller).await;
        node.service.initialize().await.unwrap();
        node
    }

    pub async fn spawn(mut config: Config, updater: RecordingUpdater) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        config.address = address.clone();

        let cancel = CancellationToken::new();
        let updater = Arc::new(updater);
        let service = Arc::new(SwarmService::new(&config, updater.clone(), cancel.clone()).unwrap());

        let router = api::router(AppState {
            service: service.clone(),
        });
        let server = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let _ = api::serve(listener, router, cancel).await;
            }
        });

        Self {
            service,
            updater,
            address,
            cancel,
            server: Some(server),
        }
    }

    /// Takes the member off the network.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
    }
}

impl Drop for TestMember {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Serves a hand-written router on localhost, returning its base URL.
pub async fn spawn_router(router: Router, cancel: CancellationToken) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = api::serve(listener, router, cancel).await;
    });
    address
}

/// Serves `router` as node `identifier` and registers it with `controller`.
/// Returns the registration token.
pub async fn register_fake_node(
    controller: &TestMember,
    identifier: &str,
    router: Router,
    cancel: CancellationToken,
) -> Uuid {
    let address = spawn_router(router, cancel).await;
    let token = Uuid::new_v4();
    controller
        .service
        .accept_registration(
            token,
            RegistrationRequest {
                server_version: SWARM_PROTOCOL_VERSION.into(),
                identifier: identifier.into(),
                address,
                public_address: None,
            },
        )
        .await
        .unwrap();
    token
}

/// A node named `silent` that acknowledges everything but never reports
/// ready.
pub async fn silent_node(controller: &TestMember, cancel: CancellationToken) -> Uuid {
    let ok = || async { StatusCode::OK };
    let router = Router::new()
        .route("/Swarm", get(ok).post(ok))
        .route("/Swarm/Update", put(ok).post(ok).delete(ok))
        .route("/Swarm/Register", delete(ok));
    register_fake_node(controller, "silent", router, cancel).await
}

/// Polls `check` until it holds, panicking after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
