//! The swarm service: one per process, in either the controller or the
//! node role.
//!
//! The role is fixed at construction from configuration.  Role-specific
//! state lives in [`Role`]; operations that only make sense for one role
//! check it once at their entry point.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{info, warn};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{Config, HealthConfig, DEFAULT_PRIVATE_KEY};
use crate::error::{Result, SwarmError};
use crate::membership::MembershipStore;
use crate::tickets::TicketStore;
use crate::transport::{SharedRegistration, SwarmTransport};
use crate::types::SwarmMember;
use crate::updater::UpdateApplier;

mod checks;
mod registration;
mod update;

pub use registration::RegistrationResult;
pub use update::{
    CommitOutcome, FailedPhase, PrepareOutcome, UpdateOutcome, UpdatePhase, UpdateStatus,
};

pub(crate) use update::UpdateOperation;

/// State only the controller holds.
#[derive(Debug)]
pub struct ControllerState {
    /// Handed to every node on registration.
    signing_key: Vec<u8>,
}

/// State only a node holds.
#[derive(Debug, Default)]
pub struct NodeState {
    registration: SharedRegistration,
    signing_key: RwLock<Option<Vec<u8>>>,
    last_controller_contact: RwLock<Option<Instant>>,
    /// Set once registration failed for good; cleared only by restart.
    halted: RwLock<Option<RegistrationResult>>,
}

#[derive(Debug)]
pub enum Role {
    Controller(ControllerState),
    Node(NodeState),
}

pub struct SwarmService {
    identity: SwarmMember,
    role: Role,
    membership: Arc<MembershipStore>,
    transport: SwarmTransport,
    tickets: TicketStore,
    updater: Arc<dyn UpdateApplier>,
    /// The in-flight update, guarded apart from membership. Lock order is
    /// always update, then membership.
    update: Mutex<Option<UpdateOperation>>,
    health_signal: Notify,
    cancel: CancellationToken,
    private_key: String,
    required_node_count: usize,
    commit_timeout: Duration,
    health: HealthConfig,
}

impl SwarmService {
    pub fn new(
        config: &Config,
        updater: Arc<dyn UpdateApplier>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        if config.private_key == DEFAULT_PRIVATE_KEY {
            warn!("Running with the default private key; set SWARMD_PRIVATE_KEY");
        }

        let identity = SwarmMember {
            identifier: config.identifier.clone(),
            address: config.address.clone(),
            public_address: config.public_address.clone(),
            controller: config.is_controller(),
        };

        let role = if config.is_controller() {
            let signing_key = match &config.token_signing_key_base64 {
                Some(encoded) => STANDARD.decode(encoded).map_err(|e| {
                    SwarmError::Config(format!("invalid token_signing_key_base64: {}", e))
                })?,
                None => rand::random::<[u8; 32]>().to_vec(),
            };
            Role::Controller(ControllerState { signing_key })
        } else {
            Role::Node(NodeState::default())
        };

        let registration = match &role {
            Role::Node(node) => node.registration.clone(),
            Role::Controller(_) => SharedRegistration::default(),
        };
        let membership = Arc::new(MembershipStore::new(identity.clone()));
        let transport = SwarmTransport::new(config, membership.clone(), registration)?;

        Ok(Self {
            identity,
            role,
            membership,
            transport,
            tickets: TicketStore::new(),
            updater,
            update: Mutex::new(None),
            health_signal: Notify::new(),
            cancel,
            private_key: config.private_key.clone(),
            required_node_count: config.update_required_node_count,
            commit_timeout: config.update_commit_timeout,
            health: config.health.clone(),
        })
    }

    pub fn identity(&self) -> &SwarmMember {
        &self.identity
    }

    pub fn is_controller(&self) -> bool {
        matches!(self.role, Role::Controller(_))
    }

    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    pub fn health_config(&self) -> &HealthConfig {
        &self.health
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn tickets(&self) -> &TicketStore {
        &self.tickets
    }

    /// Snapshot of the current membership view.
    pub async fn members(&self) -> Vec<SwarmMember> {
        self.membership.snapshot().await
    }

    /// Wakes the health checker early.
    pub fn trigger_health_check(&self) {
        self.health_signal.notify_one();
    }

    pub(crate) fn health_signal(&self) -> &Notify {
        &self.health_signal
    }

    fn node(&self) -> Option<&NodeState> {
        match &self.role {
            Role::Node(node) => Some(node),
            Role::Controller(_) => None,
        }
    }

    /// Checks the `SwarmRegistration` header of an inbound request.
    ///
    /// The controller accepts any live token. A node accepts only the token
    /// its controller issued to it, and records the contact.
    pub async fn validate_registration(&self, token: Uuid) -> bool {
        match &self.role {
            Role::Controller(_) => self.membership.identifier_for(token).await.is_some(),
            Role::Node(node) => {
                let valid = *node.registration.read().await == Some(token);
                if valid {
                    *node.last_controller_contact.write().await = Some(Instant::now());
                }
                valid
            }
        }
    }

    /// When the controller last reached this node.
    pub async fn last_controller_contact(&self) -> Option<Instant> {
        match self.node() {
            Some(node) => *node.last_controller_contact.read().await,
            None => None,
        }
    }

    /// Signing key the controller handed out at registration.
    pub async fn token_signing_key(&self) -> Option<Vec<u8>> {
        match &self.role {
            Role::Controller(controller) => Some(controller.signing_key.clone()),
            Role::Node(node) => node.signing_key.read().await.clone(),
        }
    }

    /// Brings the service into the swarm.
    ///
    /// A node registers with its controller. Terminal registration failures
    /// are returned; transient ones are left to the health checker.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_controller() {
            info!("Swarm controller {} ready", self.identity.identifier);
            return Ok(());
        }

        match self.register_with_controller().await {
            RegistrationResult::Success => Ok(()),
            RegistrationResult::Unauthorized => Err(SwarmError::Unauthorized),
            RegistrationResult::VersionMismatch => Err(SwarmError::VersionMismatch {
                local: crate::types::SWARM_PROTOCOL_VERSION.into(),
                remote: "rejected by controller".into(),
            }),
            result => {
                warn!(
                    "Initial registration failed ({:?}); the health checker will retry",
                    result
                );
                self.trigger_health_check();
                Ok(())
            }
        }
    }

    /// Leaves the swarm on process shutdown.
    ///
    /// An uncommitted update is left as is; it dies with the process.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        match &self.role {
            Role::Controller(_) => {
                if self.update_in_progress().await {
                    warn!("Shutting down with an update in flight; nodes are not notified");
                } else {
                    self.broadcast_unregistration().await;
                }
            }
            Role::Node(_) => self.unregister_from_controller().await,
        }
    }
}

/// Runs a notification whose failure is only logged.
pub(crate) fn spawn_best_effort<F>(what: String, notification: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = notification.await {
            warn!("{} failed: {}", what, e);
        }
    });
}
