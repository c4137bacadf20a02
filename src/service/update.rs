//! Two-phase commit of a new version across the swarm.
//!
//! Prepare stages the package on every member; each node then reports
//! ready to the controller, which commits once all of them did or aborts
//! on failure or timeout.  At most one update exists per process.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use reqwest::Method;
use serde::Serialize;
use uuid::Uuid;

use super::{spawn_best_effort, Role, SwarmService};
use crate::error::{Result, SwarmError};
use crate::gate::{CommitDecision, CommitGate};
use crate::tickets::StagedPackage;
use crate::transport::Target;
use crate::types::{AbortQuery, Route, SwarmMember, UpdateRequest};

/// Where this process stands in the update protocol.
///
/// Committed and aborted updates are reported to the caller and leave the
/// process idle again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdatePhase {
    Idle,
    Preparing,
    AwaitingCommit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatus {
    pub phase: UpdatePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
}

/// Phase an operator-requested update failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailedPhase {
    Registration,
    Prepare,
    CommitWait,
}

impl fmt::Display for FailedPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Registration => "registration",
            Self::Prepare => "prepare",
            Self::CommitWait => "commit-wait",
        })
    }
}

/// Result of an operator-requested update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum UpdateOutcome {
    Committed {
        version: String,
    },
    #[serde(rename_all = "camelCase")]
    Aborted {
        phase: FailedPhase,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        acknowledged: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        expected: Option<usize>,
    },
}

impl UpdateOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    fn aborted(phase: FailedPhase, error: &SwarmError) -> Self {
        let (acknowledged, expected) = match *error {
            SwarmError::FanOut {
                acknowledged,
                expected,
            } => (Some(acknowledged), Some(expected)),
            SwarmError::InsufficientNodes {
                connected,
                required,
            } => (Some(connected), Some(required)),
            _ => (None, None),
        };
        Self::Aborted {
            phase,
            reason: error.to_string(),
            acknowledged,
            expected,
        }
    }
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Committed { version } => write!(f, "update to {} committed", version),
            Self::Aborted {
                phase,
                reason,
                acknowledged,
                expected,
            } => {
                write!(f, "update aborted during {}: {}", phase, reason)?;
                if let (Some(acknowledged), Some(expected)) = (acknowledged, expected) {
                    write!(f, " ({}/{} nodes)", acknowledged, expected)?;
                }
                Ok(())
            }
        }
    }
}

/// Whether a prepare did any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    Prepared,
    /// The same version was already in flight.
    AlreadyPrepared,
}

/// Decision handed back by [`SwarmService::commit_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every member prepared; the update was applied locally.
    MustCommit,
    Abort {
        reason: String,
        acknowledged: Option<usize>,
        expected: Option<usize>,
    },
}

impl CommitOutcome {
    fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
            acknowledged: None,
            expected: None,
        }
    }
}

/// The single in-flight update of a process.
#[derive(Debug)]
pub(crate) struct UpdateOperation {
    pub(crate) target_version: String,
    phase: UpdatePhase,
    download_tickets: HashMap<String, String>,
    /// Nodes still owing a ready signal. Controller only.
    pending_ready: HashSet<String>,
    expected_ready: usize,
    gate: CommitGate,
    /// Whether the updater holds a staged package for this version.
    staged: bool,
    coordinating: bool,
}

impl UpdateOperation {
    fn new(target_version: &str, download_tickets: HashMap<String, String>, coordinating: bool) -> Self {
        Self {
            target_version: target_version.to_owned(),
            phase: UpdatePhase::Preparing,
            download_tickets,
            pending_ready: HashSet::new(),
            expected_ready: 0,
            gate: CommitGate::new(),
            staged: false,
            coordinating,
        }
    }

    /// Opens the gate once the coordinator has heard from everyone.
    fn resolve_if_ready(&self) {
        if self.coordinating
            && self.phase == UpdatePhase::AwaitingCommit
            && self.pending_ready.is_empty()
            && self.gate.resolve(CommitDecision::Proceed)
        {
            info!("All nodes ready to commit {}", self.target_version);
        }
    }
}

enum Begin {
    Started,
    /// The same version is already in flight; its gate carries the outcome.
    InFlight(CommitGate),
}

impl Begin {
    fn outcome(&self) -> PrepareOutcome {
        match self {
            Begin::Started => PrepareOutcome::Prepared,
            Begin::InFlight(_) => PrepareOutcome::AlreadyPrepared,
        }
    }
}

/// Where the controller gets the package from.
enum PackageOrigin {
    Local(StagedPackage),
    Remote(UpdateRequest),
}

impl SwarmService {
    pub async fn update_status(&self) -> UpdateStatus {
        match self.update.lock().await.as_ref() {
            Some(operation) => UpdateStatus {
                phase: operation.phase,
                target_version: Some(operation.target_version.clone()),
            },
            None => UpdateStatus {
                phase: UpdatePhase::Idle,
                target_version: None,
            },
        }
    }

    pub async fn update_in_progress(&self) -> bool {
        self.update.lock().await.is_some()
    }

    /// Operator entry point: updates the whole swarm to `version`.
    ///
    /// A request for the version already in flight reports the outcome of
    /// that update instead of starting another.
    pub async fn request_update(&self, version: &str, package: Bytes) -> UpdateOutcome {
        match self.prepare_local(version, package).await {
            Ok(Begin::Started) => {}
            Ok(Begin::InFlight(gate)) => return self.await_in_flight(version, gate).await,
            Err(e) => {
                let phase = match e {
                    SwarmError::NotRegistered | SwarmError::MembershipPending => {
                        FailedPhase::Registration
                    }
                    _ => FailedPhase::Prepare,
                };
                let outcome = UpdateOutcome::aborted(phase, &e);
                warn!("{}", outcome);
                return outcome;
            }
        }

        let outcome = match self.commit_update().await {
            CommitOutcome::MustCommit => UpdateOutcome::Committed {
                version: version.to_owned(),
            },
            CommitOutcome::Abort {
                reason,
                acknowledged,
                expected,
            } => UpdateOutcome::Aborted {
                phase: FailedPhase::CommitWait,
                reason,
                acknowledged,
                expected,
            },
        };
        info!("{}", outcome);
        outcome
    }

    async fn await_in_flight(&self, version: &str, gate: CommitGate) -> UpdateOutcome {
        info!("Update to {} already in flight, waiting for its outcome", version);
        let decision = tokio::select! {
            decision = gate.wait() => Some(decision),
            _ = self.cancel.cancelled() => None,
        };
        let outcome = match decision {
            Some(CommitDecision::Proceed) => UpdateOutcome::Committed {
                version: version.to_owned(),
            },
            Some(CommitDecision::Abort) => UpdateOutcome::Aborted {
                phase: FailedPhase::CommitWait,
                reason: format!("update to {} already in flight was aborted", version),
                acknowledged: None,
                expected: None,
            },
            None => UpdateOutcome::Aborted {
                phase: FailedPhase::CommitWait,
                reason: "shutting down".to_owned(),
                acknowledged: None,
                expected: None,
            },
        };
        info!("{}", outcome);
        outcome
    }

    /// Prepares an update whose package is local to this process.
    ///
    /// The controller fans out to every node; a node forwards the request
    /// to the controller and holds the package open for download.
    pub async fn prepare_update(&self, version: &str, package: Bytes) -> Result<PrepareOutcome> {
        self.prepare_local(version, package)
            .await
            .map(|begin| begin.outcome())
    }

    async fn prepare_local(&self, version: &str, package: Bytes) -> Result<Begin> {
        let package = StagedPackage::new(package);
        info!(
            "Preparing update to {} ({} bytes, sha256 {})",
            version,
            package.bytes.len(),
            package.sha256
        );
        match &self.role {
            Role::Controller(_) => {
                self.prepare_as_controller(version, PackageOrigin::Local(package))
                    .await
            }
            Role::Node(_) => self.prepare_as_origin_node(version, package).await,
        }
    }

    /// Handles `PUT Update` from a peer.
    ///
    /// The controller receives this from a node that originated an update;
    /// a node receives it as the controller's fan-out. On success a commit
    /// driver is left running to see the update through.
    pub async fn prepare_update_from_peer(
        self: &Arc<Self>,
        request: UpdateRequest,
    ) -> Result<PrepareOutcome> {
        let version = request.update_version.clone();
        let begin = match &self.role {
            Role::Controller(_) => {
                self.prepare_as_controller(&version, PackageOrigin::Remote(request))
                    .await?
            }
            Role::Node(_) => self.prepare_from_controller(request).await?,
        };

        if let Begin::Started = begin {
            self.spawn_commit_driver(version);
        }
        Ok(begin.outcome())
    }

    async fn prepare_as_controller(
        &self,
        version: &str,
        origin: PackageOrigin,
    ) -> Result<Begin> {
        let tickets = match &origin {
            PackageOrigin::Remote(request) => request.download_tickets.clone(),
            PackageOrigin::Local(_) => HashMap::new(),
        };
        let begin = self.begin_operation(version, tickets, true).await?;
        if let Begin::InFlight(_) = begin {
            return Ok(begin);
        }

        match self.coordinate_prepare(version, origin).await {
            Ok(()) => Ok(Begin::Started),
            Err(e) => {
                warn!("Prepare of {} failed: {}", version, e);
                let notify = !matches!(e, SwarmError::InsufficientNodes { .. });
                self.abort_operation(Some(version), notify).await;
                Err(e)
            }
        }
    }

    async fn coordinate_prepare(&self, version: &str, origin: PackageOrigin) -> Result<()> {
        let source = match &origin {
            PackageOrigin::Local(_) => self.identity.identifier.clone(),
            PackageOrigin::Remote(request) => request.source_node.clone(),
        };

        // Registrations are refused from here on, so this is the final set.
        let nodes = self.membership.nodes().await;
        if nodes.len() < self.required_node_count {
            return Err(SwarmError::InsufficientNodes {
                connected: nodes.len(),
                required: self.required_node_count,
            });
        }
        let pending: HashSet<String> = nodes.iter().map(|n| n.identifier.clone()).collect();
        self.with_operation(version, |operation| {
            operation.expected_ready = pending.len();
            operation.pending_ready = pending;
        })
        .await
        .ok_or_else(|| SwarmError::conflict("update aborted during prepare"))?;

        let fan_out: Vec<SwarmMember> = nodes
            .into_iter()
            .filter(|node| node.identifier != source)
            .collect();

        let (bytes, request) = match origin {
            PackageOrigin::Local(package) => {
                let mut download_tickets = HashMap::new();
                for node in &fan_out {
                    download_tickets.insert(node.identifier.clone(), self.tickets.issue(&package).await);
                }
                let request = UpdateRequest {
                    update_version: version.to_owned(),
                    source_node: source,
                    download_tickets,
                };
                (package.bytes, request)
            }
            PackageOrigin::Remote(request) => {
                let source_member = self.membership.member(&source).await.ok_or_else(|| {
                    SwarmError::Ticket(format!("source node {} is not a member", source))
                })?;
                let ticket = request
                    .download_tickets
                    .get(&self.identity.identifier)
                    .ok_or_else(|| SwarmError::Ticket("no download ticket for the controller".into()))?;
                let bytes = self
                    .transport
                    .download(Target::Member(&source_member), ticket)
                    .await?;
                (bytes, request)
            }
        };

        self.stage_locally(version, bytes).await?;
        self.fan_out_prepare(&fan_out, &request).await?;
        self.enter_awaiting_commit(version).await
    }

    async fn prepare_as_origin_node(
        &self,
        version: &str,
        package: StagedPackage,
    ) -> Result<Begin> {
        if !self.is_registered().await {
            return Err(SwarmError::NotRegistered);
        }
        // Tickets are keyed by identifier, and only the pushed view names
        // the controller.
        let members = self.membership.snapshot().await;
        if !members.iter().any(|member| member.controller) {
            return Err(SwarmError::MembershipPending);
        }
        let begin = self.begin_operation(version, HashMap::new(), false).await?;
        if let Begin::InFlight(_) = begin {
            return Ok(begin);
        }

        let result = async {
            self.stage_locally(version, package.bytes.clone()).await?;

            let mut download_tickets = HashMap::new();
            for member in members {
                if member.identifier != self.identity.identifier {
                    download_tickets.insert(member.identifier, self.tickets.issue(&package).await);
                }
            }
            let request = UpdateRequest {
                update_version: version.to_owned(),
                source_node: self.identity.identifier.clone(),
                download_tickets,
            };

            self.transport
                .call_json(Target::Controller, Method::PUT, Route::Update, &request)
                .await?;
            self.enter_awaiting_commit(version).await
        }
        .await;

        match result {
            Ok(()) => Ok(Begin::Started),
            Err(e) => {
                warn!("Controller did not accept update to {}: {}", version, e);
                // A refusal means the controller already cleaned up; a lost
                // exchange leaves it unsure, so tell it.
                let notify = matches!(e, SwarmError::Http(_));
                self.abort_operation(Some(version), notify).await;
                Err(e)
            }
        }
    }

    async fn prepare_from_controller(&self, request: UpdateRequest) -> Result<Begin> {
        let version = request.update_version.as_str();
        let begin = self
            .begin_operation(version, request.download_tickets.clone(), false)
            .await?;
        if let Begin::InFlight(_) = begin {
            return Ok(begin);
        }

        let result = async {
            let ticket = request
                .download_tickets
                .get(&self.identity.identifier)
                .ok_or_else(|| SwarmError::Ticket(format!("no download ticket for {}", self.identity.identifier)))?;

            // Without a pushed view yet, the controller is the only peer we know.
            let source_member = self.membership.member(&request.source_node).await;
            let source = match &source_member {
                Some(member) => Target::Member(member),
                None => Target::Controller,
            };
            let bytes = self.transport.download(source, ticket).await?;

            self.stage_locally(version, bytes).await?;
            self.enter_awaiting_commit(version).await
        }
        .await;

        match result {
            Ok(()) => Ok(Begin::Started),
            Err(e) => {
                warn!("Prepare of {} from the controller failed: {}", version, e);
                // The controller learns from the failed request itself.
                self.abort_operation(Some(version), false).await;
                Err(e)
            }
        }
    }

    /// Creates the operation, or reports the same version already in flight.
    async fn begin_operation(
        &self,
        version: &str,
        download_tickets: HashMap<String, String>,
        coordinating: bool,
    ) -> Result<Begin> {
        let mut update = self.update.lock().await;
        match update.as_ref() {
            Some(operation) if operation.target_version == version => {
                debug!("Update to {} already in flight", version);
                Ok(Begin::InFlight(operation.gate.clone()))
            }
            Some(operation) => Err(SwarmError::conflict(format!(
                "update to {} already in progress",
                operation.target_version
            ))),
            None => {
                *update = Some(UpdateOperation::new(version, download_tickets, coordinating));
                Ok(Begin::Started)
            }
        }
    }

    /// Runs `f` on the operation if it is still the one for `version`.
    async fn with_operation<R>(
        &self,
        version: &str,
        f: impl FnOnce(&mut UpdateOperation) -> R,
    ) -> Option<R> {
        let mut update = self.update.lock().await;
        match update.as_mut() {
            Some(operation) if operation.target_version == version => Some(f(operation)),
            _ => None,
        }
    }

    async fn stage_locally(&self, version: &str, bytes: Bytes) -> Result<()> {
        self.updater.begin_update(version, bytes).await?;

        let staged = self
            .with_operation(version, |operation| operation.staged = true)
            .await
            .is_some();
        if !staged {
            // Aborted while the updater was busy; nobody else will discard it.
            if let Err(e) = self.updater.discard_update(version).await {
                error!("Failed to discard {}: {}", version, e);
            }
            return Err(SwarmError::conflict("update aborted while staging"));
        }
        Ok(())
    }

    async fn enter_awaiting_commit(&self, version: &str) -> Result<()> {
        self.with_operation(version, |operation| {
            operation.phase = UpdatePhase::AwaitingCommit;
            debug!(
                "Update to {} prepared ({} tickets)",
                version,
                operation.download_tickets.len()
            );
            operation.resolve_if_ready();
        })
        .await
        .ok_or_else(|| SwarmError::conflict("update aborted during prepare"))
    }

    /// Asks every node in `nodes` to prepare. All must succeed.
    async fn fan_out_prepare(&self, nodes: &[SwarmMember], request: &UpdateRequest) -> Result<()> {
        if let Some(node) = nodes
            .iter()
            .find(|node| !request.download_tickets.contains_key(&node.identifier))
        {
            return Err(SwarmError::Ticket(format!(
                "no download ticket for {}",
                node.identifier
            )));
        }
        if nodes.is_empty() {
            return Ok(());
        }

        info!(
            "Asking {} nodes to prepare {}",
            nodes.len(),
            request.update_version
        );
        let calls = nodes.iter().map(|node| async move {
            self.transport
                .call_json(Target::Member(node), Method::PUT, Route::Update, request)
                .await
                .map_err(|e| warn!("Node {} failed to prepare: {}", node.identifier, e))
                .is_ok()
        });
        let acknowledged = join_all(calls).await.into_iter().filter(|ok| *ok).count();

        if acknowledged == nodes.len() {
            Ok(())
        } else {
            Err(SwarmError::FanOut {
                acknowledged,
                expected: nodes.len(),
            })
        }
    }

    fn spawn_commit_driver(self: &Arc<Self>, version: String) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            match service.commit_update().await {
                CommitOutcome::MustCommit => info!("Update to {} committed", version),
                CommitOutcome::Abort { reason, .. } => {
                    warn!("Update to {} not committed: {}", version, reason)
                }
            }
        });
    }

    /// Handles `POST Update`: a node's ready signal on the controller, the
    /// commit broadcast on a node.
    pub async fn update_signal_received(&self, token: Uuid) -> Result<()> {
        match &self.role {
            Role::Controller(_) => self.ready_received(token).await,
            Role::Node(_) => self.commit_received().await,
        }
    }

    /// Controller: records that the node holding `token` is ready.
    pub async fn ready_received(&self, token: Uuid) -> Result<()> {
        let identifier = self
            .membership
            .identifier_for(token)
            .await
            .ok_or(SwarmError::Unauthorized)?;

        let mut update = self.update.lock().await;
        let operation = update
            .as_mut()
            .ok_or_else(|| SwarmError::conflict("no update in progress"))?;
        if operation.pending_ready.remove(&identifier) {
            info!(
                "Node {} ready to commit {} ({} outstanding)",
                identifier,
                operation.target_version,
                operation.pending_ready.len()
            );
        } else {
            debug!("Repeated ready signal from {}", identifier);
        }
        operation.resolve_if_ready();
        Ok(())
    }

    /// Node: the controller decided to commit.
    pub async fn commit_received(&self) -> Result<()> {
        let update = self.update.lock().await;
        match update.as_ref() {
            Some(operation) if operation.phase == UpdatePhase::AwaitingCommit => {
                info!("Controller committed {}", operation.target_version);
                operation.gate.resolve(CommitDecision::Proceed);
                Ok(())
            }
            Some(operation) => Err(SwarmError::conflict(format!(
                "update to {} is not prepared",
                operation.target_version
            ))),
            None => Err(SwarmError::conflict("no update in progress")),
        }
    }

    /// Waits for the commit decision of the prepared update and acts on it.
    ///
    /// A node reports ready and then waits for the controller for as long
    /// as it takes. The controller waits for every node up to the commit
    /// timeout, then broadcasts the commit.
    pub async fn commit_update(&self) -> CommitOutcome {
        let (version, gate, expected) = {
            let update = self.update.lock().await;
            match update.as_ref() {
                Some(operation) if operation.phase == UpdatePhase::AwaitingCommit => (
                    operation.target_version.clone(),
                    operation.gate.clone(),
                    operation.expected_ready,
                ),
                Some(_) => return CommitOutcome::abort("update is still preparing"),
                None => return CommitOutcome::abort("no update in progress"),
            }
        };

        match &self.role {
            Role::Node(_) => self.commit_as_node(&version, gate).await,
            Role::Controller(_) => self.commit_as_controller(&version, gate, expected).await,
        }
    }

    async fn commit_as_node(&self, version: &str, gate: CommitGate) -> CommitOutcome {
        if let Err(e) = self
            .transport
            .call(Target::Controller, Method::POST, Route::Update)
            .await
        {
            self.abort_operation(Some(version), true).await;
            return CommitOutcome::abort(format!("ready signal failed: {}", e));
        }

        let decision = tokio::select! {
            decision = gate.wait() => decision,
            _ = self.cancel.cancelled() => return CommitOutcome::abort("shutting down"),
        };
        match decision {
            CommitDecision::Proceed => self.complete(version).await,
            CommitDecision::Abort => CommitOutcome::abort("aborted by the swarm"),
        }
    }

    async fn commit_as_controller(
        &self,
        version: &str,
        gate: CommitGate,
        expected: usize,
    ) -> CommitOutcome {
        let decision = tokio::select! {
            result = tokio::time::timeout(self.commit_timeout, gate.wait()) => result.ok(),
            _ = self.cancel.cancelled() => return CommitOutcome::abort("shutting down"),
        };

        if decision == Some(CommitDecision::Proceed) {
            return self.complete(version).await;
        }

        let outstanding = self
            .with_operation(version, |operation| operation.pending_ready.len())
            .await
            .unwrap_or(expected);
        let reason = match decision {
            None => format!("timed out after {:?} waiting for nodes", self.commit_timeout),
            Some(_) => "aborted by the swarm".to_owned(),
        };
        self.abort_operation(Some(version), true).await;
        CommitOutcome::Abort {
            reason,
            acknowledged: Some(expected.saturating_sub(outstanding)),
            expected: Some(expected),
        }
    }

    /// Applies a committed update, broadcasting the commit first on the
    /// controller.
    async fn complete(&self, version: &str) -> CommitOutcome {
        let operation = {
            let mut update = self.update.lock().await;
            let committed = matches!(
                update.as_ref(),
                Some(operation) if operation.target_version == version
                    && operation.gate.decision() == Some(CommitDecision::Proceed)
            );
            if committed {
                update.take()
            } else {
                None
            }
        };
        if operation.is_none() {
            return CommitOutcome::abort("update was aborted");
        }

        if self.is_controller() {
            self.broadcast_commit(version).await;
        }
        self.tickets.revoke_all().await;

        match self.updater.apply_update(version).await {
            Ok(()) => {
                info!("Committed update to {}", version);
                CommitOutcome::MustCommit
            }
            Err(e) => {
                error!("Update to {} committed but could not be applied: {}", version, e);
                CommitOutcome::abort(format!("apply failed: {}", e))
            }
        }
    }

    /// Tells every node to commit. A node that misses this cannot be
    /// recovered automatically.
    async fn broadcast_commit(&self, version: &str) {
        let nodes = self.membership.nodes().await;
        let commits = nodes.iter().map(|node| async move {
            if let Err(e) = self
                .transport
                .call(Target::Member(node), Method::POST, Route::Update)
                .await
            {
                error!(
                    "Node {} missed the commit of {}: {}",
                    node.identifier, version, e
                );
            }
        });
        join_all(commits).await;
    }

    /// Aborts whatever update is in flight and tells the other members.
    /// Returns `false` if there was nothing to abort.
    pub async fn abort_update(&self) -> bool {
        self.abort_operation(None, true).await
    }

    /// Handles `DELETE Update`. The controller relays the abort to every
    /// node. A notice naming another version is stale and ignored.
    pub async fn abort_received(&self, version: Option<&str>) -> bool {
        let relay = self.is_controller();
        let aborted = self.abort_operation(version, relay).await;
        if !aborted {
            debug!("Abort notice for {:?} matched no update", version);
        }
        aborted
    }

    /// Aborts the in-flight update, if it matches `version`. Idempotent.
    pub(crate) async fn abort_operation(&self, version: Option<&str>, notify: bool) -> bool {
        let operation = {
            let mut update = self.update.lock().await;
            let matches = match (update.as_ref(), version) {
                (Some(operation), Some(version)) => operation.target_version == version,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if matches {
                update.take()
            } else {
                None
            }
        };
        let Some(operation) = operation else {
            return false;
        };

        warn!("Aborting update to {}", operation.target_version);
        operation.gate.resolve(CommitDecision::Abort);
        self.tickets.revoke_all().await;
        if operation.staged {
            if let Err(e) = self.updater.discard_update(&operation.target_version).await {
                error!("Failed to discard {}: {}", operation.target_version, e);
            }
        }
        if notify {
            self.notify_abort(&operation.target_version).await;
        }
        true
    }

    async fn notify_abort(&self, version: &str) {
        let query = AbortQuery {
            version: Some(version.to_owned()),
        };
        match &self.role {
            Role::Controller(_) => {
                for node in self.membership.nodes().await {
                    let transport = self.transport.clone();
                    let query = query.clone();
                    spawn_best_effort(format!("Abort notice to {}", node.identifier), async move {
                        transport
                            .call_with_query(Target::Member(&node), Method::DELETE, Route::Update, &query)
                            .await
                            .map(|_| ())
                    });
                }
            }
            Role::Node(_) => {
                let transport = self.transport.clone();
                spawn_best_effort("Abort notice to the controller".into(), async move {
                    transport
                        .call_with_query(Target::Controller, Method::DELETE, Route::Update, &query)
                        .await
                        .map(|_| ())
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_outcome_reports_phase_and_counts() {
        let outcome = UpdateOutcome::aborted(
            FailedPhase::Prepare,
            &SwarmError::FanOut {
                acknowledged: 1,
                expected: 2,
            },
        );
        assert_eq!(
            outcome.to_string(),
            "update aborted during prepare: 1 of 2 nodes prepared (1/2 nodes)"
        );
    }

    #[test]
    fn outcome_json_shape() {
        let outcome = UpdateOutcome::Aborted {
            phase: FailedPhase::CommitWait,
            reason: "timed out".into(),
            acknowledged: Some(1),
            expected: Some(2),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "aborted");
        assert_eq!(json["phase"], "commitWait");
        assert_eq!(json["acknowledged"], 1);

        let committed = UpdateOutcome::Committed {
            version: "5.0.0".into(),
        };
        assert_eq!(
            serde_json::to_value(&committed).unwrap(),
            serde_json::json!({"outcome": "committed", "version": "5.0.0"})
        );
    }

    #[test]
    fn coordinator_resolves_when_nobody_is_pending() {
        let mut operation = UpdateOperation::new("5.0.0", HashMap::new(), true);
        operation.resolve_if_ready();
        assert_eq!(operation.gate.decision(), None);

        operation.phase = UpdatePhase::AwaitingCommit;
        operation.resolve_if_ready();
        assert_eq!(operation.gate.decision(), Some(CommitDecision::Proceed));
    }

    #[test]
    fn node_operation_never_resolves_itself() {
        let mut operation = UpdateOperation::new("5.0.0", HashMap::new(), false);
        operation.phase = UpdatePhase::AwaitingCommit;
        operation.resolve_if_ready();
        assert_eq!(operation.gate.decision(), None);
    }
}
