//! Registration, unregistration and membership propagation.

use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use uuid::Uuid;

use super::{Role, SwarmService};
use crate::error::{Result, SwarmError};
use crate::transport::Target;
use crate::types::{
    is_protocol_compatible, RegistrationRequest, RegistrationResponse, Route,
    ServersUpdateRequest, SwarmMember, SWARM_PROTOCOL_VERSION,
};

/// Outcome of a node's attempt to register with its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RegistrationResult {
    Success,
    /// The controller rejected the shared secret.
    Unauthorized,
    /// The controller speaks a different major protocol version.
    VersionMismatch,
    /// The controller could not be reached or refused for now.
    CommunicationFailure,
    /// The controller answered with something unreadable.
    PayloadFailure,
}

impl RegistrationResult {
    /// Whether retrying against the same controller is pointless.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Unauthorized | Self::VersionMismatch)
    }
}

impl SwarmService {
    /// Controller: accepts a node presenting `token`.
    pub async fn accept_registration(
        &self,
        token: Uuid,
        request: RegistrationRequest,
    ) -> Result<RegistrationResponse> {
        let Role::Controller(controller) = &self.role else {
            return Err(SwarmError::conflict("registrations go to the controller"));
        };

        if !is_protocol_compatible(&request.server_version) {
            warn!(
                "Node {} speaks swarm protocol {}, rejecting",
                request.identifier, request.server_version
            );
            return Err(SwarmError::VersionMismatch {
                local: SWARM_PROTOCOL_VERSION.into(),
                remote: request.server_version,
            });
        }
        if request.identifier == self.identity.identifier {
            error!(
                "Node at {} claims the controller's identifier {}",
                request.address, request.identifier
            );
            return Err(SwarmError::conflict("identifier belongs to the controller"));
        }

        let member = SwarmMember {
            identifier: request.identifier,
            address: request.address,
            public_address: request.public_address,
            controller: false,
        };
        let identifier = member.identifier.clone();

        {
            let update = self.update.lock().await;
            if let Some(operation) = update.as_ref() {
                return Err(SwarmError::conflict(format!(
                    "update to {} in progress",
                    operation.target_version
                )));
            }
            if !self.membership.register_node(member, token).await {
                return Err(SwarmError::conflict("registration ID collision"));
            }
        }

        info!("Node {} registered", identifier);
        self.trigger_health_check();
        Ok(RegistrationResponse {
            token_signing_key_base64: STANDARD.encode(&controller.signing_key),
        })
    }

    /// Controller: removes the node registered under `token`.
    ///
    /// An uncommitted update is aborted first; the departing node can no
    /// longer take part in it.
    pub async fn unregister_node(&self, token: Uuid) -> Result<()> {
        let identifier = self
            .membership
            .identifier_for(token)
            .await
            .ok_or(SwarmError::Unauthorized)?;

        if self.update_in_progress().await {
            warn!("Node {} unregistered during an update, aborting it", identifier);
            self.abort_update().await;
        }

        if self.membership.unregister_node(token).await.is_some() {
            info!("Node {} unregistered", identifier);
            self.trigger_health_check();
        }
        Ok(())
    }

    /// Handles `DELETE Register` for either role.
    ///
    /// On a node this means the controller is going away: the registration
    /// is dropped and the health checker re-registers once it is back.
    pub async fn unregistration_received(&self, token: Uuid) -> Result<()> {
        match &self.role {
            Role::Controller(_) => self.unregister_node(token).await,
            Role::Node(node) => {
                info!("Controller unregistered this node");
                *node.registration.write().await = None;
                *node.last_controller_contact.write().await = None;
                self.trigger_health_check();
                Ok(())
            }
        }
    }

    /// Node: registers with the controller under a fresh token.
    pub async fn register_with_controller(&self) -> RegistrationResult {
        let Some(node) = self.node() else {
            return RegistrationResult::Success;
        };

        let token = Uuid::new_v4();
        let request = RegistrationRequest {
            server_version: SWARM_PROTOCOL_VERSION.into(),
            identifier: self.identity.identifier.clone(),
            address: self.identity.address.clone(),
            public_address: self.identity.public_address.clone(),
        };

        let response = match self
            .transport
            .send_json(
                Target::Controller,
                Method::POST,
                Route::Register,
                &request,
                Some(token),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Unable to reach the controller: {}", e);
                return RegistrationResult::CommunicationFailure;
            }
        };

        let result = match response.status() {
            StatusCode::UNAUTHORIZED => RegistrationResult::Unauthorized,
            StatusCode::UPGRADE_REQUIRED => RegistrationResult::VersionMismatch,
            status if status.is_success() => match response.json::<RegistrationResponse>().await {
                Ok(body) => match STANDARD.decode(&body.token_signing_key_base64) {
                    Ok(signing_key) => {
                        *node.signing_key.write().await = Some(signing_key);
                        *node.registration.write().await = Some(token);
                        *node.last_controller_contact.write().await = Some(Instant::now());
                        RegistrationResult::Success
                    }
                    Err(e) => {
                        warn!("Controller sent an invalid signing key: {}", e);
                        RegistrationResult::PayloadFailure
                    }
                },
                Err(e) => {
                    warn!("Unreadable registration response: {}", e);
                    RegistrationResult::PayloadFailure
                }
            },
            status => {
                warn!("Controller refused registration: {}", status);
                RegistrationResult::CommunicationFailure
            }
        };

        match result {
            RegistrationResult::Success => info!("Registered with the controller"),
            result if result.is_terminal() => {
                error!(
                    "Registration with the controller failed permanently: {:?}",
                    result
                );
                *node.halted.write().await = Some(result);
            }
            _ => {}
        }
        result
    }

    /// Node: retries registration until it succeeds, fails for good, or the
    /// process shuts down.
    pub(crate) async fn reregister_until_done(&self) -> RegistrationResult {
        loop {
            let result = self.register_with_controller().await;
            if result == RegistrationResult::Success || result.is_terminal() {
                return result;
            }

            debug!(
                "Retrying registration in {:?}",
                self.health.retry_backoff
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return result,
                _ = tokio::time::sleep(self.health.retry_backoff) => {}
            }
        }
    }

    /// Node: whether a terminal registration failure stopped this node.
    pub async fn registration_halted(&self) -> Option<RegistrationResult> {
        match self.node() {
            Some(node) => *node.halted.read().await,
            None => None,
        }
    }

    /// Node: whether the node holds a live registration.
    pub async fn is_registered(&self) -> bool {
        match self.node() {
            Some(node) => node.registration.read().await.is_some(),
            None => true,
        }
    }

    /// Controller: the token `identifier` registered under.
    pub async fn registration_token(&self, identifier: &str) -> Option<Uuid> {
        self.membership.token_for(identifier).await
    }

    /// Node: replaces the cached view with the controller's push.
    pub async fn replace_local_view(&self, members: Vec<SwarmMember>) -> Result<()> {
        if self.is_controller() {
            return Err(SwarmError::conflict("the controller owns the membership view"));
        }
        let controllers = members.iter().filter(|m| m.controller).count();
        if controllers != 1 {
            return Err(SwarmError::Payload(format!(
                "membership list names {} controllers",
                controllers
            )));
        }

        debug!("Controller pushed {} members", members.len());
        self.membership.replace(members).await;
        Ok(())
    }

    /// Controller: pushes the current view to every node.
    pub(crate) async fn broadcast_membership(&self) {
        let body = ServersUpdateRequest {
            swarm_servers: self.membership.snapshot().await,
        };
        let nodes = self.membership.nodes().await;
        info!("Sending membership list of {} to {} nodes", body.swarm_servers.len(), nodes.len());

        let pushes = nodes.iter().map(|node| {
            let body = &body;
            async move {
                if let Err(e) = self
                    .transport
                    .call_json(Target::Member(node), Method::POST, Route::Root, body)
                    .await
                {
                    warn!("Membership push to {} failed: {}", node.identifier, e);
                }
            }
        });
        join_all(pushes).await;
    }

    /// Controller: tells every node it is going away.
    pub(crate) async fn broadcast_unregistration(&self) {
        let nodes = self.membership.nodes().await;
        if nodes.is_empty() {
            return;
        }

        info!("Unregistering {} nodes", nodes.len());
        let notices = nodes.iter().map(|node| async move {
            if let Err(e) = self
                .transport
                .call(Target::Member(node), Method::DELETE, Route::Register)
                .await
            {
                warn!("Unregistration of {} failed: {}", node.identifier, e);
            }
        });
        join_all(notices).await;
    }

    /// Node: tells the controller it is going away.
    pub(crate) async fn unregister_from_controller(&self) {
        if !self.is_registered().await {
            return;
        }

        match self
            .transport
            .call(Target::Controller, Method::DELETE, Route::Register)
            .await
        {
            Ok(_) => info!("Unregistered from the controller"),
            Err(e) => warn!("Unregistration from the controller failed: {}", e),
        }
        if let Some(node) = self.node() {
            *node.registration.write().await = None;
        }
    }
}
