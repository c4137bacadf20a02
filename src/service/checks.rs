//! Health checks run by the periodic checker in [`crate::health`].

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use log::{debug, info, warn};
use reqwest::Method;

use super::{Role, SwarmService};
use crate::transport::Target;
use crate::types::Route;

impl SwarmService {
    /// How long the checker sleeps before the next regular check.
    ///
    /// A node that heard from its controller recently waits out the rest of
    /// its interval counted from that contact.
    pub async fn next_health_delay(&self) -> Duration {
        match &self.role {
            Role::Controller(_) => self.health.controller_interval,
            Role::Node(node) => {
                let interval = self.health.node_interval;
                match *node.last_controller_contact.read().await {
                    Some(contact) => interval.saturating_sub(contact.elapsed()).max(Duration::from_millis(10)),
                    None => interval,
                }
            }
        }
    }

    /// Runs one check for this process's role.
    pub async fn check_health(&self) {
        match &self.role {
            Role::Controller(_) => {
                self.health_check_sweep().await;
            }
            Role::Node(_) => self.check_controller().await,
        }
    }

    /// Controller: pings every node, prunes the unreachable ones and pushes
    /// the view if it changed. Returns the pruned identifiers.
    pub async fn health_check_sweep(&self) -> Vec<String> {
        let nodes = self.membership.nodes().await;
        debug!("Checking {} nodes", nodes.len());

        let pings = nodes.iter().map(|node| async move {
            match self
                .transport
                .call(Target::Member(node), Method::GET, Route::Root)
                .await
            {
                Ok(_) => None,
                Err(e) => {
                    warn!("Node {} failed its health check: {}", node.identifier, e);
                    Some(node.identifier.clone())
                }
            }
        });
        let failed: Vec<String> = join_all(pings).await.into_iter().flatten().collect();

        if !failed.is_empty() {
            if self.update_in_progress().await {
                warn!("Aborting the update in flight, {} nodes dropped out", failed.len());
                self.abort_update().await;
            }
            let removed = self.membership.remove_nodes(&failed).await;
            info!("Pruned {} unreachable nodes", removed.len());
        }

        if self.membership.take_dirty().await {
            self.broadcast_membership().await;
        }
        failed
    }

    /// Node: makes sure the controller still knows this node, registering
    /// again when it does not.
    async fn check_controller(&self) {
        let Some(node) = self.node() else {
            return;
        };

        if let Some(result) = *node.halted.read().await {
            debug!("Registration halted ({:?}), skipping health check", result);
            return;
        }
        if !self.is_registered().await {
            self.reregister_until_done().await;
            return;
        }

        let recent = node
            .last_controller_contact
            .read()
            .await
            .is_some_and(|contact| contact.elapsed() < self.health.node_interval);
        if recent {
            return;
        }

        match self
            .transport
            .call(Target::Controller, Method::GET, Route::Root)
            .await
        {
            Ok(_) => *node.last_controller_contact.write().await = Some(Instant::now()),
            Err(e) => {
                warn!("Controller health check failed, registering again: {}", e);
                *node.registration.write().await = None;
                *node.last_controller_contact.write().await = None;
                self.reregister_until_done().await;
            }
        }
    }
}
