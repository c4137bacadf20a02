//! Membership view of the swarm.
//!
//! On the controller this is the authoritative list of members plus the
//! registration token issued to each node.  On a node it is a cache of the
//! controller's list, overwritten wholesale whenever the controller pushes
//! a new one.  Every read returns a copy so callers never hold the lock
//! while iterating or serialising.

use std::collections::HashMap;

use log::{debug, error, info};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::SwarmMember;

#[derive(Debug, Default)]
struct MembershipView {
    members: Vec<SwarmMember>,
    /// identifier -> registration token. Controller only.
    tokens: HashMap<String, Uuid>,
    /// Set when the view changed since the last broadcast.
    dirty: bool,
}

#[derive(Debug)]
pub struct MembershipStore {
    view: RwLock<MembershipView>,
}

impl MembershipStore {
    /// A view containing only `self_member`.
    pub fn new(self_member: SwarmMember) -> Self {
        Self {
            view: RwLock::new(MembershipView {
                members: vec![self_member],
                ..MembershipView::default()
            }),
        }
    }

    /// Adds a node under `token`.
    ///
    /// Returns `false` and leaves the view untouched when `token` is already
    /// bound to a different identifier. A stale entry for the same identifier
    /// is replaced, which is what a restarted node looks like.
    pub async fn register_node(&self, member: SwarmMember, token: Uuid) -> bool {
        let mut view = self.view.write().await;

        let collision = view
            .tokens
            .iter()
            .any(|(identifier, existing)| *existing == token && *identifier != member.identifier);
        if collision {
            error!(
                "Registration ID collision: token presented by {} belongs to another node",
                member.identifier
            );
            return false;
        }

        if let Some(previous) = view.tokens.remove(&member.identifier) {
            if previous != token {
                info!("Node {} re-registered, replacing stale entry", member.identifier);
            }
            view.members
                .retain(|existing| existing.controller || existing.identifier != member.identifier);
        }

        debug!("Registered node {} at {}", member.identifier, member.address);
        view.tokens.insert(member.identifier.clone(), token);
        view.members.push(member);
        view.dirty = true;
        true
    }

    /// Removes the node registered under `token`.
    pub async fn unregister_node(&self, token: Uuid) -> Option<SwarmMember> {
        let mut view = self.view.write().await;
        let identifier = view
            .tokens
            .iter()
            .find(|(_, existing)| **existing == token)
            .map(|(identifier, _)| identifier.clone())?;

        view.tokens.remove(&identifier);
        let position = view
            .members
            .iter()
            .position(|m| !m.controller && m.identifier == identifier)?;
        view.dirty = true;
        Some(view.members.remove(position))
    }

    /// Removes the given nodes and invalidates their tokens.
    pub async fn remove_nodes(&self, identifiers: &[String]) -> Vec<SwarmMember> {
        if identifiers.is_empty() {
            return Vec::new();
        }

        let mut view = self.view.write().await;
        let mut removed = Vec::new();
        for identifier in identifiers {
            view.tokens.remove(identifier);
            if let Some(position) = view
                .members
                .iter()
                .position(|m| !m.controller && m.identifier == *identifier)
            {
                removed.push(view.members.remove(position));
            }
        }
        if !removed.is_empty() {
            view.dirty = true;
        }
        removed
    }

    /// Overwrites the cached view with the controller's list.
    pub async fn replace(&self, members: Vec<SwarmMember>) {
        let mut view = self.view.write().await;
        view.members = members;
        view.dirty = false;
    }

    /// Every member, the controller included.
    pub async fn snapshot(&self) -> Vec<SwarmMember> {
        self.view.read().await.members.clone()
    }

    /// Every non-controller member.
    pub async fn nodes(&self) -> Vec<SwarmMember> {
        self.view
            .read()
            .await
            .members
            .iter()
            .filter(|m| !m.controller)
            .cloned()
            .collect()
    }

    pub async fn member(&self, identifier: &str) -> Option<SwarmMember> {
        self.view
            .read()
            .await
            .members
            .iter()
            .find(|m| m.identifier == identifier)
            .cloned()
    }

    pub async fn token_for(&self, identifier: &str) -> Option<Uuid> {
        self.view.read().await.tokens.get(identifier).copied()
    }

    pub async fn identifier_for(&self, token: Uuid) -> Option<String> {
        self.view
            .read()
            .await
            .tokens
            .iter()
            .find(|(_, existing)| **existing == token)
            .map(|(identifier, _)| identifier.clone())
    }

    /// Clears the dirty flag, returning whether it was set.
    pub async fn take_dirty(&self) -> bool {
        std::mem::take(&mut self.view.write().await.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(identifier: &str, controller: bool) -> SwarmMember {
        SwarmMember {
            identifier: identifier.into(),
            address: format!("http://{}:5000", identifier),
            public_address: None,
            controller,
        }
    }

    fn controller_store() -> MembershipStore {
        MembershipStore::new(member("controller", true))
    }

    #[tokio::test]
    async fn registering_twice_keeps_one_entry() {
        let store = controller_store();
        let token = Uuid::new_v4();

        assert!(store.register_node(member("a", false), token).await);
        assert!(store.register_node(member("a", false), token).await);

        let nodes = store.nodes().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(store.token_for("a").await, Some(token));
    }

    #[tokio::test]
    async fn restarted_node_replaces_stale_token() {
        let store = controller_store();
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();

        store.register_node(member("a", false), old).await;
        store.register_node(member("a", false), new).await;

        assert_eq!(store.nodes().await.len(), 1);
        assert_eq!(store.identifier_for(old).await, None);
        assert_eq!(store.identifier_for(new).await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn token_bound_elsewhere_is_rejected() {
        let store = controller_store();
        let token = Uuid::new_v4();
        store.register_node(member("a", false), token).await;
        store.take_dirty().await;

        assert!(!store.register_node(member("b", false), token).await);

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|m| m.identifier != "b"));
        assert!(!store.take_dirty().await);
    }

    #[tokio::test]
    async fn unregister_invalidates_token() {
        let store = controller_store();
        let token = Uuid::new_v4();
        store.register_node(member("a", false), token).await;

        let removed = store.unregister_node(token).await.unwrap();
        assert_eq!(removed.identifier, "a");
        assert!(store.nodes().await.is_empty());
        assert_eq!(store.token_for("a").await, None);
        assert!(store.unregister_node(token).await.is_none());
    }

    #[tokio::test]
    async fn remove_nodes_never_drops_controller() {
        let store = controller_store();
        store.register_node(member("a", false), Uuid::new_v4()).await;
        store.register_node(member("b", false), Uuid::new_v4()).await;

        let removed = store
            .remove_nodes(&["a".to_string(), "controller".to_string()])
            .await;

        assert_eq!(removed.len(), 1);
        let identifiers: Vec<_> = store
            .snapshot()
            .await
            .into_iter()
            .map(|m| m.identifier)
            .collect();
        assert_eq!(identifiers, vec!["controller", "b"]);
    }

    #[tokio::test]
    async fn dirty_flag_tracks_changes() {
        let store = controller_store();
        assert!(!store.take_dirty().await);

        store.register_node(member("a", false), Uuid::new_v4()).await;
        assert!(store.take_dirty().await);
        assert!(!store.take_dirty().await);
    }

    #[tokio::test]
    async fn replace_overwrites_cached_view() {
        let store = MembershipStore::new(member("a", false));
        store
            .replace(vec![member("controller", true), member("a", false), member("b", false)])
            .await;

        assert_eq!(store.snapshot().await.len(), 3);
        assert_eq!(store.nodes().await.len(), 2);
        assert!(store.member("controller").await.unwrap().controller);
    }
}
