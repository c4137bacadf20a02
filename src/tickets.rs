//! One-shot download tickets for update packages.
//!
//! The member that originated an update keeps the package in memory and
//! hands out one ticket per peer.  A peer redeems its ticket exactly once
//! through `GET Transfer`; the digest travels alongside so the download
//! can be verified before it is staged.

use std::collections::HashMap;

use bytes::Bytes;
use log::debug;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

/// An update package held open for transfer.
#[derive(Debug, Clone)]
pub struct StagedPackage {
    pub bytes: Bytes,
    /// Hex encoded SHA-256 of `bytes`.
    pub sha256: String,
}

impl StagedPackage {
    pub fn new(bytes: Bytes) -> Self {
        let sha256 = package_digest(&bytes);
        Self { bytes, sha256 }
    }
}

/// Hex encoded SHA-256 digest of a package.
pub fn package_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Default)]
pub struct TicketStore {
    tickets: Mutex<HashMap<String, StagedPackage>>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh ticket for `package`.
    pub async fn issue(&self, package: &StagedPackage) -> String {
        let ticket = Uuid::new_v4().simple().to_string();
        self.tickets
            .lock()
            .await
            .insert(ticket.clone(), package.clone());
        ticket
    }

    /// Redeems a ticket, consuming it.
    pub async fn redeem(&self, ticket: &str) -> Option<StagedPackage> {
        let package = self.tickets.lock().await.remove(ticket);
        debug!(
            "Ticket {} {}",
            ticket,
            if package.is_some() { "redeemed" } else { "unknown" }
        );
        package
    }

    /// Drops every outstanding ticket.
    pub async fn revoke_all(&self) {
        let mut tickets = self.tickets.lock().await;
        if !tickets.is_empty() {
            debug!("Revoking {} outstanding tickets", tickets.len());
            tickets.clear();
        }
    }

    pub async fn outstanding(&self) -> usize {
        self.tickets.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tickets_redeem_once() {
        let store = TicketStore::new();
        let package = StagedPackage::new(Bytes::from_static(b"payload"));

        let ticket = store.issue(&package).await;
        let redeemed = store.redeem(&ticket).await.unwrap();
        assert_eq!(redeemed.bytes, package.bytes);
        assert!(store.redeem(&ticket).await.is_none());
    }

    #[tokio::test]
    async fn revoke_all_clears_tickets() {
        let store = TicketStore::new();
        let package = StagedPackage::new(Bytes::from_static(b"payload"));
        let first = store.issue(&package).await;
        store.issue(&package).await;
        assert_eq!(store.outstanding().await, 2);

        store.revoke_all().await;
        assert_eq!(store.outstanding().await, 0);
        assert!(store.redeem(&first).await.is_none());
    }

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            package_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
