//! Data structures exchanged between swarm members.
//!
//! These types are serialised using [`serde`](https://serde.rs/) as
//! camelCase JSON with absent optionals omitted, and travel over the
//! swarm HTTP routes.  They describe members of the swarm, the
//! registration handshake and the messages of the update protocol.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Version of the swarm protocol spoken by this build.  Only the major
/// component has to match between a node and its controller.
pub const SWARM_PROTOCOL_VERSION: &str = "1.0.0";

/// Header carrying the shared cluster secret.
pub const API_KEY_HEADER: &str = "X-API-KEY";

/// Header carrying the controller-issued registration token.
pub const REGISTRATION_HEADER: &str = "SwarmRegistration";

/// Header carrying the hex SHA-256 digest of a transferred package.
pub const PACKAGE_DIGEST_HEADER: &str = "X-Package-Sha256";

/// Routes served under the swarm prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Health ping (`GET`) and membership push (`POST`).
    Root,
    /// Registration (`POST`) and unregistration (`DELETE`).
    Register,
    /// Prepare (`PUT`), ready/commit (`POST`) and abort (`DELETE`).
    Update,
    /// Ticketed package download (`GET`).
    Transfer,
}

impl Route {
    /// Absolute path of the route on a member's base address.
    pub const fn path(self) -> &'static str {
        match self {
            Route::Root => "/Swarm",
            Route::Register => "/Swarm/Register",
            Route::Update => "/Swarm/Update",
            Route::Transfer => "/Swarm/Transfer",
        }
    }

    /// Full URL of the route on the member reachable at `address`.
    pub fn url(self, address: &str) -> String {
        format!("{}{}", address.trim_end_matches('/'), self.path())
    }
}

/// One participant of the swarm.
///
/// `identifier` is stable across restarts and unique within a view;
/// exactly one member of any view is the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmMember {
    pub identifier: String,
    /// Base URL the member's swarm routes are served on.
    pub address: String,
    /// Informational only, never contacted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    pub controller: bool,
}

/// Body of `POST Register`, sent by a node to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub server_version: String,
    pub identifier: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
}

/// Body returned by the controller on successful registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub token_signing_key_base64: String,
}

/// Body of `PUT Update`: asks a member to stage `update_version`.
///
/// The package is fetched from `source_node` with the ticket issued
/// for the receiving member's identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub update_version: String,
    pub source_node: String,
    #[serde(default)]
    pub download_tickets: HashMap<String, String>,
}

/// Body of `POST /`: the controller's current membership view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServersUpdateRequest {
    pub swarm_servers: Vec<SwarmMember>,
}

/// Query of `GET Transfer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferQuery {
    pub ticket: String,
}

/// Query of `DELETE Update`. Without a version the abort applies to
/// whatever update is in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AbortQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Major component of a dotted version string.
pub fn protocol_major(version: &str) -> Option<u64> {
    version.trim().split('.').next()?.parse().ok()
}

/// Whether a peer speaking `remote` can join a swarm running this build.
pub fn is_protocol_compatible(remote: &str) -> bool {
    match (protocol_major(remote), protocol_major(SWARM_PROTOCOL_VERSION)) {
        (Some(remote), Some(local)) => remote == local,
        _ => false,
    }
}
