//! Outbound requests between swarm members.
//!
//! Every request carries the shared secret and a registration token.  The
//! token is an explicit override while registering, the token the
//! controller issued to the target when the caller is the controller, or
//! the caller's own controller-issued token when the caller is a node.
//! Nothing here retries; callers decide how to react to failures.

use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, SwarmError};
use crate::membership::MembershipStore;
use crate::tickets::package_digest;
use crate::types::{Route, SwarmMember, API_KEY_HEADER, PACKAGE_DIGEST_HEADER, REGISTRATION_HEADER};

/// Who a request is addressed to.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// The configured controller.
    Controller,
    Member(&'a SwarmMember),
}

/// The token a node holds after registering with its controller.
pub type SharedRegistration = Arc<RwLock<Option<Uuid>>>;

#[derive(Debug, Clone)]
pub struct SwarmTransport {
    client: Client,
    private_key: String,
    controller_address: Option<String>,
    membership: Arc<MembershipStore>,
    own_registration: SharedRegistration,
}

impl SwarmTransport {
    pub fn new(
        config: &Config,
        membership: Arc<MembershipStore>,
        own_registration: SharedRegistration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(SwarmError::Http)?;

        Ok(Self {
            client,
            private_key: config.private_key.clone(),
            controller_address: config.controller_address.clone(),
            membership,
            own_registration,
        })
    }

    fn is_controller(&self) -> bool {
        self.controller_address.is_none()
    }

    fn address_of<'a>(&'a self, target: &Target<'a>) -> Result<&'a str> {
        match target {
            Target::Member(member) => Ok(member.address.as_str()),
            Target::Controller => self
                .controller_address
                .as_deref()
                .ok_or_else(|| SwarmError::Config("no controller address configured".into())),
        }
    }

    async fn registration_for(&self, target: &Target<'_>) -> Option<Uuid> {
        if !self.is_controller() {
            return *self.own_registration.read().await;
        }
        match target {
            Target::Member(member) => self.membership.token_for(&member.identifier).await,
            Target::Controller => None,
        }
    }

    async fn builder(
        &self,
        target: Target<'_>,
        method: Method,
        route: Route,
        registration_override: Option<Uuid>,
    ) -> Result<RequestBuilder> {
        let url = route.url(self.address_of(&target)?);
        let registration = match registration_override {
            Some(token) => Some(token),
            None => self.registration_for(&target).await,
        };

        debug!("{} {}", method, url);
        let mut builder = self
            .client
            .request(method, url)
            .header(API_KEY_HEADER, &self.private_key);
        if let Some(token) = registration {
            builder = builder.header(REGISTRATION_HEADER, token.to_string());
        }
        Ok(builder)
    }

    /// Sends a request without a body. Only transport failures are errors.
    pub async fn send(
        &self,
        target: Target<'_>,
        method: Method,
        route: Route,
        registration_override: Option<Uuid>,
    ) -> Result<Response> {
        let builder = self
            .builder(target, method, route, registration_override)
            .await?;
        Ok(builder.send().await?)
    }

    /// Sends a request with a JSON body. Only transport failures are errors.
    pub async fn send_json<T>(
        &self,
        target: Target<'_>,
        method: Method,
        route: Route,
        body: &T,
        registration_override: Option<Uuid>,
    ) -> Result<Response>
    where
        T: Serialize + ?Sized,
    {
        let builder = self
            .builder(target, method, route, registration_override)
            .await?;
        Ok(builder.json(body).send().await?)
    }

    /// Like [`send`](Self::send), but a non-success status is an error.
    pub async fn call(&self, target: Target<'_>, method: Method, route: Route) -> Result<Response> {
        let response = self.send(target, method, route, None).await?;
        ensure_success(route, response)
    }

    /// Like [`send_json`](Self::send_json), but a non-success status is an error.
    pub async fn call_json<T>(
        &self,
        target: Target<'_>,
        method: Method,
        route: Route,
        body: &T,
    ) -> Result<Response>
    where
        T: Serialize + ?Sized,
    {
        let response = self.send_json(target, method, route, body, None).await?;
        ensure_success(route, response)
    }

    /// Like [`call`](Self::call), with `query` appended to the URL.
    pub async fn call_with_query<Q>(
        &self,
        target: Target<'_>,
        method: Method,
        route: Route,
        query: &Q,
    ) -> Result<Response>
    where
        Q: Serialize + ?Sized,
    {
        let builder = self.builder(target, method, route, None).await?;
        ensure_success(route, builder.query(query).send().await?)
    }

    /// Redeems `ticket` on `source` and verifies the package digest.
    pub async fn download(&self, source: Target<'_>, ticket: &str) -> Result<Bytes> {
        let builder = self
            .builder(source, Method::GET, Route::Transfer, None)
            .await?;
        let response = ensure_success(
            Route::Transfer,
            builder.query(&[("ticket", ticket)]).send().await?,
        )?;

        let expected = response
            .headers()
            .get(PACKAGE_DIGEST_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let bytes = response.bytes().await?;

        match expected {
            Some(expected) if expected.eq_ignore_ascii_case(&package_digest(&bytes)) => Ok(bytes),
            Some(expected) => Err(SwarmError::Ticket(format!(
                "package digest mismatch, expected {}",
                expected
            ))),
            None => Err(SwarmError::Ticket("package digest missing".into())),
        }
    }
}

fn ensure_success(route: Route, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status == reqwest::StatusCode::UNAUTHORIZED {
        Err(SwarmError::Unauthorized)
    } else {
        Err(SwarmError::Status {
            route: route.path(),
            status,
        })
    }
}
