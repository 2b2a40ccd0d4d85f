//! Session Provider
//!
//! Hands out account-scoped [`NetworkApi`] clients. How credentials are
//! obtained (SSO profile, role assumption, workload identity) is the job of a
//! [`CredentialSource`]; this module only caches what it issues.
//!
//! The cache is an explicit object created per run and passed into the
//! engine. Each entry carries its own expiry, set shorter than the real
//! credential expiry, and acquisition is serialized per account so a burst
//! of callers triggers a single refresh.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::aws::NetworkApi;
use crate::config::SessionConfig;
use crate::error::ApiError;

/// Freshly issued credentials wrapped in a client
#[derive(Clone)]
pub struct IssuedCredentials {
    pub client: Arc<dyn NetworkApi>,
    /// When the underlying credential stops working
    pub expires_at: Instant,
}

/// Authenticates against one account. External collaborator.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn authenticate(&self, account_id: &str) -> Result<IssuedCredentials, ApiError>;
}

/// Authenticated, time-bounded client for one account
#[derive(Clone)]
pub struct ClientHandle {
    account_id: String,
    client: Arc<dyn NetworkApi>,
    valid_until: Instant,
}

impl ClientHandle {
    pub fn new(account_id: &str, client: Arc<dyn NetworkApi>, valid_until: Instant) -> Self {
        Self {
            account_id: account_id.to_string(),
            client,
            valid_until,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn api(&self) -> &dyn NetworkApi {
        self.client.as_ref()
    }

    pub fn shared_api(&self) -> Arc<dyn NetworkApi> {
        Arc::clone(&self.client)
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.valid_until
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.valid_until
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("account_id", &self.account_id)
            .field("valid_for", &self.time_until_expiry())
            .finish()
    }
}

/// `get_session(account_id) -> ClientHandle`
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn get_session(&self, account_id: &str) -> Result<ClientHandle, ApiError>;

    /// Drop cached handles at a run boundary
    fn clear(&self) {}
}

type Slot = Arc<tokio::sync::Mutex<Option<ClientHandle>>>;

/// Per-account expiring session cache
pub struct SessionCache {
    source: Arc<dyn CredentialSource>,
    ttl: Duration,
    expiry_margin: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionCache {
    pub fn new(source: Arc<dyn CredentialSource>, config: &SessionConfig) -> Self {
        Self {
            source,
            ttl: Duration::from_secs(config.ttl_secs),
            expiry_margin: Duration::from_secs(config.expiry_margin_secs),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, account_id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(account_id.to_string()).or_default())
    }
}

#[async_trait]
impl SessionProvider for SessionCache {
    async fn get_session(&self, account_id: &str) -> Result<ClientHandle, ApiError> {
        let slot = self.slot(account_id);
        let mut entry = slot.lock().await;

        if let Some(handle) = entry.as_ref() {
            if !handle.is_expired() {
                return Ok(handle.clone());
            }
            debug!(account_id = %account_id, "Cached session expired, refreshing");
        }

        let issued = self.source.authenticate(account_id).await?;

        let now = Instant::now();
        let credential_deadline = issued
            .expires_at
            .checked_sub(self.expiry_margin)
            .unwrap_or(now);
        let valid_until = (now + self.ttl).min(credential_deadline);

        let handle = ClientHandle::new(account_id, issued.client, valid_until);
        info!(
            account_id = %account_id,
            valid_for_secs = handle.time_until_expiry().as_secs(),
            "Session established"
        );

        *entry = Some(handle.clone());
        Ok(handle)
    }

    fn clear(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        debug!(accounts = slots.len(), "Session cache cleared");
        slots.clear();
    }
}
