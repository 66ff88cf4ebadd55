//! Provider credentials
//!
//! Per-organization API keys, encrypted at rest with AES-256-GCM under a key
//! derived from the master secret. Rotation writes the new version and
//! retires the old one in a single store-level swap, serialized per
//! organization. Retired versions stay decryptable for rollback up to the
//! configured retention, older ones are scrubbed.

mod crypto;
mod store;

pub use crypto::{CredentialCipher, SealedSecret};
pub use store::{CredentialRecord, CredentialStore, InMemoryCredentialStore, PostgresCredentialStore, StoreError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::connectors::{ConnectorError, CredentialIssue, ModelHostingConnector};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credentials for {organization} unavailable: {issue}")]
    Unavailable {
        organization: String,
        issue: CredentialIssue,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Credential encryption failed: {0}")]
    Crypto(String),
    #[error("Key issuer failed: {0}")]
    Issuer(String),
    #[error("No retained previous version for {0}")]
    NoRollbackTarget(String),
    #[error("Master secret is not configured")]
    MissingMasterSecret,
}

impl CredentialError {
    fn unavailable(organization: &str, issue: CredentialIssue) -> Self {
        Self::Unavailable {
            organization: organization.to_string(),
            issue,
        }
    }
}

impl From<CredentialError> for ConnectorError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Unavailable { organization, issue } => {
                ConnectorError::Credentials { organization, issue }
            }
            other => ConnectorError::Internal(other.to_string()),
        }
    }
}

/// Plaintext API key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

/// Source of fresh provider keys for rotation
#[async_trait]
pub trait KeyIssuer: Send + Sync {
    async fn issue(&self, organization: &str) -> Result<ApiKey, CredentialError>;
}

/// Generates `{prefix}` followed by 40 random alphanumerics
pub struct RandomKeyIssuer {
    prefix: String,
}

impl RandomKeyIssuer {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

impl Default for RandomKeyIssuer {
    fn default() -> Self {
        Self::new("r8_")
    }
}

#[async_trait]
impl KeyIssuer for RandomKeyIssuer {
    async fn issue(&self, _organization: &str) -> Result<ApiKey, CredentialError> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(40)
            .map(char::from)
            .collect();
        Ok(ApiKey::new(format!("{}{}", self.prefix, suffix)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// From `MODELGATE_MASTER_SECRET`, never read from the config file
    #[serde(skip)]
    pub master_secret: Option<String>,
    #[serde(default = "CredentialsConfig::default_kdf_salt")]
    pub kdf_salt: String,
    #[serde(default = "CredentialsConfig::default_kdf_iterations")]
    pub kdf_iterations: u32,
    /// Run the background rotation task
    #[serde(default)]
    pub auto_rotate: bool,
    #[serde(default = "CredentialsConfig::default_rotation_check_interval")]
    pub rotation_check_interval_secs: u64,
    /// Keys older than this are rotated by the background task
    #[serde(default = "CredentialsConfig::default_max_age")]
    pub max_age_secs: u64,
    /// Lifetime given to rotated keys, unlimited when absent
    #[serde(default)]
    pub key_lifetime_secs: Option<u64>,
    /// Retired versions kept decryptable for rollback
    #[serde(default = "CredentialsConfig::default_retain_previous")]
    pub retain_previous_versions: usize,
    /// Probe the provider in `validate_credentials`
    #[serde(default = "CredentialsConfig::default_live_validation")]
    pub live_validation: bool,
}

impl CredentialsConfig {
    fn default_kdf_salt() -> String {
        "modelgate-credentials".to_string()
    }

    const fn default_kdf_iterations() -> u32 {
        100_000
    }

    const fn default_rotation_check_interval() -> u64 {
        3_600
    }

    const fn default_max_age() -> u64 {
        90 * 24 * 3_600
    }

    const fn default_retain_previous() -> usize {
        1
    }

    const fn default_live_validation() -> bool {
        true
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            master_secret: None,
            kdf_salt: Self::default_kdf_salt(),
            kdf_iterations: Self::default_kdf_iterations(),
            auto_rotate: false,
            rotation_check_interval_secs: Self::default_rotation_check_interval(),
            max_age_secs: Self::default_max_age(),
            key_lifetime_secs: None,
            retain_previous_versions: Self::default_retain_previous(),
            live_validation: Self::default_live_validation(),
        }
    }
}

/// Outcome of `validate_credentials`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CredentialValidation {
    Valid { version: i32 },
    Invalid { issue: CredentialIssue },
}

impl CredentialValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RotationOutcome {
    pub organization: String,
    pub previous_version: Option<i32>,
    pub version: i32,
    pub rotated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RotationFailure {
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub consecutive_failures: u32,
}

#[derive(Clone)]
struct CachedKey {
    id: uuid::Uuid,
    version: i32,
    key: ApiKey,
    expires_at: Option<DateTime<Utc>>,
}

/// Decrypted key of one organization. `epoch` moves on every rotation,
/// deactivation or rollback; a read may only fill the slot if the epoch it
/// started under is still current.
#[derive(Default)]
struct KeySlot {
    epoch: u64,
    key: Option<CachedKey>,
}

pub struct CredentialsService {
    config: CredentialsConfig,
    store: Arc<dyn CredentialStore>,
    cipher: CredentialCipher,
    issuer: Arc<dyn KeyIssuer>,
    verifier: Option<Arc<dyn ModelHostingConnector>>,
    decrypted: StdMutex<HashMap<String, KeySlot>>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    failures: StdMutex<HashMap<String, RotationFailure>>,
    shutdown: watch::Sender<bool>,
    rotation_task: Mutex<Option<JoinHandle<()>>>,
}

impl CredentialsService {
    pub fn new(
        config: CredentialsConfig,
        store: Arc<dyn CredentialStore>,
        verifier: Option<Arc<dyn ModelHostingConnector>>,
    ) -> Result<Self, CredentialError> {
        let master = config
            .master_secret
            .as_deref()
            .ok_or(CredentialError::MissingMasterSecret)?;
        let cipher = CredentialCipher::from_master_secret(master, &config.kdf_salt, config.kdf_iterations)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            cipher,
            issuer: Arc::new(RandomKeyIssuer::default()),
            verifier,
            decrypted: StdMutex::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
            failures: StdMutex::new(HashMap::new()),
            shutdown,
            rotation_task: Mutex::new(None),
        })
    }

    pub fn with_issuer(mut self, issuer: Arc<dyn KeyIssuer>) -> Self {
        self.issuer = issuer;
        self
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    fn org_lock(&self, organization: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(organization.to_string())
            .or_default()
            .clone()
    }

    fn cached(&self, organization: &str) -> (u64, Option<CachedKey>) {
        self.decrypted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(organization)
            .map(|slot| (slot.epoch, slot.key.clone()))
            .unwrap_or((0, None))
    }

    /// Fill the slot unless the key changed since `epoch` was read
    fn remember(&self, organization: &str, epoch: u64, entry: Option<CachedKey>) -> bool {
        let mut decrypted = self.decrypted.lock().unwrap_or_else(|e| e.into_inner());
        let slot = decrypted.entry(organization.to_string()).or_default();
        if slot.epoch != epoch {
            return false;
        }
        slot.key = entry;
        true
    }

    /// Caller holds the organization lock and has already written the store
    fn replace_cached(&self, organization: &str, entry: Option<CachedKey>) {
        let mut decrypted = self.decrypted.lock().unwrap_or_else(|e| e.into_inner());
        let slot = decrypted.entry(organization.to_string()).or_default();
        slot.epoch += 1;
        slot.key = entry;
    }

    /// Record the use. `false` once the record was retired, possibly by
    /// another process sharing the store.
    async fn touch(&self, organization: &str, id: uuid::Uuid) -> bool {
        match self.store.touch(id, Utc::now()).await {
            Ok(active) => active,
            Err(err) => {
                tracing::debug!(organization, error = %err, "Failed to record credential use");
                true
            }
        }
    }

    fn key_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.config
            .key_lifetime_secs
            .map(|secs| now + chrono::Duration::seconds(secs as i64))
    }

    /// Resolve the active key and its version
    async fn resolve(&self, organization: &str) -> Result<(ApiKey, i32), CredentialError> {
        loop {
            let now = Utc::now();
            let (epoch, cached) = self.cached(organization);
            if let Some(entry) = cached {
                if entry.expires_at.map(|at| at > now).unwrap_or(true) && self.touch(organization, entry.id).await {
                    return Ok((entry.key, entry.version));
                }
                self.remember(organization, epoch, None);
            }

            let Some(record) = self.store.active(organization).await? else {
                let issue = match self.store.latest(organization).await? {
                    Some(_) => CredentialIssue::Deactivated,
                    None => CredentialIssue::Missing,
                };
                return Err(CredentialError::unavailable(organization, issue));
            };

            if record.is_expired(now) {
                return Err(CredentialError::unavailable(organization, CredentialIssue::Expired));
            }

            let key = match (&record.encrypted_secret, &record.nonce) {
                (Some(ciphertext), Some(nonce)) => self.cipher.open(ciphertext, nonce),
                _ => Err(CredentialError::Crypto("record has no ciphertext".to_string())),
            };
            let key = match key {
                Ok(secret) => ApiKey::new(secret),
                Err(err) => {
                    tracing::warn!(organization, version = record.version, error = %err, "Credential record unreadable");
                    return Err(CredentialError::unavailable(organization, CredentialIssue::Missing));
                }
            };

            let entry = CachedKey {
                id: record.id,
                version: record.version,
                key: key.clone(),
                expires_at: record.expires_at,
            };
            if !self.remember(organization, epoch, Some(entry)) {
                tracing::debug!(organization, version = record.version, "Credentials changed during read, retrying");
                continue;
            }
            self.touch(organization, record.id).await;
            return Ok((key, record.version));
        }
    }

    /// Active API key for the organization
    pub async fn get_api_key(&self, organization: &str) -> Result<ApiKey, CredentialError> {
        self.resolve(organization).await.map(|(key, _)| key)
    }

    /// Store a supplied key: first configuration, or a rotation to it when a
    /// key is already active. Returns the new version.
    #[tracing::instrument(name = "Store provider API key", skip(self, secret))]
    pub async fn store_api_key(
        &self,
        organization: &str,
        secret: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<i32, CredentialError> {
        let lock = self.org_lock(organization);
        let _guard = lock.lock().await;
        let outcome = self
            .replace_locked(organization, ApiKey::new(secret), expires_at, false)
            .await?;
        Ok(outcome.version)
    }

    /// Seed an organization's key (from the environment) when it has none
    pub async fn bootstrap(&self, organization: &str, secret: &str) -> Result<bool, CredentialError> {
        if secret.is_empty() || self.store.latest(organization).await?.is_some() {
            return Ok(false);
        }
        self.store_api_key(organization, secret, None).await?;
        tracing::info!(organization, "Bootstrapped provider credentials");
        Ok(true)
    }

    /// Caller holds the organization lock
    async fn replace_locked(
        &self,
        organization: &str,
        key: ApiKey,
        expires_at: Option<DateTime<Utc>>,
        require_active: bool,
    ) -> Result<RotationOutcome, CredentialError> {
        let now = Utc::now();
        let active = self.store.active(organization).await?;
        if require_active && active.is_none() {
            let issue = match self.store.latest(organization).await? {
                Some(_) => CredentialIssue::Deactivated,
                None => CredentialIssue::Missing,
            };
            return Err(CredentialError::unavailable(organization, issue));
        }
        let next_version = self
            .store
            .latest(organization)
            .await?
            .map(|r| r.version + 1)
            .unwrap_or(1);

        let sealed = self.cipher.seal(key.expose())?;
        let mut record = CredentialRecord::new(organization, next_version, sealed.ciphertext, sealed.nonce);
        record.expires_at = expires_at;

        let previous_version = match &active {
            Some(previous) => {
                record.last_rotated_at = Some(now);
                self.store.rotate(previous.id, record.clone()).await?;
                Some(previous.version)
            }
            None => {
                self.store.insert(record.clone()).await?;
                None
            }
        };

        self.replace_cached(
            organization,
            Some(CachedKey {
                id: record.id,
                version: record.version,
                key,
                expires_at: record.expires_at,
            }),
        );
        self.apply_retention(organization).await;

        Ok(RotationOutcome {
            organization: organization.to_string(),
            previous_version,
            version: next_version,
            rotated_at: now,
        })
    }

    async fn apply_retention(&self, organization: &str) {
        let history = match self.store.history(organization).await {
            Ok(history) => history,
            Err(err) => {
                tracing::warn!(organization, error = %err, "Could not load credential history for retention");
                return;
            }
        };

        let expired = history
            .iter()
            .filter(|r| !r.active && r.is_retained())
            .skip(self.config.retain_previous_versions);
        for record in expired {
            match self.store.scrub(record.id).await {
                Ok(()) => tracing::debug!(organization, version = record.version, "Retired credential scrubbed"),
                Err(err) => tracing::warn!(organization, version = record.version, error = %err, "Failed to scrub retired credential"),
            }
        }
    }

    /// Replace the active key with one from the key issuer
    #[tracing::instrument(name = "Rotate provider credentials", skip(self))]
    pub async fn rotate_credentials(&self, organization: &str) -> Result<RotationOutcome, CredentialError> {
        let lock = self.org_lock(organization);
        let _guard = lock.lock().await;

        let key = self.issuer.issue(organization).await?;
        let expires_at = self.key_expiry(Utc::now());
        let outcome = self.replace_locked(organization, key, expires_at, true).await?;

        tracing::info!(
            organization,
            previous_version = ?outcome.previous_version,
            version = outcome.version,
            "Credentials rotated"
        );
        Ok(outcome)
    }

    /// Check the stored key and, when configured, probe the provider with it
    #[tracing::instrument(name = "Validate provider credentials", skip(self))]
    pub async fn validate_credentials(&self, organization: &str) -> Result<CredentialValidation, CredentialError> {
        let (key, version) = match self.resolve(organization).await {
            Ok(resolved) => resolved,
            Err(CredentialError::Unavailable { issue, .. }) => {
                return Ok(CredentialValidation::Invalid { issue });
            }
            Err(err) => return Err(err),
        };

        let verifier = match (&self.verifier, self.config.live_validation) {
            (Some(verifier), true) => verifier,
            _ => return Ok(CredentialValidation::Valid { version }),
        };

        match verifier.verify_api_key(key.expose()).await {
            Ok(()) => Ok(CredentialValidation::Valid { version }),
            Err(err) => {
                tracing::warn!(organization, version, error = %err, "Live credential check failed");
                Ok(CredentialValidation::Invalid {
                    issue: CredentialIssue::LiveCheckFailed(err.to_string()),
                })
            }
        }
    }

    /// Retire the active key without a replacement
    #[tracing::instrument(name = "Deactivate provider credentials", skip(self))]
    pub async fn deactivate_credentials(&self, organization: &str) -> Result<bool, CredentialError> {
        let lock = self.org_lock(organization);
        let _guard = lock.lock().await;

        match self.store.active(organization).await? {
            Some(record) => {
                self.store.deactivate(record.id).await?;
                self.replace_cached(organization, None);
                tracing::info!(organization, version = record.version, "Credentials deactivated");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reactivate the newest retained version older than the latest one
    #[tracing::instrument(name = "Roll back provider credentials", skip(self))]
    pub async fn rollback(&self, organization: &str) -> Result<i32, CredentialError> {
        let lock = self.org_lock(organization);
        let _guard = lock.lock().await;

        let history = self.store.history(organization).await?;
        let now = Utc::now();
        let latest_version = history.first().map(|r| r.version).unwrap_or(0);
        let current = history.iter().find(|r| r.active).map(|r| r.id);
        let target = history
            .iter()
            .filter(|r| r.version < latest_version && !r.active)
            .find(|r| r.is_retained() && !r.is_expired(now))
            .ok_or_else(|| CredentialError::NoRollbackTarget(organization.to_string()))?;

        self.store.reactivate(current, target.id).await?;
        self.replace_cached(organization, None);
        tracing::warn!(organization, version = target.version, "Credentials rolled back");
        Ok(target.version)
    }

    pub fn rotation_failures(&self) -> HashMap<String, RotationFailure> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record_failure(&self, organization: &str, err: &CredentialError) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let consecutive = failures
            .get(organization)
            .map(|f| f.consecutive_failures + 1)
            .unwrap_or(1);
        failures.insert(
            organization.to_string(),
            RotationFailure {
                error: err.to_string(),
                failed_at: Utc::now(),
                consecutive_failures: consecutive,
            },
        );
    }

    /// One pass of automatic rotation over every organization with an
    /// active key older than `max_age_secs`. One organization failing does
    /// not stop the others.
    pub async fn rotate_expiring(&self) -> Vec<RotationOutcome> {
        let organizations = match self.store.organizations().await {
            Ok(organizations) => organizations,
            Err(err) => {
                tracing::error!(error = %err, "Rotation pass could not list organizations");
                return Vec::new();
            }
        };
        let max_age = chrono::Duration::seconds(self.config.max_age_secs as i64);
        let now = Utc::now();
        let mut rotated = Vec::new();

        for organization in organizations {
            let due = match self.store.active(&organization).await {
                Ok(Some(record)) => record.age(now) >= max_age,
                Ok(None) => false,
                Err(err) => {
                    let err = CredentialError::from(err);
                    self.record_failure(&organization, &err);
                    continue;
                }
            };
            if !due {
                continue;
            }

            match self.rotate_credentials(&organization).await {
                Ok(outcome) => {
                    self.failures
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&organization);
                    rotated.push(outcome);
                }
                Err(err) => {
                    tracing::error!(organization = %organization, error = %err, "Automatic rotation failed");
                    self.record_failure(&organization, &err);
                }
            }
        }
        rotated
    }

    /// Spawn the periodic rotation task. Returns false if already running.
    pub async fn start_auto_rotation(self: &Arc<Self>) -> bool {
        let mut task = self.rotation_task.lock().await;
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return false;
        }

        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        let service = Arc::clone(self);
        let period = Duration::from_secs(self.config.rotation_check_interval_secs.max(1));

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let rotated = service.rotate_expiring().await;
                        if !rotated.is_empty() {
                            tracing::info!(count = rotated.len(), "Automatic rotation pass complete");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::info!("Credential rotation task stopped");
        }));
        tracing::info!(period_secs = period.as_secs(), "Credential rotation task started");
        true
    }

    pub async fn stop_auto_rotation(&self) {
        self.shutdown.send_replace(true);
        if let Some(handle) = self.rotation_task.lock().await.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "Credential rotation task ended abnormally");
            }
        }
    }

    pub async fn is_auto_rotating(&self) -> bool {
        self.rotation_task
            .lock()
            .await
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::mock::MockModelHostingConnector;

    fn config() -> CredentialsConfig {
        CredentialsConfig {
            master_secret: Some("test-master-secret".into()),
            kdf_iterations: 1_000,
            ..CredentialsConfig::default()
        }
    }

    fn service() -> (CredentialsService, Arc<InMemoryCredentialStore>) {
        let store = Arc::new(InMemoryCredentialStore::new());
        let service = CredentialsService::new(config(), store.clone(), None).unwrap();
        (service, store)
    }

    struct FailingIssuer;

    #[async_trait]
    impl KeyIssuer for FailingIssuer {
        async fn issue(&self, organization: &str) -> Result<ApiKey, CredentialError> {
            Err(CredentialError::Issuer(format!("provider refused to mint a key for {}", organization)))
        }
    }

    #[tokio::test]
    async fn missing_master_secret_is_an_error() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let result = CredentialsService::new(CredentialsConfig::default(), store, None);
        assert!(matches!(result, Err(CredentialError::MissingMasterSecret)));
    }

    #[tokio::test]
    async fn stored_key_is_encrypted_and_returned() {
        let (service, store) = service();
        assert_eq!(service.store_api_key("acme", "r8_first", None).await.unwrap(), 1);

        let record = store.active("acme").await.unwrap().unwrap();
        assert_ne!(record.encrypted_secret.as_deref(), Some("r8_first"));
        assert_eq!(service.get_api_key("acme").await.unwrap().expose(), "r8_first");
        assert!(store.active("acme").await.unwrap().unwrap().last_used_at.is_some());
    }

    #[tokio::test]
    async fn missing_and_deactivated_are_distinguished() {
        let (service, _) = service();
        assert!(matches!(
            service.get_api_key("acme").await,
            Err(CredentialError::Unavailable { issue: CredentialIssue::Missing, .. })
        ));

        service.store_api_key("acme", "r8_first", None).await.unwrap();
        assert!(service.deactivate_credentials("acme").await.unwrap());
        assert!(matches!(
            service.get_api_key("acme").await,
            Err(CredentialError::Unavailable { issue: CredentialIssue::Deactivated, .. })
        ));
    }

    #[tokio::test]
    async fn expired_key_is_rejected() {
        let (service, _) = service();
        let past = Utc::now() - chrono::Duration::hours(1);
        service.store_api_key("acme", "r8_old", Some(past)).await.unwrap();
        assert!(matches!(
            service.get_api_key("acme").await,
            Err(CredentialError::Unavailable { issue: CredentialIssue::Expired, .. })
        ));
    }

    #[tokio::test]
    async fn unreadable_record_reports_missing() {
        let (service, store) = service();
        let mut record = CredentialRecord::new("acme", 1, "bm90IGNpcGhlcnRleHQ=".into(), "AAAAAAAAAAAAAAAA".into());
        record.active = true;
        store.insert(record).await.unwrap();

        assert!(matches!(
            service.get_api_key("acme").await,
            Err(CredentialError::Unavailable { issue: CredentialIssue::Missing, .. })
        ));
    }

    #[tokio::test]
    async fn rotation_bumps_version_and_retires_previous() {
        let (service, store) = service();
        service.store_api_key("acme", "r8_first", None).await.unwrap();

        let outcome = service.rotate_credentials("acme").await.unwrap();
        assert_eq!(outcome.previous_version, Some(1));
        assert_eq!(outcome.version, 2);

        let key = service.get_api_key("acme").await.unwrap();
        assert_ne!(key.expose(), "r8_first");
        assert!(key.expose().starts_with("r8_"));
        assert_eq!(key.expose().len(), 43);

        let history = store.history("acme").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|r| r.active).count(), 1);
        assert!(history[0].last_rotated_at.is_some());
    }

    #[tokio::test]
    async fn rotation_without_active_key_fails() {
        let (service, _) = service();
        assert!(matches!(
            service.rotate_credentials("acme").await,
            Err(CredentialError::Unavailable { issue: CredentialIssue::Missing, .. })
        ));
    }

    #[tokio::test]
    async fn issuer_failure_leaves_current_key_in_place() {
        let (service, _) = service();
        let service = service.with_issuer(Arc::new(FailingIssuer));
        service.store_api_key("acme", "r8_first", None).await.unwrap();

        assert!(matches!(
            service.rotate_credentials("acme").await,
            Err(CredentialError::Issuer(_))
        ));
        assert_eq!(service.get_api_key("acme").await.unwrap().expose(), "r8_first");
    }

    #[tokio::test]
    async fn concurrent_rotations_are_serialized() {
        let (service, store) = service();
        let service = Arc::new(service);
        service.store_api_key("acme", "r8_first", None).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.rotate_credentials("acme").await })
            })
            .collect();
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap().unwrap().version);
        }
        versions.sort();
        assert_eq!(versions, (2..=9).collect::<Vec<_>>());

        let history = store.history("acme").await.unwrap();
        assert_eq!(history.iter().filter(|r| r.active).count(), 1);
        assert_eq!(store.active("acme").await.unwrap().unwrap().version, 9);
    }

    #[tokio::test]
    async fn retention_scrubs_older_versions_and_rollback_restores_previous() {
        let (service, store) = service();
        service.store_api_key("acme", "r8_v1", None).await.unwrap();
        service.store_api_key("acme", "r8_v2", None).await.unwrap();
        service.store_api_key("acme", "r8_v3", None).await.unwrap();

        let history = store.history("acme").await.unwrap();
        // v2 kept for rollback, v1 scrubbed
        assert!(history[1].is_retained());
        assert!(!history[2].is_retained());

        assert_eq!(service.rollback("acme").await.unwrap(), 2);
        assert_eq!(service.get_api_key("acme").await.unwrap().expose(), "r8_v2");

        // nothing older is retained
        assert!(matches!(
            service.rollback("acme").await,
            Err(CredentialError::NoRollbackTarget(_))
        ));
    }

    #[tokio::test]
    async fn bootstrap_only_seeds_empty_organizations() {
        let (service, _) = service();
        assert!(service.bootstrap("acme", "r8_env").await.unwrap());
        assert!(!service.bootstrap("acme", "r8_other").await.unwrap());
        assert_eq!(service.get_api_key("acme").await.unwrap().expose(), "r8_env");
    }

    #[tokio::test]
    async fn validation_reports_structured_results() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let connector = Arc::new(MockModelHostingConnector::default());
        let service = CredentialsService::new(config(), store, Some(connector.clone())).unwrap();

        assert_eq!(
            service.validate_credentials("acme").await.unwrap(),
            CredentialValidation::Invalid {
                issue: CredentialIssue::Missing
            }
        );

        service.store_api_key("acme", "r8_good", None).await.unwrap();
        assert_eq!(
            service.validate_credentials("acme").await.unwrap(),
            CredentialValidation::Valid { version: 1 }
        );

        connector.reject_api_key("r8_good");
        assert!(matches!(
            service.validate_credentials("acme").await.unwrap(),
            CredentialValidation::Invalid {
                issue: CredentialIssue::LiveCheckFailed(_)
            }
        ));
    }

    #[tokio::test]
    async fn rotation_pass_handles_each_organization_independently() {
        let (service, store) = service();
        let mut stale = CredentialRecord::new("acme", 1, String::new(), String::new());
        let sealed = service.cipher.seal("r8_stale").unwrap();
        stale.encrypted_secret = Some(sealed.ciphertext);
        stale.nonce = Some(sealed.nonce);
        stale.created_at = Utc::now() - chrono::Duration::days(365);
        store.insert(stale).await.unwrap();
        service.store_api_key("globex", "r8_fresh", None).await.unwrap();

        let rotated = service.rotate_expiring().await;
        assert_eq!(rotated.len(), 1);
        assert_eq!(rotated[0].organization, "acme");
        assert_eq!(store.active("globex").await.unwrap().unwrap().version, 1);
        assert!(service.rotation_failures().is_empty());

        let failing = {
            let (service, store) = self::service();
            let mut stale = CredentialRecord::new("acme", 1, "x".into(), "y".into());
            stale.created_at = Utc::now() - chrono::Duration::days(365);
            store.insert(stale).await.unwrap();
            service.with_issuer(Arc::new(FailingIssuer))
        };
        assert!(failing.rotate_expiring().await.is_empty());
        assert_eq!(failing.rotation_failures()["acme"].consecutive_failures, 1);
    }

    /// Parks the next `active()` read after it has fetched its record
    struct SlowReadStore {
        inner: Arc<InMemoryCredentialStore>,
        delay_next: std::sync::atomic::AtomicBool,
    }

    impl SlowReadStore {
        fn new(inner: Arc<InMemoryCredentialStore>) -> Self {
            Self {
                inner,
                delay_next: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn delay_next_read(&self) {
            self.delay_next.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CredentialStore for SlowReadStore {
        async fn active(&self, organization: &str) -> Result<Option<CredentialRecord>, StoreError> {
            let record = self.inner.active(organization).await?;
            if self.delay_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(record)
        }
        async fn latest(&self, organization: &str) -> Result<Option<CredentialRecord>, StoreError> {
            self.inner.latest(organization).await
        }
        async fn history(&self, organization: &str) -> Result<Vec<CredentialRecord>, StoreError> {
            self.inner.history(organization).await
        }
        async fn insert(&self, record: CredentialRecord) -> Result<(), StoreError> {
            self.inner.insert(record).await
        }
        async fn rotate(&self, previous: uuid::Uuid, next: CredentialRecord) -> Result<(), StoreError> {
            self.inner.rotate(previous, next).await
        }
        async fn reactivate(&self, current: Option<uuid::Uuid>, target: uuid::Uuid) -> Result<(), StoreError> {
            self.inner.reactivate(current, target).await
        }
        async fn deactivate(&self, id: uuid::Uuid) -> Result<(), StoreError> {
            self.inner.deactivate(id).await
        }
        async fn touch(&self, id: uuid::Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
            self.inner.touch(id, at).await
        }
        async fn scrub(&self, id: uuid::Uuid) -> Result<(), StoreError> {
            self.inner.scrub(id).await
        }
        async fn organizations(&self) -> Result<Vec<String>, StoreError> {
            self.inner.organizations().await
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
        fn backend(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn read_overlapping_a_rotation_never_caches_the_retired_key() {
        let inner = Arc::new(InMemoryCredentialStore::new());
        CredentialsService::new(config(), inner.clone(), None)
            .unwrap()
            .store_api_key("acme", "r8_old", None)
            .await
            .unwrap();

        let slow = Arc::new(SlowReadStore::new(inner.clone()));
        let service = Arc::new(CredentialsService::new(config(), slow.clone(), None).unwrap());
        slow.delay_next_read();
        let reader = {
            let service = service.clone();
            tokio::spawn(async move { service.get_api_key("acme").await })
        };
        // the reader now holds the v1 record and is parked
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.rotate_credentials("acme").await.unwrap().version, 2);

        let during = reader.await.unwrap().unwrap();
        let after = service.get_api_key("acme").await.unwrap();
        assert_ne!(after.expose(), "r8_old");
        assert_eq!(during, after);
        assert_eq!(service.get_api_key("acme").await.unwrap(), after);
    }

    #[tokio::test]
    async fn changes_made_by_another_instance_are_picked_up() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let server = CredentialsService::new(config(), store.clone(), None).unwrap();
        let console = CredentialsService::new(config(), store.clone(), None).unwrap();

        server.store_api_key("acme", "r8_first", None).await.unwrap();
        assert_eq!(server.get_api_key("acme").await.unwrap().expose(), "r8_first");

        console.store_api_key("acme", "r8_second", None).await.unwrap();
        assert_eq!(server.get_api_key("acme").await.unwrap().expose(), "r8_second");

        assert!(console.deactivate_credentials("acme").await.unwrap());
        assert!(matches!(
            server.get_api_key("acme").await,
            Err(CredentialError::Unavailable { issue: CredentialIssue::Deactivated, .. })
        ));
    }

    #[tokio::test]
    async fn auto_rotation_task_starts_and_stops() {
        let (service, _) = service();
        let service = Arc::new(service);
        assert!(service.start_auto_rotation().await);
        assert!(!service.start_auto_rotation().await);
        service.stop_auto_rotation().await;
        assert!(!service.is_auto_rotating().await);
    }
}
