use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

/// One version of an organization's provider credential
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CredentialRecord {
    pub id: Uuid,
    pub organization: String,
    /// base64 AES-GCM ciphertext, `None` once scrubbed by the retention policy
    #[serde(skip_serializing)]
    pub encrypted_secret: Option<String>,
    #[serde(skip_serializing)]
    pub nonce: Option<String>,
    pub version: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    pub fn new(organization: &str, version: i32, ciphertext: String, nonce: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization: organization.to_string(),
            encrypted_secret: Some(ciphertext),
            nonce: Some(nonce),
            version,
            active: true,
            created_at: Utc::now(),
            last_used_at: None,
            last_rotated_at: None,
            expires_at: None,
            deactivated_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn is_retained(&self) -> bool {
        self.encrypted_secret.is_some() && self.nonce.is_some()
    }

    /// Age used by automatic rotation
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_rotated_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Credential store unavailable: {0}")]
    Database(String),
    #[error("Credential store conflict: {0}")]
    Conflict(String),
    #[error("Credential record {0} not found")]
    NotFound(Uuid),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(db.to_string()),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// Persistence for credential records. Records are never deleted.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn active(&self, organization: &str) -> Result<Option<CredentialRecord>, StoreError>;
    /// Highest version regardless of state
    async fn latest(&self, organization: &str) -> Result<Option<CredentialRecord>, StoreError>;
    /// All versions, newest first
    async fn history(&self, organization: &str) -> Result<Vec<CredentialRecord>, StoreError>;
    async fn insert(&self, record: CredentialRecord) -> Result<(), StoreError>;
    /// Insert `next` and retire `previous` as one atomic step
    async fn rotate(&self, previous: Uuid, next: CredentialRecord) -> Result<(), StoreError>;
    /// Retire `current` (if any) and reactivate `target` as one atomic step
    async fn reactivate(&self, current: Option<Uuid>, target: Uuid) -> Result<(), StoreError>;
    async fn deactivate(&self, id: Uuid) -> Result<(), StoreError>;
    /// Record a use of `id`. Returns whether the record is still active.
    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;
    /// Drop the ciphertext of a retired record, keeping its metadata
    async fn scrub(&self, id: Uuid) -> Result<(), StoreError>;
    async fn organizations(&self) -> Result<Vec<String>, StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
    fn backend(&self) -> &'static str;
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    records: Mutex<HashMap<String, Vec<CredentialRecord>>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<CredentialRecord>>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_record<F>(&self, id: Uuid, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut CredentialRecord),
    {
        let mut records = self.lock();
        let record = records
            .values_mut()
            .flat_map(|versions| versions.iter_mut())
            .find(|record| record.id == id)
            .ok_or(StoreError::NotFound(id))?;
        apply(record);
        Ok(())
    }
}

fn check_insert(versions: &[CredentialRecord], record: &CredentialRecord) -> Result<(), StoreError> {
    if versions.iter().any(|r| r.version == record.version) {
        return Err(StoreError::Conflict(format!(
            "version {} already exists for {}",
            record.version, record.organization
        )));
    }
    if record.active && versions.iter().any(|r| r.active) {
        return Err(StoreError::Conflict(format!(
            "{} already has an active credential",
            record.organization
        )));
    }
    Ok(())
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn active(&self, organization: &str) -> Result<Option<CredentialRecord>, StoreError> {
        Ok(self
            .lock()
            .get(organization)
            .and_then(|versions| versions.iter().find(|r| r.active).cloned()))
    }

    async fn latest(&self, organization: &str) -> Result<Option<CredentialRecord>, StoreError> {
        Ok(self
            .lock()
            .get(organization)
            .and_then(|versions| versions.iter().max_by_key(|r| r.version).cloned()))
    }

    async fn history(&self, organization: &str) -> Result<Vec<CredentialRecord>, StoreError> {
        let mut versions = self.lock().get(organization).cloned().unwrap_or_default();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    async fn insert(&self, record: CredentialRecord) -> Result<(), StoreError> {
        let mut records = self.lock();
        let versions = records.entry(record.organization.clone()).or_default();
        check_insert(versions, &record)?;
        versions.push(record);
        Ok(())
    }

    async fn rotate(&self, previous: Uuid, next: CredentialRecord) -> Result<(), StoreError> {
        let mut records = self.lock();
        let versions = records.entry(next.organization.clone()).or_default();
        let index = versions
            .iter()
            .position(|r| r.id == previous)
            .ok_or(StoreError::NotFound(previous))?;
        if !versions[index].active {
            return Err(StoreError::Conflict(format!(
                "version {} of {} is no longer active",
                versions[index].version, next.organization
            )));
        }
        if versions.iter().any(|r| r.version == next.version) {
            return Err(StoreError::Conflict(format!(
                "version {} already exists for {}",
                next.version, next.organization
            )));
        }

        versions[index].active = false;
        versions[index].deactivated_at = Some(Utc::now());
        versions.push(next);
        Ok(())
    }

    async fn reactivate(&self, current: Option<Uuid>, target: Uuid) -> Result<(), StoreError> {
        let mut records = self.lock();
        let versions = records
            .values_mut()
            .find(|versions| versions.iter().any(|r| r.id == target))
            .ok_or(StoreError::NotFound(target))?;

        let now = Utc::now();
        for record in versions.iter_mut() {
            if Some(record.id) == current {
                record.active = false;
                record.deactivated_at = Some(now);
            }
        }
        for record in versions.iter_mut() {
            if record.id == target {
                record.active = true;
                record.deactivated_at = None;
            }
        }
        Ok(())
    }

    async fn deactivate(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_record(id, |record| {
            record.active = false;
            record.deactivated_at = Some(Utc::now());
        })
    }

    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut active = false;
        self.with_record(id, |record| {
            record.last_used_at = Some(at);
            active = record.active;
        })?;
        Ok(active)
    }

    async fn scrub(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_record(id, |record| {
            record.encrypted_secret = None;
            record.nonce = None;
        })
    }

    async fn organizations(&self) -> Result<Vec<String>, StoreError> {
        let mut organizations: Vec<String> = self.lock().keys().cloned().collect();
        organizations.sort();
        Ok(organizations)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

const RECORD_COLUMNS: &str = "id, organization, encrypted_secret, nonce, version, active, created_at, \
     last_used_at, last_rotated_at, expires_at, deactivated_at";

/// `provider_credentials` table, see `migrations/`
#[derive(Clone)]
pub struct PostgresCredentialStore {
    pool: PgPool,
}

impl PostgresCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Database(err.to_string()))
    }

    async fn fetch_one_where(&self, clause: &str, organization: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let query_span = tracing::info_span!("Fetching provider credential", organization);
        let sql = format!("SELECT {} FROM provider_credentials WHERE {}", RECORD_COLUMNS, clause);
        sqlx::query_as::<_, CredentialRecord>(&sql)
            .bind(organization)
            .fetch_optional(&self.pool)
            .instrument(query_span)
            .await
            .map_err(|err| {
                tracing::error!("Failed to fetch credential: {:?}", err);
                StoreError::from(err)
            })
    }

    async fn insert_with<'c, E>(executor: E, record: &CredentialRecord) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO provider_credentials (id, organization, encrypted_secret, nonce, version, active,
                                              created_at, last_used_at, last_rotated_at, expires_at, deactivated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(&record.organization)
        .bind(&record.encrypted_secret)
        .bind(&record.nonce)
        .bind(record.version)
        .bind(record.active)
        .bind(record.created_at)
        .bind(record.last_used_at)
        .bind(record.last_rotated_at)
        .bind(record.expires_at)
        .bind(record.deactivated_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn update_by_id(&self, sql: &str, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(sql).bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for PostgresCredentialStore {
    async fn active(&self, organization: &str) -> Result<Option<CredentialRecord>, StoreError> {
        self.fetch_one_where("organization = $1 AND active", organization)
            .await
    }

    async fn latest(&self, organization: &str) -> Result<Option<CredentialRecord>, StoreError> {
        self.fetch_one_where("organization = $1 ORDER BY version DESC LIMIT 1", organization)
            .await
    }

    async fn history(&self, organization: &str) -> Result<Vec<CredentialRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM provider_credentials WHERE organization = $1 ORDER BY version DESC",
            RECORD_COLUMNS
        );
        Ok(sqlx::query_as::<_, CredentialRecord>(&sql)
            .bind(organization)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn insert(&self, record: CredentialRecord) -> Result<(), StoreError> {
        let query_span = tracing::info_span!("Inserting provider credential", organization = %record.organization);
        Self::insert_with(&self.pool, &record)
            .instrument(query_span)
            .await
            .map_err(StoreError::from)
    }

    async fn rotate(&self, previous: Uuid, next: CredentialRecord) -> Result<(), StoreError> {
        let query_span = tracing::info_span!("Rotating provider credential", organization = %next.organization);
        async move {
            let mut tx = self.pool.begin().await?;
            let retired = sqlx::query(
                "UPDATE provider_credentials SET active = FALSE, deactivated_at = NOW() WHERE id = $1 AND active",
            )
            .bind(previous)
            .execute(&mut *tx)
            .await?;
            if retired.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(StoreError::Conflict(format!("credential {} is no longer active", previous)));
            }
            Self::insert_with(&mut *tx, &next).await?;
            tx.commit().await?;
            Ok::<(), StoreError>(())
        }
        .instrument(query_span)
        .await
    }

    async fn reactivate(&self, current: Option<Uuid>, target: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        if let Some(current) = current {
            sqlx::query("UPDATE provider_credentials SET active = FALSE, deactivated_at = NOW() WHERE id = $1")
                .bind(current)
                .execute(&mut *tx)
                .await?;
        }
        let restored = sqlx::query(
            "UPDATE provider_credentials SET active = TRUE, deactivated_at = NULL WHERE id = $1",
        )
        .bind(target)
        .execute(&mut *tx)
        .await?;
        if restored.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound(target));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn deactivate(&self, id: Uuid) -> Result<(), StoreError> {
        self.update_by_id(
            "UPDATE provider_credentials SET active = FALSE, deactivated_at = NOW() WHERE id = $1",
            id,
        )
        .await
    }

    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let active = sqlx::query_scalar::<_, bool>(
            "UPDATE provider_credentials SET last_used_at = $2 WHERE id = $1 RETURNING active",
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(active.unwrap_or(false))
    }

    async fn scrub(&self, id: Uuid) -> Result<(), StoreError> {
        self.update_by_id(
            "UPDATE provider_credentials SET encrypted_secret = NULL, nonce = NULL WHERE id = $1 AND NOT active",
            id,
        )
        .await
    }

    async fn organizations(&self) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT organization FROM provider_credentials ORDER BY organization",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(org: &str, version: i32) -> CredentialRecord {
        CredentialRecord::new(org, version, format!("ct-{}", version), "nonce".into())
    }

    #[tokio::test]
    async fn only_one_active_record_per_organization() {
        let store = InMemoryCredentialStore::new();
        store.insert(record("acme", 1)).await.unwrap();
        assert!(matches!(
            store.insert(record("acme", 2)).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn rotate_retires_previous_and_keeps_history() {
        let store = InMemoryCredentialStore::new();
        let first = record("acme", 1);
        let first_id = first.id;
        store.insert(first).await.unwrap();
        store.rotate(first_id, record("acme", 2)).await.unwrap();

        let active = store.active("acme").await.unwrap().unwrap();
        assert_eq!(active.version, 2);
        let history = store.history("acme").await.unwrap();
        assert_eq!(history.iter().map(|r| r.version).collect::<Vec<_>>(), vec![2, 1]);
        assert!(!history[1].active);
        assert!(history[1].deactivated_at.is_some());

        // the retired record can no longer be rotated from
        assert!(store.rotate(first_id, record("acme", 3)).await.is_err());
    }

    #[tokio::test]
    async fn scrub_keeps_metadata() {
        let store = InMemoryCredentialStore::new();
        let rec = record("acme", 1);
        let id = rec.id;
        store.insert(rec).await.unwrap();
        store.deactivate(id).await.unwrap();
        assert!(!store.touch(id, Utc::now()).await.unwrap());
        store.scrub(id).await.unwrap();

        let latest = store.latest("acme").await.unwrap().unwrap();
        assert!(!latest.is_retained());
        assert_eq!(latest.version, 1);
    }

    #[test]
    fn ciphertext_is_never_serialized() {
        let json = serde_json::to_value(record("acme", 1)).unwrap();
        assert!(json.get("encrypted_secret").is_none());
        assert!(json.get("nonce").is_none());
        assert_eq!(json["version"], 1);
    }
}
