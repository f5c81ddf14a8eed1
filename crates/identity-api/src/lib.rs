use std::path::PathBuf;

use anyhow::Result;
use identity_core::{ConsolidatedIdentity, Contact, ContactId, IdentityError, Observation, Resolution};
use identity_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore, DEFAULT_BUSY_TIMEOUT_MS};
use serde::{Deserialize, Deserializer, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Intake payload for `identify`.
///
/// `phoneNumber` may arrive as a JSON string or a JSON number; both are kept as text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "phone_number_from_string_or_number")]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    /// # Errors
    /// Returns [`IdentityError::Validation`] when neither email nor phone number is present.
    pub fn into_observation(self) -> Result<Observation, IdentityError> {
        Observation::new(self.email, self.phone_number)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyResponse {
    pub contact: ConsolidatedIdentity,
}

impl From<Resolution> for IdentifyResponse {
    fn from(resolution: Resolution) -> Self {
        Self { contact: resolution.identity }
    }
}

fn phone_number_from_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PhoneNumberInput {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(Option::<PhoneNumberInput>::deserialize(deserializer)?.map(|value| match value {
        PhoneNumberInput::Text(text) => text,
        PhoneNumberInput::Number(number) => number.to_string(),
    }))
}

#[derive(Debug, Clone)]
pub struct IdentityApi {
    db_path: PathBuf,
    busy_timeout_ms: u64,
}

impl IdentityApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS }
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout_ms: u64) -> Self {
        self.busy_timeout_ms = busy_timeout_ms;
        self
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open_with_busy_timeout(&self.db_path, self.busy_timeout_ms).map_err(|err| {
            IdentityError::StoreUnavailable(format!("{err:#}")).into()
        })
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store
            .migrate()
            .map_err(|err| IdentityError::StoreUnavailable(format!("{err:#}")))?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Reconcile one intake payload into its consolidated identity.
    ///
    /// # Errors
    /// Returns an error wrapping [`IdentityError`]: `Validation` for empty payloads,
    /// `StoreUnavailable` when the store cannot be reached, or a linkage error.
    pub fn identify(&self, request: IdentifyRequest) -> Result<Resolution> {
        let observation = request.into_observation()?;
        let mut store = self.open_migrated_store()?;
        let resolution = store.identify(&observation)?;
        tracing::debug!(
            primary_id = %resolution.identity.primary_contact_id,
            secondaries = resolution.identity.secondary_contact_ids.len(),
            "identify resolved"
        );
        Ok(resolution)
    }

    /// # Errors
    /// Returns an error wrapping [`IdentityError::NotFound`] when the contact does not exist.
    pub fn contact_show(&self, id: ContactId) -> Result<Contact> {
        let store = self.open_migrated_store()?;
        store.get_contact(id)?.ok_or_else(|| IdentityError::NotFound(id).into())
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn contact_list(&self) -> Result<Vec<Contact>> {
        let store = self.open_migrated_store()?;
        store.list_contacts()
    }

    /// Consolidated view of the identity containing `id`.
    ///
    /// # Errors
    /// Returns an error wrapping [`IdentityError`] for unknown ids or a damaged linkage graph.
    pub fn identity_show(&self, id: ContactId) -> Result<ConsolidatedIdentity> {
        let store = self.open_migrated_store()?;
        store.identity_of(id)
    }

    /// # Errors
    /// Returns an error when any integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }
}
