use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use identity_core::{
    audit_linkage, Contact, ContactId, ContactStore, ConsolidatedIdentity, IdentityError,
    LinkPrecedence, LinkageReport, NewContact, Observation, Resolution,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  phone_number TEXT,
  linked_id INTEGER REFERENCES contacts(id),
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary', 'secondary')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (email IS NOT NULL OR phone_number IS NOT NULL),
  CHECK (
    (link_precedence = 'primary' AND linked_id IS NULL)
    OR (link_precedence = 'secondary' AND linked_id IS NOT NULL)
  ),
  CHECK (linked_id IS NULL OR linked_id <> id)
);

CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
";

const CONTACT_COLUMNS: &str = "id, email, phone_number, linked_id, link_precedence, created_at";

const CONTACTS_FILE: &str = "contacts.ndjson";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_contacts: usize,
    pub skipped_existing_contacts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
    pub linkage: LinkageReport,
}

impl SqliteStore {
    /// Open a SQLite-backed contact store with the default busy timeout.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT_MS)
    }

    /// Open a SQLite-backed contact store and configure required runtime pragmas.
    ///
    /// `busy_timeout_ms` bounds how long a writer waits for the database lock before
    /// the call fails as store-unavailable.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {busy_timeout_ms};"
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "contacts")? {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        if table_has_column(&self.conn, "contacts", "link_precedence")? {
            // Table created out of band with the current shape; only the ledger is missing.
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        Err(anyhow!("database schema is invalid: contacts table has no link_precedence column"))
    }

    /// Reconcile one observation against the stored contacts.
    ///
    /// Matching, merging and inserts run inside one IMMEDIATE transaction, so concurrent
    /// callers touching the same identity are serialized on the database write lock.
    ///
    /// # Errors
    /// Returns an error wrapping [`IdentityError`] when the lock cannot be taken, the stored
    /// graph is inconsistent, or any read or write fails. Nothing is committed on error.
    pub fn identify(&mut self, observation: &Observation) -> Result<Resolution> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| {
                IdentityError::StoreUnavailable(format!(
                    "failed to begin identify transaction: {err}"
                ))
            })?;

        let resolution = {
            let mut contacts = ContactRows { conn: &*tx };
            identity_core::identify(&mut contacts, observation)?
        };

        tx.commit().map_err(|err| {
            IdentityError::StoreUnavailable(format!("failed to commit identify transaction: {err}"))
        })?;

        if resolution.wrote_anything() {
            tracing::debug!(
                primary_id = %resolution.identity.primary_contact_id,
                created = ?resolution.created,
                demoted = resolution.demoted.len(),
                relinked = resolution.relinked.len(),
                repaired = resolution.repaired.len(),
                "committed identify transaction"
            );
        }

        Ok(resolution)
    }

    /// # Errors
    /// Returns an error when contacts cannot be read or a stored row is malformed.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY id ASC"))
            .context("failed to prepare contact listing")?;
        let rows = stmt.query_map([], ContactRow::read).context("failed to list contacts")?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row.context("failed to read contact row")?.into_contact()?);
        }
        Ok(contacts)
    }

    /// # Errors
    /// Returns an error when the contact cannot be read or its row is malformed.
    pub fn get_contact(&self, id: ContactId) -> Result<Option<Contact>> {
        Ok(ContactRows { conn: &self.conn }.find_by_id(id)?)
    }

    /// Consolidated view of the identity containing `id`, without writing anything.
    ///
    /// # Errors
    /// Returns an error wrapping [`IdentityError::NotFound`] for unknown ids, or the linkage
    /// errors raised while walking the stored graph.
    pub fn identity_of(&self, id: ContactId) -> Result<ConsolidatedIdentity> {
        Ok(identity_core::identity_of(&ContactRows { conn: &self.conn }, id)?)
    }

    /// Export all contacts in deterministic id order, plus a manifest with digests.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let contacts = self.list_contacts()?;
        let contacts_path = out_dir.join(CONTACTS_FILE);
        let (sha256, records) = write_ndjson_file(&contacts_path, &contacts)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![ExportFileDigest { path: CONTACTS_FILE.to_string(), sha256, records }],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory, preserving contact ids.
    ///
    /// # Errors
    /// Returns an error when migration, manifest validation, duplicate handling, or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let mut contacts = read_ndjson_file::<Contact>(&in_dir.join(CONTACTS_FILE))?;
        contacts.sort_by_key(|contact| contact.id);

        let mut summary = ImportSummary { imported_contacts: 0, skipped_existing_contacts: 0 };
        let tx = self.conn.transaction().context("failed to begin import transaction")?;
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;")
            .context("failed to defer foreign keys for import")?;

        let now = now_rfc3339()?;
        for contact in contacts {
            contact.validate()?;
            if contact_exists(&tx, contact.id)? {
                if skip_existing {
                    summary.skipped_existing_contacts += 1;
                    continue;
                }

                return Err(anyhow!("contact already exists for id {}", contact.id));
            }

            tx.execute(
                "INSERT INTO contacts(
                    id, email, phone_number, linked_id, link_precedence, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    contact.id.0,
                    contact.email,
                    contact.phone_number,
                    contact.linked_id.map(|linked_id| linked_id.0),
                    contact.link_precedence.as_str(),
                    rfc3339(contact.created_at)?,
                    now,
                ],
            )
            .with_context(|| format!("failed to import contact {}", contact.id))?;
            summary.imported_contacts += 1;
        }

        tx.commit().context("failed to commit import transaction")?;
        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, schema status and contact linkage probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let linkage = audit_linkage(&self.list_contacts()?);
        if !linkage.is_consistent() {
            tracing::warn!(violations = linkage.violations.len(), "contact linkage audit failed");
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
            linkage,
        })
    }
}

/// [`ContactStore`] over a borrowed connection; inside [`SqliteStore::identify`] it borrows
/// the open transaction.
struct ContactRows<'conn> {
    conn: &'conn Connection,
}

impl ContactRows<'_> {
    fn query_contacts(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Contact>, IdentityError> {
        let mut stmt = self.conn.prepare_cached(sql).map_err(store_error)?;
        let rows = stmt.query_map(params, ContactRow::read).map_err(store_error)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row.map_err(store_error)?.into_contact()?);
        }
        Ok(contacts)
    }

    /// `max(now, newest created_at)`; ids and timestamps increase together.
    fn next_created_at(&self) -> Result<OffsetDateTime, IdentityError> {
        let now = OffsetDateTime::now_utc();
        let latest = self
            .conn
            .query_row("SELECT created_at FROM contacts ORDER BY id DESC LIMIT 1", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .map_err(store_error)?;

        let Some(latest) = latest else {
            return Ok(now);
        };
        let latest = parse_rfc3339(&latest)
            .map_err(|err| IdentityError::Consistency(format!("{err:#}")))?;
        Ok(now.max(latest))
    }
}

impl ContactStore for ContactRows<'_> {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, IdentityError> {
        self.query_contacts(
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE email = ?1 OR phone_number = ?2
                 ORDER BY id ASC"
            ),
            params![email, phone_number],
        )
    }

    fn find_by_id(&self, id: ContactId) -> Result<Option<Contact>, IdentityError> {
        let contacts = self.query_contacts(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
            params![id.0],
        )?;
        Ok(contacts.into_iter().next())
    }

    fn find_by_linked_id(&self, linked_id: ContactId) -> Result<Vec<Contact>, IdentityError> {
        self.query_contacts(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE linked_id = ?1 ORDER BY id ASC"),
            params![linked_id.0],
        )
    }

    fn insert_contact(&mut self, contact: NewContact) -> Result<Contact, IdentityError> {
        contact.validate()?;
        let created_at = self.next_created_at()?;
        let stamp = rfc3339(created_at).map_err(|err| IdentityError::Consistency(format!("{err:#}")))?;

        self.conn
            .execute(
                "INSERT INTO contacts(
                    email, phone_number, linked_id, link_precedence, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    contact.email,
                    contact.phone_number,
                    contact.linked_id.map(|linked_id| linked_id.0),
                    contact.link_precedence.as_str(),
                    stamp,
                ],
            )
            .map_err(store_error)?;

        Ok(Contact {
            id: ContactId(self.conn.last_insert_rowid()),
            email: contact.email,
            phone_number: contact.phone_number,
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at,
        })
    }

    fn update_linkage(
        &mut self,
        id: ContactId,
        linked_id: ContactId,
        precedence: LinkPrecedence,
    ) -> Result<(), IdentityError> {
        let now = now_rfc3339().map_err(|err| IdentityError::Consistency(format!("{err:#}")))?;
        let changed = self
            .conn
            .execute(
                "UPDATE contacts SET linked_id = ?1, link_precedence = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![linked_id.0, precedence.as_str(), now, id.0],
            )
            .map_err(store_error)?;
        if changed == 0 {
            return Err(IdentityError::NotFound(id));
        }
        Ok(())
    }
}

struct ContactRow {
    id: i64,
    email: Option<String>,
    phone_number: Option<String>,
    linked_id: Option<i64>,
    link_precedence: String,
    created_at: String,
}

impl ContactRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            phone_number: row.get(2)?,
            linked_id: row.get(3)?,
            link_precedence: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_contact(self) -> Result<Contact, IdentityError> {
        let Some(link_precedence) = LinkPrecedence::parse(&self.link_precedence) else {
            return Err(IdentityError::Consistency(format!(
                "contact {} has invalid link_precedence {}",
                self.id, self.link_precedence
            )));
        };
        let created_at = parse_rfc3339(&self.created_at)
            .map_err(|err| IdentityError::Consistency(format!("contact {}: {err:#}", self.id)))?;

        Ok(Contact {
            id: ContactId(self.id),
            email: self.email,
            phone_number: self.phone_number,
            linked_id: self.linked_id.map(ContactId),
            link_precedence,
            created_at,
        })
    }
}

fn store_error(err: rusqlite::Error) -> IdentityError {
    IdentityError::StoreUnavailable(err.to_string())
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
    record_schema_version(conn, 1)
}

fn contact_exists(conn: &Connection, id: ContactId) -> Result<bool> {
    let exists = conn
        .query_row("SELECT EXISTS(SELECT 1 FROM contacts WHERE id = ?1)", params![id.0], |row| {
            row.get::<_, i64>(0)
        })
        .with_context(|| format!("failed to check if contact exists: {id}"))?;
    Ok(exists == 1)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "contacts")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "contacts", "link_precedence")? {
        return Ok((1, true));
    }

    Err(anyhow!("database schema is invalid: contacts table has no link_precedence column"))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    let Some(expected) = by_path.get(CONTACTS_FILE) else {
        return Err(anyhow!("manifest is missing required file entry: {CONTACTS_FILE}"));
    };
    let file_path = in_dir.join(CONTACTS_FILE);
    if !file_path.exists() {
        return Err(anyhow!("manifest references missing file {}", file_path.display()));
    }

    let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
    if actual_sha256 != expected.sha256 {
        return Err(anyhow!(
            "manifest digest mismatch for {CONTACTS_FILE}: expected {}, got {}",
            expected.sha256,
            actual_sha256
        ));
    }
    if actual_records != expected.records {
        return Err(anyhow!(
            "manifest record count mismatch for {CONTACTS_FILE}: expected {}, got {}",
            expected.records,
            actual_records
        ));
    }

    Ok(())
}
