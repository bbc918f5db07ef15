use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{IgsnError, Result};
use crate::types::*;

/// Persistence contract for requests, identifiers, records, versions and
/// per-request outcomes.
///
/// The pipeline works exclusively through this trait. `MemoryStore` backs
/// tests and the CLI; a database backend implements the same invariants.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    // ── Requests ──

    /// Insert or replace. Replacing a terminal request is a `Conflict`.
    async fn save_request(&self, request: &Request) -> Result<()>;
    async fn find_request(&self, id: Uuid) -> Result<Option<Request>>;

    // ── Identifiers ──

    async fn find_identifier(
        &self,
        value: &str,
        identifier_type: IdentifierType,
    ) -> Result<Option<Identifier>>;
    async fn identifier_exists(&self, value: &str, identifier_type: IdentifierType)
        -> Result<bool>;

    /// Compare-and-set on `lock_version`. Returns the stored row with the
    /// bumped lock version; a stale lock version is a `TransientConflict`.
    async fn update_identifier(&self, identifier: &Identifier) -> Result<Identifier>;

    // ── Records ──

    async fn find_record(&self, id: Uuid) -> Result<Option<Record>>;

    // ── Versions ──

    async fn current_version(&self, record_id: Uuid, schema: &str) -> Result<Option<Version>>;
    async fn versions_for_record(&self, record_id: Uuid) -> Result<Vec<Version>>;

    // ── Content ──

    /// Apply the identifier write, then the record and versions, as one
    /// unit. An insert of a taken (type, value) is a `Conflict`; an update
    /// with a stale `lock_version` is a `TransientConflict`. Either leaves
    /// the store untouched.
    ///
    /// Each version becomes current for its (record, schema). Content
    /// matching a superseded version makes that version current again;
    /// content matching the current version is skipped.
    async fn commit_content(&self, commit: &ContentCommit) -> Result<Identifier>;

    // ── Outcomes ──

    /// Record the outcome for `outcome.key`, replacing an earlier one.
    async fn save_outcome(&self, request_id: Uuid, outcome: &IdentifierOutcome) -> Result<()>;
    async fn outcomes(&self, request_id: Uuid) -> Result<Vec<IdentifierOutcome>>;
}

/// Identifier half of a [`ContentCommit`].
#[derive(Debug, Clone)]
pub enum IdentifierWrite {
    /// `Conflict` if (type, value) is taken.
    Insert(Identifier),
    /// Compare-and-set on `lock_version`.
    Update(Identifier),
}

/// Everything one content task persists.
#[derive(Debug, Clone)]
pub struct ContentCommit {
    pub identifier: IdentifierWrite,
    pub record: Record,
    pub versions: Vec<Version>,
}

#[derive(Default)]
struct Tables {
    requests: HashMap<Uuid, Request>,
    identifiers: HashMap<(IdentifierType, String), Identifier>,
    records: HashMap<Uuid, Record>,
    versions: HashMap<Uuid, Vec<Version>>,
    outcomes: HashMap<Uuid, Vec<IdentifierOutcome>>,
}

impl Tables {
    fn check_insert(&self, identifier: &Identifier) -> Result<()> {
        let key = (identifier.identifier_type, identifier.value.clone());
        if self.identifiers.contains_key(&key) {
            return Err(IgsnError::Conflict(format!(
                "{} {} already exists",
                identifier.identifier_type.as_str(),
                identifier.value
            )));
        }
        Ok(())
    }

    fn check_update(&self, identifier: &Identifier) -> Result<()> {
        let key = (identifier.identifier_type, identifier.value.clone());
        let stored = self
            .identifiers
            .get(&key)
            .ok_or_else(|| IgsnError::not_found("identifier", identifier.value.clone()))?;
        if stored.lock_version != identifier.lock_version {
            return Err(IgsnError::TransientConflict(format!(
                "identifier {} was modified concurrently (expected lock version {}, found {})",
                identifier.value, identifier.lock_version, stored.lock_version
            )));
        }
        Ok(())
    }

    fn put_identifier(&mut self, identifier: Identifier) {
        let key = (identifier.identifier_type, identifier.value.clone());
        self.identifiers.insert(key, identifier);
    }

    fn put_version(&mut self, version: &Version) -> Result<()> {
        let versions = self.versions.entry(version.record_id).or_default();
        let matching = versions
            .iter()
            .position(|v| v.schema == version.schema && v.hash == version.hash);
        if let Some(index) = matching {
            if versions[index].current {
                return Err(IgsnError::VersionContentAlreadyExists {
                    record_id: version.record_id,
                    schema: version.schema.clone(),
                });
            }
        }
        for existing in versions.iter_mut().filter(|v| v.schema == version.schema) {
            existing.current = false;
        }
        match matching {
            Some(index) => versions[index].current = true,
            None => {
                let mut stored = version.clone();
                stored.current = true;
                versions.push(stored);
            }
        }
        Ok(())
    }
}

/// In-memory store. One lock over all tables keeps multi-table invariants
/// (version supersession, identifier CAS) atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn save_request(&self, request: &Request) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.requests.get(&request.id) {
            if existing.status.is_terminal() {
                return Err(IgsnError::Conflict(format!(
                    "request {} is {} and can no longer change",
                    request.id, existing.status
                )));
            }
        }
        tables.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn find_request(&self, id: Uuid) -> Result<Option<Request>> {
        Ok(self.tables.read().await.requests.get(&id).cloned())
    }

    async fn find_identifier(
        &self,
        value: &str,
        identifier_type: IdentifierType,
    ) -> Result<Option<Identifier>> {
        let key = (identifier_type, normalize_identifier(value));
        Ok(self.tables.read().await.identifiers.get(&key).cloned())
    }

    async fn identifier_exists(
        &self,
        value: &str,
        identifier_type: IdentifierType,
    ) -> Result<bool> {
        let key = (identifier_type, normalize_identifier(value));
        Ok(self.tables.read().await.identifiers.contains_key(&key))
    }

    async fn update_identifier(&self, identifier: &Identifier) -> Result<Identifier> {
        let mut tables = self.tables.write().await;
        tables.check_update(identifier)?;
        let mut updated = identifier.clone();
        updated.lock_version += 1;
        tables.put_identifier(updated.clone());
        Ok(updated)
    }

    async fn find_record(&self, id: Uuid) -> Result<Option<Record>> {
        Ok(self.tables.read().await.records.get(&id).cloned())
    }

    async fn current_version(&self, record_id: Uuid, schema: &str) -> Result<Option<Version>> {
        let tables = self.tables.read().await;
        Ok(tables.versions.get(&record_id).and_then(|versions| {
            versions
                .iter()
                .find(|v| v.current && v.schema == schema)
                .cloned()
        }))
    }

    async fn versions_for_record(&self, record_id: Uuid) -> Result<Vec<Version>> {
        let tables = self.tables.read().await;
        Ok(tables.versions.get(&record_id).cloned().unwrap_or_default())
    }

    async fn commit_content(&self, commit: &ContentCommit) -> Result<Identifier> {
        let mut tables = self.tables.write().await;
        let stored = match &commit.identifier {
            IdentifierWrite::Insert(identifier) => {
                tables.check_insert(identifier)?;
                identifier.clone()
            }
            IdentifierWrite::Update(identifier) => {
                tables.check_update(identifier)?;
                let mut updated = identifier.clone();
                updated.lock_version += 1;
                updated
            }
        };
        tables.put_identifier(stored.clone());
        tables
            .records
            .insert(commit.record.id, commit.record.clone());
        for version in &commit.versions {
            match tables.put_version(version) {
                Ok(()) | Err(IgsnError::VersionContentAlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(stored)
    }

    async fn save_outcome(&self, request_id: Uuid, outcome: &IdentifierOutcome) -> Result<()> {
        let mut tables = self.tables.write().await;
        let outcomes = tables.outcomes.entry(request_id).or_default();
        match outcomes.iter_mut().find(|o| o.key == outcome.key) {
            Some(existing) => *existing = outcome.clone(),
            None => outcomes.push(outcome.clone()),
        }
        Ok(())
    }

    async fn outcomes(&self, request_id: Uuid) -> Result<Vec<IdentifierOutcome>> {
        let tables = self.tables.read().await;
        Ok(tables.outcomes.get(&request_id).cloned().unwrap_or_default())
    }
}
