//! Domain model: identifiers, records, versions, requests and tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{IgsnError, Result};

// ─── Identifier ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdentifierType {
    Igsn,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Igsn => "IGSN",
        }
    }
}

/// Identifier lifecycle. Ordering follows the lifecycle, so `a < b` means
/// `b` is further along than `a`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdentifierStatus {
    Reserved,
    Pending,
    Accessible,
}

impl IdentifierStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "RESERVED",
            Self::Pending => "PENDING",
            Self::Accessible => "ACCESSIBLE",
        }
    }

    /// Status only ever moves forward.
    pub fn can_advance_to(&self, next: IdentifierStatus) -> bool {
        next >= *self
    }
}

impl std::fmt::Display for IdentifierStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identifier {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub identifier_type: IdentifierType,
    pub value: String,
    pub status: IdentifierStatus,
    pub record_id: Uuid,
    /// The request that last mutated this identifier.
    pub request_id: Option<Uuid>,
    /// Optimistic lock counter, bumped by the store on every update.
    pub lock_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identifier {
    pub fn new(
        value: &str,
        status: IdentifierStatus,
        record_id: Uuid,
        request_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            identifier_type: IdentifierType::Igsn,
            value: normalize_identifier(value),
            status,
            record_id,
            request_id,
            lock_version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move the status forward, refusing regressions.
    pub fn advance(&mut self, next: IdentifierStatus, request_id: Uuid) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(IgsnError::InvalidTransition {
                entity: "identifier",
                id: self.value.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.request_id = Some(request_id);
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Identifier values compare case-insensitively downstream; store them upper-cased.
pub fn normalize_identifier(value: &str) -> String {
    value.trim().to_uppercase()
}

// ─── Record ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    Igsn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OwnerType {
    User,
    Group,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Group => "GROUP",
        }
    }
}

impl std::str::FromStr for OwnerType {
    type Err = IgsnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USER" => Ok(Self::User),
            "GROUP" => Ok(Self::Group),
            other => Err(IgsnError::ValidationFailed(format!(
                "unknown owner type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub record_type: RecordType,
    pub owner_type: OwnerType,
    pub owner_id: String,
    pub allocation_id: Option<String>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Record {
    pub fn new(owner_type: OwnerType, owner_id: &str, allocation_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            record_type: RecordType::Igsn,
            owner_type,
            owner_id: owner_id.to_string(),
            allocation_id,
            title: None,
            created_at: now,
            modified_at: now,
        }
    }
}

// ─── Version ──────────────────────────────────────────────────

/// Immutable, schema-tagged content snapshot of a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub id: Uuid,
    pub record_id: Uuid,
    pub schema: String,
    pub content: Vec<u8>,
    /// Lowercase hex SHA-256 of `content`.
    pub hash: String,
    pub current: bool,
    pub request_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Version {
    pub fn new(record_id: Uuid, schema: &str, content: Vec<u8>, request_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_id,
            schema: schema.to_string(),
            hash: content_hash(&content),
            content,
            current: true,
            request_id,
            created_at: Utc::now(),
        }
    }

    pub fn content_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.content)
            .map_err(|e| IgsnError::ValidationFailed(format!("content is not UTF-8: {e}")))
    }
}

pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

// ─── Request ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Accepted,
    Queued,
    Running,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "ACCEPTED",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (Self::Accepted, Self::Queued)
                | (Self::Queued, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestType {
    Mint,
    Update,
    Reserve,
    Transfer,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mint => "MINT",
            Self::Update => "UPDATE",
            Self::Reserve => "RESERVE",
            Self::Transfer => "TRANSFER",
        }
    }

    /// Task type each batch token or chunk becomes.
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Mint => TaskType::Import,
            Self::Update => TaskType::Update,
            Self::Reserve => TaskType::Reserve,
            Self::Transfer => TaskType::Transfer,
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RequestType {
    type Err = IgsnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MINT" => Ok(Self::Mint),
            "UPDATE" => Ok(Self::Update),
            "RESERVE" => Ok(Self::Reserve),
            "TRANSFER" => Ok(Self::Transfer),
            other => Err(IgsnError::ValidationFailed(format!(
                "unknown request type: {other}"
            ))),
        }
    }
}

/// Well-known request attribute keys.
pub mod attributes {
    pub const ALLOCATION_ID: &str = "allocation_id";
    pub const SCHEMA_ID: &str = "schema_id";
    pub const OWNER_TYPE: &str = "owner_type";
    pub const OWNER_ID: &str = "owner_id";
    pub const TARGET_OWNER_TYPE: &str = "target_owner_type";
    pub const TARGET_OWNER_ID: &str = "target_owner_id";
    pub const REGISTRANT_NAME: &str = "registrant_name";
}

/// Counts written once the request finalizes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
    pub status: RequestStatus,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub attributes: BTreeMap<String, String>,
    pub data_path: Option<PathBuf>,
    pub created_by: String,
    pub manual: bool,
    pub summary: Option<RequestSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    pub fn new(
        request_type: RequestType,
        created_by: &str,
        attributes: BTreeMap<String, String>,
        manual: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: RequestStatus::Accepted,
            request_type,
            attributes,
            data_path: None,
            created_by: created_by.to_string(),
            manual,
            summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn transition_to(&mut self, next: RequestStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(IgsnError::InvalidTransition {
                entity: "request",
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

// ─── Outcomes ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

/// Per-identifier result of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierOutcome {
    /// Identifier value, or the chunk file name when no value could be extracted.
    pub key: String,
    pub status: OutcomeStatus,
    pub error: Option<String>,
    pub identifier_status: Option<IdentifierStatus>,
}

/// Request plus its per-identifier outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestReport {
    pub request: Request,
    pub outcomes: Vec<IdentifierOutcome>,
}

impl RequestReport {
    pub fn failed(&self) -> impl Iterator<Item = &IdentifierOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
    }
}

// ─── Task ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskType {
    Import,
    Sync,
    Update,
    Reserve,
    Transfer,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Import => "IMPORT",
            Self::Sync => "SYNC",
            Self::Update => "UPDATE",
            Self::Reserve => "RESERVE",
            Self::Transfer => "TRANSFER",
        }
    }

    /// Tasks that mutate identifier state at the registrar run on the serial lane.
    pub fn is_serial(&self) -> bool {
        matches!(self, Self::Sync | Self::Reserve | Self::Transfer)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ephemeral unit of work; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_type: TaskType,
    pub request_id: Uuid,
    pub identifier_value: Option<String>,
    pub content_file: Option<PathBuf>,
}

impl Task {
    pub fn for_identifier(task_type: TaskType, request_id: Uuid, value: &str) -> Self {
        Self {
            task_type,
            request_id,
            identifier_value: Some(normalize_identifier(value)),
            content_file: None,
        }
    }

    pub fn for_content(
        task_type: TaskType,
        request_id: Uuid,
        identifier_value: Option<String>,
        content_file: PathBuf,
    ) -> Self {
        Self {
            task_type,
            request_id,
            identifier_value: identifier_value.map(|v| normalize_identifier(&v)),
            content_file: Some(content_file),
        }
    }

    /// Key under which this task's outcome is recorded.
    pub fn key(&self) -> String {
        if let Some(value) = &self.identifier_value {
            return value.clone();
        }
        self.content_file
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "<unknown>".to_string())
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.task_type == other.task_type && self.identifier_value == other.identifier_value
    }
}

impl Eq for Task {}

impl std::hash::Hash for Task {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.task_type.hash(state);
        self.identifier_value.hash(state);
    }
}

// ─── Allocation ───────────────────────────────────────────────

/// Tenant scope under which identifiers are minted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub prefix: String,
    pub namespace: String,
    pub mds_url: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub test_mode: bool,
    /// `{identifier}` is replaced with the identifier value.
    pub landing_page_template: Option<String>,
}

impl Allocation {
    pub fn landing_page_for(&self, identifier: &str) -> Option<String> {
        self.landing_page_template
            .as_ref()
            .map(|t| t.replace("{identifier}", identifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn request_lifecycle_transitions() {
        let mut request = Request::new(RequestType::Reserve, "u1", BTreeMap::new(), false);
        assert_eq!(request.status, RequestStatus::Accepted);
        request.transition_to(RequestStatus::Queued).unwrap();
        request.transition_to(RequestStatus::Running).unwrap();
        request.transition_to(RequestStatus::Completed).unwrap();
        assert!(request.status.is_terminal());

        let err = request.transition_to(RequestStatus::Running).unwrap_err();
        assert!(matches!(err, IgsnError::InvalidTransition { .. }));
    }

    #[test]
    fn request_cannot_skip_queue() {
        let mut request = Request::new(RequestType::Mint, "u1", BTreeMap::new(), false);
        assert!(request.transition_to(RequestStatus::Running).is_err());
        assert_eq!(request.status, RequestStatus::Accepted);
    }

    #[test]
    fn identifier_status_is_monotonic() {
        let mut identifier =
            Identifier::new("10273/xxaa1234", IdentifierStatus::Reserved, Uuid::new_v4(), None);
        assert_eq!(identifier.value, "10273/XXAA1234");

        let request_id = Uuid::new_v4();
        identifier.advance(IdentifierStatus::Pending, request_id).unwrap();
        identifier
            .advance(IdentifierStatus::Accessible, request_id)
            .unwrap();
        assert!(identifier
            .advance(IdentifierStatus::Reserved, request_id)
            .is_err());
        assert_eq!(identifier.status, IdentifierStatus::Accessible);
    }

    #[test]
    fn task_equality_ignores_request_and_file() {
        let a = Task::for_identifier(TaskType::Reserve, Uuid::new_v4(), "abc");
        let b = Task::for_identifier(TaskType::Reserve, Uuid::new_v4(), "ABC");
        let c = Task::for_identifier(TaskType::Transfer, Uuid::new_v4(), "ABC");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<Task> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn task_key_falls_back_to_file_name() {
        let task = Task::for_content(
            TaskType::Import,
            Uuid::new_v4(),
            None,
            PathBuf::from("/data/requests/x/chunks/0003.xml"),
        );
        assert_eq!(task.key(), "0003.xml");
    }

    #[test]
    fn version_hash_is_content_addressed() {
        let record = Uuid::new_v4();
        let a = Version::new(record, "s", b"<a/>".to_vec(), None);
        let b = Version::new(record, "s", b"<a/>".to_vec(), None);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn landing_page_template() {
        let allocation = Allocation {
            id: "a".into(),
            prefix: "10273".into(),
            namespace: "XXAA".into(),
            mds_url: None,
            username: None,
            password: None,
            test_mode: true,
            landing_page_template: Some("https://example.org/view/{identifier}".into()),
        };
        assert_eq!(
            allocation.landing_page_for("10273/XXAA1").as_deref(),
            Some("https://example.org/view/10273/XXAA1")
        );
    }
}
