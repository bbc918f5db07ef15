//! Task execution.
//!
//! [`Pipeline`] is the [`TaskRunner`] behind the task queue. Each task type
//! maps to one handler; a handler either publishes exactly one event on
//! success or returns an error, which the queue turns into a retry or a
//! `TaskFailed` event.
//!
//! | Task     | Lane     | Effect                                             | Event               |
//! |----------|----------|----------------------------------------------------|---------------------|
//! | RESERVE  | serial   | new record + RESERVED identifier                   | `IdentifierSettled` |
//! | IMPORT   | parallel | validate, transform, persist, identifier → PENDING | `IdentifierUpdated` |
//! | UPDATE   | parallel | new versions when content changed                  | `IdentifierUpdated` |
//! | SYNC     | serial   | mint or refresh at the registrar → ACCESSIBLE      | `IdentifierSynced`  |
//! | TRANSFER | serial   | record ownership change                            | `IdentifierSettled` |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, instrument};

use crate::error::{error_chain, IgsnError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::provider::MetadataKind;
use crate::queue::TaskRunner;
use crate::registrar::RegistrarFactory;
use crate::schema::SchemaRegistry;
use crate::state::RequestStateMachine;
use crate::store::{ContentCommit, IdentifierWrite, RegistryStore};
use crate::transform::{MetadataTransformer, TransformParams};
use crate::types::*;
use crate::validator::ContentValidator;

/// Everything a task handler touches.
pub struct PipelineDeps {
    pub store: Arc<dyn RegistryStore>,
    pub registry: Arc<SchemaRegistry>,
    pub validator: Arc<ContentValidator>,
    pub transformer: Arc<MetadataTransformer>,
    pub registrars: Arc<dyn RegistrarFactory>,
    pub allocations: Arc<HashMap<String, Allocation>>,
    pub state: Arc<RequestStateMachine>,
    pub events: Arc<EventBus>,
    /// Schema of the version sent to the registrar.
    pub registration_schema: String,
}

pub struct Pipeline {
    deps: PipelineDeps,
}

/// Validated content with the metadata pulled out of it.
struct Extracted {
    content: Vec<u8>,
    identifier: String,
    title: Option<String>,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        self.deps.events.publish(event).await
    }

    // ── RESERVE ──

    async fn reserve(&self, request: &Request, task: &Task) -> Result<()> {
        let value = identifier_of(task)?;
        if self
            .deps
            .store
            .identifier_exists(value, IdentifierType::Igsn)
            .await?
        {
            return Err(IgsnError::Conflict(format!("IGSN {value} already exists")));
        }

        let (owner_type, owner_id) = owner_of(request)?;
        let record = Record::new(
            owner_type,
            &owner_id,
            request.attribute(attributes::ALLOCATION_ID).map(str::to_string),
        );
        let identifier = Identifier::new(
            value,
            IdentifierStatus::Reserved,
            record.id,
            Some(request.id),
        );
        let identifier = self
            .deps
            .store
            .commit_content(&ContentCommit {
                identifier: IdentifierWrite::Insert(identifier),
                record,
                versions: Vec::new(),
            })
            .await?;
        info!(request_id = %request.id, identifier = %identifier.value, "Identifier reserved");

        self.publish(PipelineEvent::IdentifierSettled {
            request_id: request.id,
            key: identifier.value,
            status: Some(IdentifierStatus::Reserved),
        })
        .await
    }

    // ── IMPORT ──

    async fn import(&self, request: &Request, task: &Task) -> Result<()> {
        let schema_id = schema_of(request)?;
        let extracted = self.read_content(task, schema_id).await?;
        let value = extracted.identifier.clone();

        let existing = self
            .deps
            .store
            .find_identifier(&value, IdentifierType::Igsn)
            .await?;
        let mut record = match &existing {
            Some(identifier) if identifier.status > IdentifierStatus::Reserved => {
                return Err(IgsnError::Conflict(format!(
                    "IGSN {value} is already {}",
                    identifier.status
                )));
            }
            Some(identifier) => self.record_of(identifier).await?,
            None => {
                let (owner_type, owner_id) = owner_of(request)?;
                Record::new(
                    owner_type,
                    &owner_id,
                    request.attribute(attributes::ALLOCATION_ID).map(str::to_string),
                )
            }
        };
        if extracted.title.is_some() {
            record.title = extracted.title.clone();
        }
        record.modified_at = Utc::now();

        // Every version is built before anything is stored.
        let versions = self.derive_versions(
            request,
            &record,
            schema_id,
            extracted.content,
            "submitted",
        )?;

        let identifier = match existing {
            Some(mut identifier) => {
                identifier.advance(IdentifierStatus::Pending, request.id)?;
                IdentifierWrite::Update(identifier)
            }
            None => IdentifierWrite::Insert(Identifier::new(
                &value,
                IdentifierStatus::Pending,
                record.id,
                Some(request.id),
            )),
        };
        let version_count = versions.len();
        self.deps
            .store
            .commit_content(&ContentCommit {
                identifier,
                record,
                versions,
            })
            .await?;
        info!(
            request_id = %request.id,
            identifier = %value,
            versions = version_count,
            "Identifier imported"
        );

        self.publish(PipelineEvent::IdentifierUpdated {
            request_id: request.id,
            identifier: value,
        })
        .await
    }

    // ── UPDATE ──

    async fn update(&self, request: &Request, task: &Task) -> Result<()> {
        let schema_id = schema_of(request)?;
        let extracted = self.read_content(task, schema_id).await?;
        let value = extracted.identifier.clone();

        let mut identifier = self.identifier(&value).await?;
        let mut record = self.record_of(&identifier).await?;

        let unchanged = self
            .deps
            .store
            .current_version(record.id, schema_id)
            .await?
            .is_some_and(|current| current.hash == content_hash(&extracted.content));
        if unchanged {
            debug!(request_id = %request.id, identifier = %value, "Content unchanged; nothing to update");
            return self
                .publish(PipelineEvent::IdentifierSettled {
                    request_id: request.id,
                    key: value,
                    status: Some(identifier.status),
                })
                .await;
        }

        if extracted.title.is_some() {
            record.title = extracted.title.clone();
        }
        record.modified_at = Utc::now();
        let versions =
            self.derive_versions(request, &record, schema_id, extracted.content, "updated")?;

        identifier.request_id = Some(request.id);
        identifier.updated_at = Utc::now();
        self.deps
            .store
            .commit_content(&ContentCommit {
                identifier: IdentifierWrite::Update(identifier),
                record,
                versions,
            })
            .await?;
        info!(request_id = %request.id, identifier = %value, "Identifier updated");

        self.publish(PipelineEvent::IdentifierUpdated {
            request_id: request.id,
            identifier: value,
        })
        .await
    }

    // ── SYNC ──

    async fn sync(&self, request: &Request, task: &Task) -> Result<()> {
        let value = identifier_of(task)?;
        let mut identifier = self.identifier(value).await?;
        let record = self.record_of(&identifier).await?;

        let allocation_id = request
            .attribute(attributes::ALLOCATION_ID)
            .or(record.allocation_id.as_deref())
            .ok_or_else(|| {
                IgsnError::Configuration(format!("no allocation for identifier {value}"))
            })?;
        let allocation = self
            .deps
            .allocations
            .get(allocation_id)
            .ok_or_else(|| IgsnError::not_found("allocation", allocation_id))?;
        let registrar = self.deps.registrars.for_allocation(allocation)?;

        let metadata = self
            .deps
            .store
            .current_version(record.id, &self.deps.registration_schema)
            .await?
            .ok_or_else(|| {
                IgsnError::not_found(
                    "registration metadata",
                    format!("{value} ({})", self.deps.registration_schema),
                )
            })?;
        let metadata = metadata.content_str()?;

        match identifier.status {
            IdentifierStatus::Reserved => {
                return Err(IgsnError::InvalidTransition {
                    entity: "identifier",
                    id: identifier.value.clone(),
                    from: IdentifierStatus::Reserved.to_string(),
                    to: IdentifierStatus::Accessible.to_string(),
                });
            }
            IdentifierStatus::Pending => {
                let landing_page = self.landing_page(request, &record, allocation, value).await?;
                registrar
                    .mint_identifier(value, &landing_page, metadata, allocation.test_mode)
                    .await?;
                identifier.advance(IdentifierStatus::Accessible, request.id)?;
                self.deps.store.update_identifier(&identifier).await?;
                info!(
                    request_id = %request.id,
                    identifier = %value,
                    test_mode = allocation.test_mode,
                    "Identifier minted"
                );
            }
            IdentifierStatus::Accessible => {
                if !allocation.test_mode {
                    registrar.attach_metadata(metadata).await?;
                }
                debug!(request_id = %request.id, identifier = %value, "Registrar metadata refreshed");
            }
        }

        self.publish(PipelineEvent::IdentifierSynced {
            request_id: request.id,
            identifier: identifier.value,
            status: IdentifierStatus::Accessible,
        })
        .await
    }

    // ── TRANSFER ──

    async fn transfer(&self, request: &Request, task: &Task) -> Result<()> {
        let value = identifier_of(task)?;
        let mut identifier = self.identifier(value).await?;
        let mut record = self.record_of(&identifier).await?;

        let owner_id = request
            .attribute(attributes::TARGET_OWNER_ID)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                IgsnError::ValidationFailed(format!(
                    "transfer requires '{}'",
                    attributes::TARGET_OWNER_ID
                ))
            })?;
        let owner_type = match request.attribute(attributes::TARGET_OWNER_TYPE) {
            Some(raw) => raw.parse()?,
            None => record.owner_type,
        };
        let previous = format!("{} {}", record.owner_type.as_str(), record.owner_id);
        let next = format!("{} {}", owner_type.as_str(), owner_id);
        record.owner_type = owner_type;
        record.owner_id = owner_id.to_string();
        record.modified_at = Utc::now();
        identifier.request_id = Some(request.id);
        identifier.updated_at = Utc::now();
        let identifier = self
            .deps
            .store
            .commit_content(&ContentCommit {
                identifier: IdentifierWrite::Update(identifier),
                record,
                versions: Vec::new(),
            })
            .await?;
        info!(
            request_id = %request.id,
            identifier = %value,
            from = %previous,
            to = %next,
            "Ownership transferred"
        );

        self.publish(PipelineEvent::IdentifierSettled {
            request_id: request.id,
            key: identifier.value,
            status: Some(identifier.status),
        })
        .await
    }

    // ── Helpers ──

    async fn read_content(&self, task: &Task, schema_id: &str) -> Result<Extracted> {
        let path = task.content_file.as_ref().ok_or_else(|| {
            IgsnError::ValidationFailed(format!("{} task has no content file", task.task_type))
        })?;
        let content = tokio::fs::read(path).await?;
        self.deps.validator.validate(schema_id, &content)?;

        let text = std::str::from_utf8(&content)
            .map_err(|e| IgsnError::ValidationFailed(format!("content is not UTF-8: {e}")))?;
        let identifier = self.extract(schema_id, MetadataKind::Identifier, text)?;
        let title = self.extract(schema_id, MetadataKind::Title, text).ok();
        Ok(Extracted {
            content,
            identifier,
            title,
        })
    }

    fn extract(&self, schema_id: &str, kind: MetadataKind, text: &str) -> Result<String> {
        self.deps
            .registry
            .resolve_provider(schema_id, kind)?
            .build(kind)
            .get(text)
    }

    /// Source version first, then one version per declared transform target.
    fn derive_versions(
        &self,
        request: &Request,
        record: &Record,
        schema_id: &str,
        content: Vec<u8>,
        event_type: &str,
    ) -> Result<Vec<Version>> {
        let source = Version::new(record.id, schema_id, content, Some(request.id));
        let params = TransformParams {
            registrant_name: Some(
                request
                    .attribute(attributes::REGISTRANT_NAME)
                    .unwrap_or(&request.created_by)
                    .to_string(),
            ),
            event_type: Some(event_type.to_string()),
            timestamp: Some(source.created_at),
        };
        let schema = self.deps.registry.get(schema_id)?;
        let mut versions = Vec::with_capacity(schema.transforms.len() + 1);
        for target in schema.transforms.keys() {
            versions.push(self.deps.transformer.transform(&source, target, &params)?);
        }
        versions.insert(0, source);
        Ok(versions)
    }

    async fn landing_page(
        &self,
        request: &Request,
        record: &Record,
        allocation: &Allocation,
        value: &str,
    ) -> Result<String> {
        if let Some(schema_id) = request.attribute(attributes::SCHEMA_ID) {
            if let Some(source) = self.deps.store.current_version(record.id, schema_id).await? {
                if let Ok(url) = self.extract(schema_id, MetadataKind::LandingPage, source.content_str()?)
                {
                    return Ok(url);
                }
            }
        }
        allocation.landing_page_for(value).ok_or_else(|| {
            IgsnError::ValidationFailed(format!("no landing page known for {value}"))
        })
    }

    async fn identifier(&self, value: &str) -> Result<Identifier> {
        self.deps
            .store
            .find_identifier(value, IdentifierType::Igsn)
            .await?
            .ok_or_else(|| IgsnError::not_found("identifier", value))
    }

    async fn record_of(&self, identifier: &Identifier) -> Result<Record> {
        self.deps
            .store
            .find_record(identifier.record_id)
            .await?
            .ok_or_else(|| IgsnError::not_found("record", identifier.record_id.to_string()))
    }
}

#[async_trait]
impl TaskRunner for Pipeline {
    #[instrument(skip_all, fields(task_type = %task.task_type, key = %task.key()))]
    async fn run(&self, task: &Task) -> Result<()> {
        self.deps.state.on_task_started(task.request_id).await?;
        let request = self.deps.state.load(task.request_id).await?;
        match task.task_type {
            TaskType::Reserve => self.reserve(&request, task).await,
            TaskType::Import => self.import(&request, task).await,
            TaskType::Update => self.update(&request, task).await,
            TaskType::Sync => self.sync(&request, task).await,
            TaskType::Transfer => self.transfer(&request, task).await,
        }
    }

    async fn on_retry(&self, task: &Task, error: &IgsnError, attempt: u32) {
        self.deps
            .state
            .audit()
            .warn(
                task.request_id,
                &format!(
                    "{} {} attempt {attempt} failed, retrying: {}",
                    task.task_type,
                    task.key(),
                    error_chain(error)
                ),
            )
            .await;
    }

    async fn on_failed(&self, task: &Task, error: &IgsnError, attempts: u32) {
        let mut message = error_chain(error);
        if attempts > 1 {
            message.push_str(&format!(" (after {attempts} attempts)"));
        }
        let event = PipelineEvent::TaskFailed {
            request_id: task.request_id,
            key: task.key(),
            task_type: task.task_type,
            error: message,
        };
        if let Err(e) = self.publish(event).await {
            error!(
                request_id = %task.request_id,
                key = %task.key(),
                error = %e,
                "Could not report task failure"
            );
        }
    }
}

fn identifier_of(task: &Task) -> Result<&str> {
    task.identifier_value.as_deref().ok_or_else(|| {
        IgsnError::ValidationFailed(format!("{} task has no identifier", task.task_type))
    })
}

fn schema_of(request: &Request) -> Result<&str> {
    request.attribute(attributes::SCHEMA_ID).ok_or_else(|| {
        IgsnError::ValidationFailed(format!(
            "{} request requires '{}'",
            request.request_type,
            attributes::SCHEMA_ID
        ))
    })
}

/// Owner from the request attributes, defaulting to the requesting user.
fn owner_of(request: &Request) -> Result<(OwnerType, String)> {
    let owner_type = match request.attribute(attributes::OWNER_TYPE) {
        Some(raw) => raw.parse()?,
        None => OwnerType::User,
    };
    let owner_id = request
        .attribute(attributes::OWNER_ID)
        .filter(|id| !id.trim().is_empty())
        .unwrap_or(&request.created_by)
        .to_string();
    Ok((owner_type, owner_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(attrs: &[(&str, &str)]) -> Request {
        let attributes: BTreeMap<String, String> = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Request::new(RequestType::Reserve, "user-1", attributes, false)
    }

    #[test]
    fn owner_defaults_to_requesting_user() {
        let (owner_type, owner_id) = owner_of(&request(&[])).unwrap();
        assert_eq!(owner_type, OwnerType::User);
        assert_eq!(owner_id, "user-1");

        let (owner_type, owner_id) = owner_of(&request(&[
            (attributes::OWNER_TYPE, "group"),
            (attributes::OWNER_ID, "lab-7"),
        ]))
        .unwrap();
        assert_eq!(owner_type, OwnerType::Group);
        assert_eq!(owner_id, "lab-7");

        assert!(owner_of(&request(&[(attributes::OWNER_TYPE, "robot")])).is_err());
    }

    #[test]
    fn schema_is_required_for_content_tasks() {
        let err = schema_of(&request(&[])).unwrap_err();
        assert!(matches!(err, IgsnError::ValidationFailed(ref m) if m.contains("schema_id")));
        assert_eq!(
            schema_of(&request(&[(attributes::SCHEMA_ID, "ardc-igsn-desc-1.0")])).unwrap(),
            "ardc-igsn-desc-1.0"
        );
    }
}
