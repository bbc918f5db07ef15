//! Registry service facade.
//!
//! Wires the schema registry, validator, transformer, state machine, task
//! queue and event bus together and exposes the outward operations. The
//! outer layer (HTTP, CLI) authenticates the caller and passes a [`User`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::access::{AccessPolicy, Scope, User};
use crate::audit::AuditLogger;
use crate::config::RegistryConfig;
use crate::error::{IgsnError, Result};
use crate::events::{CompletionTracker, EventBus, EventHandler, SyncScheduler};
use crate::pipeline::{Pipeline, PipelineDeps};
use crate::provider::{LineProvider, MetadataKind, MetadataProvider};
use crate::queue::TaskQueue;
use crate::registrar::RegistrarFactory;
use crate::schema::{SchemaKind, SchemaRegistry};
use crate::state::RequestStateMachine;
use crate::store::RegistryStore;
use crate::transform::{MetadataTransformer, TransformParams};
use crate::types::*;
use crate::validator::ContentValidator;
use crate::workspace::RequestWorkspace;
use crate::xml::XmlDocument;

/// Collaborators supplied by the embedding application.
pub struct ServiceDeps {
    pub store: Arc<dyn RegistryStore>,
    pub registrars: Arc<dyn RegistrarFactory>,
    pub access: Arc<dyn AccessPolicy>,
}

pub struct IgsnService {
    config: RegistryConfig,
    store: Arc<dyn RegistryStore>,
    registry: Arc<SchemaRegistry>,
    validator: Arc<ContentValidator>,
    transformer: Arc<MetadataTransformer>,
    access: Arc<dyn AccessPolicy>,
    allocations: Arc<HashMap<String, Allocation>>,
    state: Arc<RequestStateMachine>,
    queue: Arc<TaskQueue>,
    events: Arc<EventBus>,
}

impl IgsnService {
    /// Load schemas and spawn the queue workers and event dispatcher. Must
    /// be called inside a Tokio runtime.
    pub fn start(config: RegistryConfig, deps: ServiceDeps) -> Result<Self> {
        let schemas_dir = config.schemas_dir();
        let registry = if config.strict_schemas {
            SchemaRegistry::load(&schemas_dir)?
        } else {
            let partial = SchemaRegistry::load_partial(&schemas_dir)?;
            for rejected in &partial.rejected {
                warn!(schema = %rejected.id, reason = %rejected.reason, "Schema disabled");
            }
            partial.registry
        };
        let registry = Arc::new(registry);
        let validator = Arc::new(ContentValidator::new(registry.clone()));
        let transformer = Arc::new(MetadataTransformer::new(
            registry.clone(),
            validator.clone(),
        ));
        let allocations = Arc::new(config.allocations());

        let audit = Arc::new(AuditLogger::new(config.requests_dir()));
        let state = Arc::new(RequestStateMachine::new(
            deps.store.clone(),
            audit,
            config.completion_policy,
        ));

        let queue = TaskQueue::new(&config.queue);
        let handlers: Vec<Arc<dyn EventHandler>> = vec![
            Arc::new(SyncScheduler::new(queue.clone())),
            Arc::new(CompletionTracker::new(state.clone())),
        ];
        let events = Arc::new(EventBus::start(config.events.buffer_size, handlers));

        let pipeline = Pipeline::new(PipelineDeps {
            store: deps.store.clone(),
            registry: registry.clone(),
            validator: validator.clone(),
            transformer: transformer.clone(),
            registrars: deps.registrars,
            allocations: allocations.clone(),
            state: state.clone(),
            events: events.clone(),
            registration_schema: config.registration_schema.clone(),
        });
        queue.start(Arc::new(pipeline))?;

        info!(
            schemas = registry.ids().count(),
            allocations = allocations.len(),
            policy = ?config.completion_policy,
            "IGSN service started"
        );
        Ok(Self {
            config,
            store: deps.store,
            registry,
            validator,
            transformer,
            access: deps.access,
            allocations,
            state,
            queue,
            events,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        self.state.audit()
    }

    // ── Requests ──

    /// Check permissions and required attributes, then accept the request.
    pub async fn create_request(
        &self,
        user: &User,
        request_type: RequestType,
        attrs: BTreeMap<String, String>,
        manual: bool,
    ) -> Result<Request> {
        let allocation_id = attrs
            .get(attributes::ALLOCATION_ID)
            .ok_or_else(|| {
                IgsnError::ValidationFailed(format!(
                    "request requires '{}'",
                    attributes::ALLOCATION_ID
                ))
            })?;
        if !self.allocations.contains_key(allocation_id) {
            return Err(IgsnError::not_found("allocation", allocation_id.clone()));
        }
        self.access
            .require(user, allocation_id, Scope::required_for(request_type))?;

        match request_type {
            RequestType::Mint | RequestType::Update => {
                let schema_id = attrs.get(attributes::SCHEMA_ID).ok_or_else(|| {
                    IgsnError::ValidationFailed(format!(
                        "{request_type} request requires '{}'",
                        attributes::SCHEMA_ID
                    ))
                })?;
                if !self.registry.supports(schema_id) {
                    return Err(IgsnError::SchemaNotSupported(schema_id.clone()));
                }
            }
            RequestType::Transfer => {
                if attrs
                    .get(attributes::TARGET_OWNER_ID)
                    .map_or(true, |id| id.trim().is_empty())
                {
                    return Err(IgsnError::ValidationFailed(format!(
                        "TRANSFER request requires '{}'",
                        attributes::TARGET_OWNER_ID
                    )));
                }
            }
            RequestType::Reserve => {}
        }

        self.state
            .create_request(&user.id, request_type, attrs, manual)
            .await
    }

    /// Split `payload` into tasks and queue them.
    ///
    /// RESERVE and TRANSFER take one identifier per line. MINT and UPDATE take
    /// a document in the request's schema; XML batches are split into one
    /// chunk per child of the root element. Manual requests are waited on
    /// and returned in their terminal state.
    pub async fn enqueue_batch(&self, request_id: Uuid, payload: &[u8]) -> Result<Request> {
        let mut request = self.state.load(request_id).await?;
        if request.status != RequestStatus::Accepted {
            return Err(IgsnError::Conflict(format!(
                "request {request_id} is {} and cannot take a batch",
                request.status
            )));
        }

        let workspace = RequestWorkspace::create(self.audit().requests_dir(), request_id).await?;
        let task_type = request.request_type.task_type();
        let mut tasks = match request.request_type {
            RequestType::Reserve | RequestType::Transfer => {
                let text = std::str::from_utf8(payload).map_err(|e| {
                    IgsnError::ValidationFailed(format!("payload is not UTF-8: {e}"))
                })?;
                request.data_path = Some(workspace.write_payload(payload, "txt").await?);
                LineProvider::identifiers()
                    .get_all(text)?
                    .iter()
                    .map(|value| Task::for_identifier(task_type, request_id, value))
                    .collect::<Vec<_>>()
            }
            RequestType::Mint | RequestType::Update => {
                let schema_id = request
                    .attribute(attributes::SCHEMA_ID)
                    .ok_or_else(|| {
                        IgsnError::ValidationFailed(format!(
                            "request requires '{}'",
                            attributes::SCHEMA_ID
                        ))
                    })?
                    .to_string();
                let (chunks, extension) = self.split_payload(&schema_id, payload)?;
                request.data_path = Some(workspace.write_payload(payload, extension).await?);

                let mut tasks = Vec::with_capacity(chunks.len());
                for (index, chunk) in chunks.into_iter().enumerate() {
                    let value = std::str::from_utf8(&chunk)
                        .ok()
                        .and_then(|text| self.extract(&schema_id, text).ok());
                    let path = workspace.write_chunk(index + 1, &chunk, extension).await?;
                    tasks.push(Task::for_content(task_type, request_id, value, path));
                }
                tasks
            }
        };
        self.store.save_request(&request).await?;

        let mut seen = HashSet::new();
        tasks.retain(|task| task.identifier_value.is_none() || seen.insert(task.clone()));
        let keys: Vec<String> = tasks.iter().map(Task::key).collect();

        let queued = self.state.enqueue(request_id, &keys).await?;
        if tasks.is_empty() {
            return Ok(queued);
        }
        let handles: Vec<_> = tasks.into_iter().map(|t| self.queue.submit(t)).collect();
        if !request.manual {
            return Ok(queued);
        }
        futures::future::join_all(handles.into_iter().map(|h| h.wait())).await;
        Ok(self.state.wait_for_completion(request_id).await?.request)
    }

    /// Create, enqueue and (for manual requests) wait, in one call.
    pub async fn submit(
        &self,
        user: &User,
        request_type: RequestType,
        attrs: BTreeMap<String, String>,
        payload: &[u8],
        manual: bool,
    ) -> Result<Request> {
        let request = self
            .create_request(user, request_type, attrs, manual)
            .await?;
        self.enqueue_batch(request.id, payload).await
    }

    pub async fn get_request_status(&self, request_id: Uuid) -> Result<RequestReport> {
        self.state.report(request_id).await
    }

    pub async fn wait_for_completion(&self, request_id: Uuid) -> Result<RequestReport> {
        self.state.wait_for_completion(request_id).await
    }

    // ── Content ──

    pub fn validate(&self, schema_id: &str, content: &[u8]) -> Result<()> {
        self.validator.validate(schema_id, content)
    }

    /// Transform without persisting. The input is validated first.
    pub fn transform(
        &self,
        schema_id: &str,
        content: &[u8],
        target: &str,
        params: &TransformParams,
    ) -> Result<Version> {
        self.validator.validate(schema_id, content)?;
        let input = Version::new(Uuid::nil(), schema_id, content.to_vec(), None);
        self.transformer.transform(&input, target, params)
    }

    pub fn extract_identifiers(&self, schema_id: &str, payload: &[u8]) -> Result<Vec<String>> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| IgsnError::ValidationFailed(format!("payload is not UTF-8: {e}")))?;
        self.provider(schema_id)?.get_all(text)
    }

    fn provider(&self, schema_id: &str) -> Result<Box<dyn MetadataProvider>> {
        if !self.registry.supports(schema_id) {
            return Err(IgsnError::SchemaNotSupported(schema_id.to_string()));
        }
        Ok(self
            .registry
            .resolve_provider(schema_id, MetadataKind::Identifier)?
            .build(MetadataKind::Identifier))
    }

    fn extract(&self, schema_id: &str, text: &str) -> Result<String> {
        self.provider(schema_id)?.get(text)
    }

    /// Chunks and their file extension for a content payload.
    fn split_payload(&self, schema_id: &str, payload: &[u8]) -> Result<(Vec<Vec<u8>>, &'static str)> {
        let schema = self
            .registry
            .get(schema_id)
            .map_err(|_| IgsnError::SchemaNotSupported(schema_id.to_string()))?;
        match schema.kind {
            SchemaKind::Xml => {
                let doc = XmlDocument::parse(payload)
                    .map_err(|e| IgsnError::ValidationFailed(e.to_string()))?;
                let chunks = doc
                    .split_root_children()
                    .iter()
                    .map(|chunk| chunk.to_xml_string().into_bytes())
                    .collect();
                Ok((chunks, "xml"))
            }
            SchemaKind::Json => Ok((vec![payload.to_vec()], "json")),
            SchemaKind::Text => Ok((vec![payload.to_vec()], "txt")),
        }
    }
}
