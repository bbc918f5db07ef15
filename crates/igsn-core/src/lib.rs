//! IGSN registry core.
//!
//! Identifier lifecycle and metadata transformation pipeline for an IGSN
//! (International Generic Sample Number) registry:
//!
//! - **Schemas** (`schema`, `validator`, `provider`, `transform`): schema
//!   descriptors, XSD / JSON Schema validation, identifier extraction and
//!   schema-to-schema transforms.
//! - **Lifecycle** (`state`, `queue`, `events`, `pipeline`): requests move
//!   ACCEPTED → QUEUED → RUNNING → COMPLETED/FAILED while their tasks run on a
//!   serial lane (registrar mutations) and a bounded parallel lane (content
//!   processing), chained by typed events.
//! - **Edges** (`registrar`, `store`, `access`, `audit`, `workspace`): the MDS
//!   client, persistence contract, permission checks, per-request audit logs
//!   and request data directories.
//!
//! [`service::IgsnService`] wires everything together.
//!
//! # Example
//!
//! ```ignore
//! let service = IgsnService::start(config, ServiceDeps {
//!     store: Arc::new(MemoryStore::new()),
//!     registrars: Arc::new(MdsClientFactory::new(config.registrar.timeout())),
//!     access: Arc::new(PermissionListPolicy),
//! })?;
//! let request = service
//!     .submit(&user, RequestType::Reserve, attributes, b"10273/XXAA1\n", false)
//!     .await?;
//! let report = service.wait_for_completion(request.id).await?;
//! ```

pub mod access;
pub mod audit;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod registrar;
pub mod schema;
pub mod service;
pub mod state;
pub mod store;
pub mod transform;
pub mod types;
pub mod validator;
pub mod workspace;
pub mod xml;

pub use access::{AccessPolicy, AllowAll, PermissionListPolicy, Scope, User};
pub use config::RegistryConfig;
pub use error::{IgsnError, RegistrarError, Result};
pub use registrar::{MdsClient, MdsClientFactory, Registrar, RegistrarFactory};
pub use schema::SchemaRegistry;
pub use service::{IgsnService, ServiceDeps};
pub use state::CompletionPolicy;
pub use store::{MemoryStore, RegistryStore};
pub use transform::TransformParams;
pub use types::*;
