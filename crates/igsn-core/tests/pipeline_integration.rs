//! End-to-end tests for the request pipeline.
//!
//! Each test starts a full [`IgsnService`] over a [`MemoryStore`], a temp data
//! directory and a scripted registrar, then drives requests to a terminal
//! state through the public API.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use igsn_core::config::{AllocationConfig, QueueConfig};
use igsn_core::{
    attributes, AllowAll, IdentifierStatus, IdentifierType, IgsnError, OutcomeStatus,
    OwnerType, PermissionListPolicy, Registrar, RegistrarError, RegistrarFactory,
    RegistryConfig, RequestReport, RequestStatus, RequestType, Scope, ServiceDeps,
    TransformParams, User,
};
use igsn_core::{Allocation, IgsnService, MemoryStore, RegistryStore};

const ALLOCATION: &str = "ardc-test";
const ARDC: &str = "ardc-igsn-desc-1.0";
const REGISTRATION: &str = "igsn-registration-metadata-1.1";

const TWO_RESOURCES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<resources xmlns="https://identifiers.ardc.edu.au/schemas/ardc-igsn-desc">
  <resource registeredObjectType="http://pid.geoscience.gov.au/def/voc/ga/igsncode/PhysicalSample">
    <resourceIdentifier identifierType="IGSN">10273/XXAA001</resourceIdentifier>
    <landingPage>https://demo.identifiers.ardc.edu.au/igsn/#/meta/XXAA001</landingPage>
    <resourceTitle>Basalt core</resourceTitle>
    <resourceTypes><resourceType>core</resourceType></resourceTypes>
  </resource>
  <resource registeredObjectType="http://pid.geoscience.gov.au/def/voc/ga/igsncode/PhysicalSample">
    <resourceIdentifier identifierType="IGSN">10273/XXAA002</resourceIdentifier>
    <landingPage>https://demo.identifiers.ardc.edu.au/igsn/#/meta/XXAA002</landingPage>
    <resourceTitle>Granite chip</resourceTitle>
    <resourceTypes><resourceType>rock</resourceType></resourceTypes>
  </resource>
</resources>"#;

fn single_resource(title: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<resources xmlns="https://identifiers.ardc.edu.au/schemas/ardc-igsn-desc">
  <resource registeredObjectType="http://pid.geoscience.gov.au/def/voc/ga/igsncode/PhysicalSample">
    <resourceIdentifier identifierType="IGSN">10273/XXAA010</resourceIdentifier>
    <landingPage>https://demo.identifiers.ardc.edu.au/igsn/#/meta/XXAA010</landingPage>
    <resourceTitle>{title}</resourceTitle>
    <resourceTypes><resourceType>core</resourceType></resourceTypes>
  </resource>
</resources>"#
    )
}

// ── Scripted registrar ─────────────────────────────────────────

/// Fails the next `timeouts` calls with a timeout, then succeeds.
#[derive(Default)]
struct ScriptedRegistrar {
    timeouts: AtomicU32,
    calls: AtomicU32,
    minted: Mutex<Vec<(String, String)>>,
    attached: AtomicU32,
}

impl ScriptedRegistrar {
    fn failing(timeouts: u32) -> Self {
        Self {
            timeouts: AtomicU32::new(timeouts),
            ..Default::default()
        }
    }

    fn fail_next(&self) -> Result<(), RegistrarError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.timeouts.load(Ordering::SeqCst);
        if left > 0 {
            self.timeouts.store(left - 1, Ordering::SeqCst);
            return Err(RegistrarError::Timeout("scripted".into()));
        }
        Ok(())
    }

    fn minted(&self) -> Vec<(String, String)> {
        let mut minted = self.minted.lock().unwrap().clone();
        minted.sort();
        minted
    }
}

#[async_trait]
impl Registrar for ScriptedRegistrar {
    async fn mint_identifier(
        &self,
        identifier: &str,
        landing_page: &str,
        _metadata: &str,
        _test_mode: bool,
    ) -> Result<(), RegistrarError> {
        self.fail_next()?;
        self.minted
            .lock()
            .unwrap()
            .push((identifier.to_string(), landing_page.to_string()));
        Ok(())
    }

    async fn attach_metadata(&self, _metadata: &str) -> Result<(), RegistrarError> {
        self.fail_next()?;
        self.attached.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_metadata(&self, identifier: &str) -> Result<String, RegistrarError> {
        Err(RegistrarError::Rejected {
            status: 404,
            body: identifier.to_string(),
        })
    }

    async fn fetch_landing_page(&self, identifier: &str) -> Result<String, RegistrarError> {
        Err(RegistrarError::Rejected {
            status: 404,
            body: identifier.to_string(),
        })
    }
}

struct ScriptedFactory(Arc<ScriptedRegistrar>);

impl RegistrarFactory for ScriptedFactory {
    fn for_allocation(&self, _allocation: &Allocation) -> igsn_core::Result<Arc<dyn Registrar>> {
        Ok(self.0.clone())
    }
}

// ── Harness ────────────────────────────────────────────────────

struct Harness {
    _dir: TempDir,
    service: IgsnService,
    store: Arc<MemoryStore>,
    registrar: Arc<ScriptedRegistrar>,
}

fn config(dir: &TempDir) -> RegistryConfig {
    RegistryConfig {
        data_dir: dir.path().to_path_buf(),
        queue: QueueConfig {
            parallel_workers: 2,
            max_attempts: 3,
            retry_backoff_ms: 0,
        },
        allocations: vec![AllocationConfig {
            id: ALLOCATION.into(),
            prefix: "10273".into(),
            namespace: "XXAA".into(),
            mds_url: None,
            username: None,
            password_env: None,
            test_mode: false,
            landing_page_template: Some("https://example.org/igsn/{identifier}".into()),
        }],
        ..Default::default()
    }
}

fn harness_with(registrar: ScriptedRegistrar) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let registrar = Arc::new(registrar);
    let service = IgsnService::start(
        config(&dir),
        ServiceDeps {
            store: store.clone(),
            registrars: Arc::new(ScriptedFactory(registrar.clone())),
            access: Arc::new(AllowAll),
        },
    )
    .unwrap();
    Harness {
        _dir: dir,
        service,
        store,
        registrar,
    }
}

fn harness() -> Harness {
    harness_with(ScriptedRegistrar::default())
}

fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert(attributes::ALLOCATION_ID.to_string(), ALLOCATION.to_string());
    for (k, v) in pairs {
        out.insert(k.to_string(), v.to_string());
    }
    out
}

fn mint_attrs() -> BTreeMap<String, String> {
    attrs(&[
        (attributes::SCHEMA_ID, ARDC),
        (attributes::REGISTRANT_NAME, "ARDC"),
    ])
}

impl Harness {
    async fn run(
        &self,
        request_type: RequestType,
        attrs: BTreeMap<String, String>,
        payload: &[u8],
    ) -> RequestReport {
        let request = self
            .service
            .submit(&User::new("u1"), request_type, attrs, payload, false)
            .await
            .unwrap();
        tokio::time::timeout(
            Duration::from_secs(10),
            self.service.wait_for_completion(request.id),
        )
        .await
        .expect("request did not finish")
        .unwrap()
    }

    async fn status_of(&self, value: &str) -> Option<IdentifierStatus> {
        self.store
            .find_identifier(value, IdentifierType::Igsn)
            .await
            .unwrap()
            .map(|i| i.status)
    }
}

// ── RESERVE / TRANSFER ─────────────────────────────────────────

#[tokio::test]
async fn reserve_creates_reserved_identifiers() {
    let h = harness();
    let report = h
        .run(
            RequestType::Reserve,
            attrs(&[]),
            b"12073/XXAA1234567\n12703/XXAB12345",
        )
        .await;

    assert_eq!(report.request.status, RequestStatus::Completed);
    let summary = report.request.summary.clone().unwrap();
    assert_eq!((summary.total, summary.completed, summary.failed), (2, 2, 0));
    assert_eq!(h.status_of("12073/XXAA1234567").await, Some(IdentifierStatus::Reserved));
    assert_eq!(h.status_of("12703/XXAB12345").await, Some(IdentifierStatus::Reserved));
    assert!(h.registrar.minted().is_empty());

    let log = h.service.audit().read(report.request.id).await.unwrap();
    assert!(log.contains("Job started: RESERVE request"));
    assert!(log.contains("Job finished: COMPLETED"));
}

#[tokio::test]
async fn reserving_an_existing_identifier_fails_the_request() {
    let h = harness();
    let first = h.run(RequestType::Reserve, attrs(&[]), b"10273/XXAA900\n").await;
    assert_eq!(first.request.status, RequestStatus::Completed);

    let second = h.run(RequestType::Reserve, attrs(&[]), b"10273/xxaa900\n").await;
    assert_eq!(second.request.status, RequestStatus::Failed);
    let failed: Vec<_> = second.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key, "10273/XXAA900");
    assert!(failed[0].error.as_deref().unwrap().contains("already exists"));
}

#[tokio::test]
async fn duplicate_lines_become_one_task() {
    let h = harness();
    let report = h
        .run(
            RequestType::Reserve,
            attrs(&[]),
            b"10273/XXAA901\n10273/xxaa901\n\n10273/XXAA902\n",
        )
        .await;
    assert_eq!(report.request.status, RequestStatus::Completed);
    assert_eq!(report.outcomes.len(), 2);
}

#[tokio::test]
async fn transfer_changes_record_owner() {
    let h = harness();
    h.run(RequestType::Reserve, attrs(&[]), b"10273/XXAA950\n").await;

    let report = h
        .run(
            RequestType::Transfer,
            attrs(&[
                (attributes::TARGET_OWNER_ID, "group-7"),
                (attributes::TARGET_OWNER_TYPE, "group"),
            ]),
            b"10273/XXAA950\n",
        )
        .await;
    assert_eq!(report.request.status, RequestStatus::Completed);

    let identifier = h
        .store
        .find_identifier("10273/XXAA950", IdentifierType::Igsn)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(identifier.status, IdentifierStatus::Reserved);
    let record = h.store.find_record(identifier.record_id).await.unwrap().unwrap();
    assert_eq!(record.owner_type, OwnerType::Group);
    assert_eq!(record.owner_id, "group-7");
}

#[tokio::test]
async fn transfer_without_target_owner_is_rejected() {
    let h = harness();
    let err = h
        .service
        .submit(&User::new("u1"), RequestType::Transfer, attrs(&[]), b"10273/XXAA1\n", false)
        .await
        .unwrap_err();
    assert!(matches!(err, IgsnError::ValidationFailed(_)));
}

// ── MINT / UPDATE ──────────────────────────────────────────────

#[tokio::test]
async fn mint_imports_transforms_and_registers_each_resource() {
    let h = harness();
    let report = h
        .run(RequestType::Mint, mint_attrs(), TWO_RESOURCES.as_bytes())
        .await;

    assert_eq!(report.request.status, RequestStatus::Completed, "{report:?}");
    assert_eq!(report.outcomes.len(), 2);
    for value in ["10273/XXAA001", "10273/XXAA002"] {
        assert_eq!(h.status_of(value).await, Some(IdentifierStatus::Accessible));
    }
    assert_eq!(
        h.registrar.minted(),
        vec![
            (
                "10273/XXAA001".to_string(),
                "https://demo.identifiers.ardc.edu.au/igsn/#/meta/XXAA001".to_string()
            ),
            (
                "10273/XXAA002".to_string(),
                "https://demo.identifiers.ardc.edu.au/igsn/#/meta/XXAA002".to_string()
            ),
        ]
    );

    let identifier = h
        .store
        .find_identifier("10273/XXAA001", IdentifierType::Igsn)
        .await
        .unwrap()
        .unwrap();
    let record = h.store.find_record(identifier.record_id).await.unwrap().unwrap();
    assert_eq!(record.title.as_deref(), Some("Basalt core"));
    assert_eq!(record.owner_id, "u1");

    let mut schemas: Vec<String> = h
        .store
        .versions_for_record(record.id)
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.schema)
        .collect();
    schemas.sort();
    assert_eq!(schemas, vec![ARDC, "ardc-igsn-jsonld", REGISTRATION, "oai_dc"]);

    let metadata = h
        .store
        .current_version(record.id, REGISTRATION)
        .await
        .unwrap()
        .unwrap();
    let metadata = metadata.content_str().unwrap();
    assert!(metadata.contains("10273/XXAA001"));
    assert!(metadata.contains("ARDC"));
}

#[tokio::test]
async fn mint_of_reserved_identifier_uses_the_reserved_record() {
    let h = harness();
    h.run(RequestType::Reserve, attrs(&[]), b"10273/XXAA010\n").await;
    let reserved = h
        .store
        .find_identifier("10273/XXAA010", IdentifierType::Igsn)
        .await
        .unwrap()
        .unwrap();

    let report = h
        .run(RequestType::Mint, mint_attrs(), single_resource("Core A").as_bytes())
        .await;
    assert_eq!(report.request.status, RequestStatus::Completed, "{report:?}");

    let minted = h
        .store
        .find_identifier("10273/XXAA010", IdentifierType::Igsn)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(minted.status, IdentifierStatus::Accessible);
    assert_eq!(minted.record_id, reserved.record_id);
}

#[tokio::test]
async fn minting_twice_conflicts() {
    let h = harness();
    let payload = single_resource("Core A");
    h.run(RequestType::Mint, mint_attrs(), payload.as_bytes()).await;

    let report = h.run(RequestType::Mint, mint_attrs(), payload.as_bytes()).await;
    assert_eq!(report.request.status, RequestStatus::Failed);
    assert_eq!(report.outcomes[0].status, OutcomeStatus::Failed);
}

#[tokio::test]
async fn invalid_content_fails_without_registering() {
    let h = harness();
    let invalid = TWO_RESOURCES.replace("<resourceTitle>Granite chip</resourceTitle>", "");
    let report = h.run(RequestType::Mint, mint_attrs(), invalid.as_bytes()).await;

    assert_eq!(report.request.status, RequestStatus::Failed);
    let summary = report.request.summary.clone().unwrap();
    assert_eq!((summary.total, summary.completed, summary.failed), (2, 1, 1));
    assert_eq!(h.status_of("10273/XXAA001").await, Some(IdentifierStatus::Accessible));
    assert_eq!(h.status_of("10273/XXAA002").await, None);
}

#[tokio::test]
async fn update_with_identical_content_adds_no_version() {
    let h = harness();
    let payload = single_resource("Core A");
    h.run(RequestType::Mint, mint_attrs(), payload.as_bytes()).await;

    let identifier = h
        .store
        .find_identifier("10273/XXAA010", IdentifierType::Igsn)
        .await
        .unwrap()
        .unwrap();
    let before = h.store.versions_for_record(identifier.record_id).await.unwrap().len();

    let report = h.run(RequestType::Update, mint_attrs(), payload.as_bytes()).await;
    assert_eq!(report.request.status, RequestStatus::Completed, "{report:?}");
    let after = h.store.versions_for_record(identifier.record_id).await.unwrap().len();
    assert_eq!(before, after);
    assert_eq!(h.registrar.attached.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn update_with_new_content_supersedes_and_refreshes_registrar() {
    let h = harness();
    h.run(RequestType::Mint, mint_attrs(), single_resource("Core A").as_bytes())
        .await;

    let report = h
        .run(RequestType::Update, mint_attrs(), single_resource("Core B").as_bytes())
        .await;
    assert_eq!(report.request.status, RequestStatus::Completed, "{report:?}");

    let identifier = h
        .store
        .find_identifier("10273/XXAA010", IdentifierType::Igsn)
        .await
        .unwrap()
        .unwrap();
    let record = h.store.find_record(identifier.record_id).await.unwrap().unwrap();
    assert_eq!(record.title.as_deref(), Some("Core B"));
    let current = h.store.current_version(record.id, ARDC).await.unwrap().unwrap();
    assert!(current.content_str().unwrap().contains("Core B"));
    assert_eq!(h.registrar.attached.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reverted_content_becomes_current_again() {
    let h = harness();
    h.run(RequestType::Mint, mint_attrs(), single_resource("Core A").as_bytes())
        .await;
    for title in ["Core B", "Core A"] {
        let report = h
            .run(RequestType::Update, mint_attrs(), single_resource(title).as_bytes())
            .await;
        assert_eq!(report.request.status, RequestStatus::Completed, "{report:?}");
    }

    let identifier = h
        .store
        .find_identifier("10273/XXAA010", IdentifierType::Igsn)
        .await
        .unwrap()
        .unwrap();
    for schema in [ARDC, "ardc-igsn-jsonld"] {
        let current = h
            .store
            .current_version(identifier.record_id, schema)
            .await
            .unwrap()
            .unwrap();
        assert!(current.content_str().unwrap().contains("Core A"), "{schema}");
    }
    let sources: Vec<_> = h
        .store
        .versions_for_record(identifier.record_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|v| v.schema == ARDC)
        .collect();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources.iter().filter(|v| v.current).count(), 1);
    assert_eq!(h.registrar.attached.load(Ordering::SeqCst), 2);

    let report = h
        .run(RequestType::Update, mint_attrs(), single_resource("Core B").as_bytes())
        .await;
    assert_eq!(report.request.status, RequestStatus::Completed, "{report:?}");
    assert_eq!(h.registrar.attached.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn concurrent_mints_of_one_identifier_register_it_once() {
    let h = harness();
    let payload = single_resource("Core A");
    let (first, second) = tokio::join!(
        h.run(RequestType::Mint, mint_attrs(), payload.as_bytes()),
        h.run(RequestType::Mint, mint_attrs(), payload.as_bytes()),
    );

    let mut statuses = [first.request.status, second.request.status];
    statuses.sort_by_key(|s| s.to_string());
    assert_eq!(statuses, [RequestStatus::Completed, RequestStatus::Failed]);
    assert_eq!(h.registrar.minted().len(), 1);
    assert_eq!(h.status_of("10273/XXAA010").await, Some(IdentifierStatus::Accessible));

    let identifier = h
        .store
        .find_identifier("10273/XXAA010", IdentifierType::Igsn)
        .await
        .unwrap()
        .unwrap();
    let sources = h
        .store
        .versions_for_record(identifier.record_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|v| v.schema == ARDC)
        .count();
    assert_eq!(sources, 1);
}

#[tokio::test]
async fn deeply_nested_payload_is_rejected() {
    let h = harness();
    let depth = igsn_core::xml::MAX_DEPTH * 4;
    let payload = format!("{}{}", "<a>".repeat(depth), "</a>".repeat(depth));
    let err = h
        .service
        .submit(&User::new("u1"), RequestType::Mint, mint_attrs(), payload.as_bytes(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, IgsnError::ValidationFailed(_)), "{err}");
}

#[tokio::test]
async fn update_of_unknown_identifier_fails() {
    let h = harness();
    let report = h
        .run(RequestType::Update, mint_attrs(), single_resource("Core A").as_bytes())
        .await;
    assert_eq!(report.request.status, RequestStatus::Failed);
    assert!(report.outcomes[0]
        .error
        .as_deref()
        .unwrap()
        .contains("identifier not found"));
}

// ── Retries ────────────────────────────────────────────────────

#[tokio::test]
async fn transient_registrar_failures_are_retried() {
    let h = harness_with(ScriptedRegistrar::failing(2));
    let report = h
        .run(RequestType::Mint, mint_attrs(), single_resource("Core A").as_bytes())
        .await;

    assert_eq!(report.request.status, RequestStatus::Completed, "{report:?}");
    assert_eq!(h.registrar.calls.load(Ordering::SeqCst), 3);
    let log = h.service.audit().read(report.request.id).await.unwrap();
    assert!(log.contains("attempt 1 failed, retrying"));
    assert!(log.contains("attempt 2 failed, retrying"));
}

#[tokio::test]
async fn exhausted_retries_fail_the_identifier() {
    let h = harness_with(ScriptedRegistrar::failing(u32::MAX));
    let report = h
        .run(RequestType::Mint, mint_attrs(), single_resource("Core A").as_bytes())
        .await;

    assert_eq!(report.request.status, RequestStatus::Failed);
    assert_eq!(h.registrar.calls.load(Ordering::SeqCst), 3);
    let error = report.outcomes[0].error.clone().unwrap();
    assert!(error.contains("timed out"), "{error}");
    assert!(error.contains("after 3 attempts"), "{error}");
    assert_eq!(h.status_of("10273/XXAA010").await, Some(IdentifierStatus::Pending));

    let log = h.service.audit().read(report.request.id).await.unwrap();
    assert!(log.contains("10273/XXAA010 failed"));
    assert!(log.contains("Job finished: FAILED"));
}

// ── Request lifecycle ──────────────────────────────────────────

#[tokio::test]
async fn terminal_requests_reject_new_batches() {
    let h = harness();
    let report = h.run(RequestType::Reserve, attrs(&[]), b"10273/XXAA960\n").await;
    assert!(report.request.status.is_terminal());

    let err = h
        .service
        .enqueue_batch(report.request.id, b"10273/XXAA961\n")
        .await
        .unwrap_err();
    assert!(matches!(err, IgsnError::Conflict(_)));
    let status = h.service.get_request_status(report.request.id).await.unwrap();
    assert_eq!(status.request.status, RequestStatus::Completed);
}

#[tokio::test]
async fn manual_requests_return_terminal() {
    let h = harness();
    let request = h
        .service
        .submit(
            &User::new("u1"),
            RequestType::Reserve,
            attrs(&[]),
            b"10273/XXAA970\n10273/XXAA971\n",
            true,
        )
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Completed);
}

#[tokio::test]
async fn unknown_allocation_is_not_found() {
    let h = harness();
    let mut attrs = attrs(&[]);
    attrs.insert(attributes::ALLOCATION_ID.to_string(), "nope".to_string());
    let err = h
        .service
        .submit(&User::new("u1"), RequestType::Reserve, attrs, b"10273/XXAA1\n", false)
        .await
        .unwrap_err();
    assert!(matches!(err, IgsnError::NotFound { kind: "allocation", .. }));
}

#[tokio::test]
async fn permission_policy_gates_request_creation() {
    let dir = TempDir::new().unwrap();
    let service = IgsnService::start(
        config(&dir),
        ServiceDeps {
            store: Arc::new(MemoryStore::new()),
            registrars: Arc::new(ScriptedFactory(Arc::new(ScriptedRegistrar::default()))),
            access: Arc::new(PermissionListPolicy),
        },
    )
    .unwrap();

    let viewer = User::new("viewer").with_permission(ALLOCATION, [Scope::Update]);
    let err = service
        .create_request(&viewer, RequestType::Reserve, attrs(&[]), false)
        .await
        .unwrap_err();
    assert!(matches!(err, IgsnError::Forbidden(_)));

    let editor = User::new("editor").with_permission(ALLOCATION, [Scope::Create]);
    let request = service
        .create_request(&editor, RequestType::Reserve, attrs(&[]), false)
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Accepted);
}

// ── Content operations ─────────────────────────────────────────

#[tokio::test]
async fn unsupported_schema_is_reported() {
    let h = harness();
    let err = h
        .service
        .submit(
            &User::new("u1"),
            RequestType::Mint,
            attrs(&[(attributes::SCHEMA_ID, "dif-10")]),
            TWO_RESOURCES.as_bytes(),
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IgsnError::SchemaNotSupported(ref id) if id == "dif-10"));

    let err = h.service.validate("dif-10", b"<x/>").unwrap_err();
    assert!(matches!(err, IgsnError::SchemaNotSupported(_)));
    let err = h.service.extract_identifiers("dif-10", b"<x/>").unwrap_err();
    assert!(matches!(err, IgsnError::SchemaNotSupported(_)));
}

#[tokio::test]
async fn transform_is_deterministic_and_output_validates() {
    let h = harness();
    let params = TransformParams {
        registrant_name: Some("ARDC".into()),
        event_type: Some("submitted".into()),
        timestamp: Some(Utc.with_ymd_and_hms(2022, 1, 2, 3, 4, 5).unwrap()),
    };
    let input = single_resource("Core A");

    for target in [REGISTRATION, "oai_dc", "ardc-igsn-jsonld"] {
        let a = h
            .service
            .transform(ARDC, input.as_bytes(), target, &params)
            .unwrap();
        let b = h
            .service
            .transform(ARDC, input.as_bytes(), target, &params)
            .unwrap();
        assert_eq!(a.content, b.content, "{target}");
        assert_eq!(a.hash, b.hash);
        h.service.validate(target, &a.content).unwrap();
    }

    let err = h
        .service
        .transform(ARDC, input.as_bytes(), "igsn-list", &params)
        .unwrap_err();
    assert!(matches!(err, IgsnError::TransformerNotFound { .. }));
}

#[tokio::test]
async fn extract_identifiers_from_document_and_list() {
    let h = harness();
    let values = h
        .service
        .extract_identifiers(ARDC, TWO_RESOURCES.as_bytes())
        .unwrap();
    assert_eq!(values, vec!["10273/XXAA001", "10273/XXAA002"]);

    let values = h
        .service
        .extract_identifiers("igsn-list", b"10273/XXAA1\n\n  10273/XXAA2  \n")
        .unwrap();
    assert_eq!(values, vec!["10273/XXAA1", "10273/XXAA2"]);
}
