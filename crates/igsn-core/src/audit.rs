//! Per-request audit log.
//!
//! Each request gets an append-only log file at
//! `{requests_dir}/{request_id}/request.log`. The sink is opened when the
//! request starts running and closed exactly once at finalization. Every
//! line is mirrored to `tracing`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::Result;

pub const LOG_FILE_NAME: &str = "request.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

pub struct AuditLogger {
    requests_dir: PathBuf,
    sinks: Mutex<HashMap<Uuid, File>>,
}

impl AuditLogger {
    pub fn new(requests_dir: impl Into<PathBuf>) -> Self {
        Self {
            requests_dir: requests_dir.into(),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    pub fn log_path(&self, request_id: Uuid) -> PathBuf {
        self.requests_dir
            .join(request_id.to_string())
            .join(LOG_FILE_NAME)
    }

    /// Open the sink for `request_id`. Opening an open sink is a no-op.
    pub async fn open(&self, request_id: Uuid) -> Result<PathBuf> {
        let path = self.log_path(request_id);
        let mut sinks = self.sinks.lock().await;
        if sinks.contains_key(&request_id) {
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        sinks.insert(request_id, file);
        Ok(path)
    }

    pub async fn info(&self, request_id: Uuid, message: &str) {
        self.log(request_id, AuditLevel::Info, message).await;
    }

    pub async fn warn(&self, request_id: Uuid, message: &str) {
        self.log(request_id, AuditLevel::Warn, message).await;
    }

    pub async fn error(&self, request_id: Uuid, message: &str) {
        self.log(request_id, AuditLevel::Error, message).await;
    }

    /// Append one line. Write failures are reported through `tracing` only;
    /// the audit trail never fails the pipeline.
    pub async fn log(&self, request_id: Uuid, level: AuditLevel, message: &str) {
        match level {
            AuditLevel::Info => info!(request_id = %request_id, "{message}"),
            AuditLevel::Warn => warn!(request_id = %request_id, "{message}"),
            AuditLevel::Error => error!(request_id = %request_id, "{message}"),
        }

        let line = format!(
            "{} [{}] {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level.as_str(),
            message
        );
        let mut sinks = self.sinks.lock().await;
        let Some(file) = sinks.get_mut(&request_id) else {
            warn!(request_id = %request_id, "Audit sink is not open; line kept in tracing only");
            return;
        };
        if let Err(e) = write_line(file, &line).await {
            error!(request_id = %request_id, error = %e, "Failed to write audit log");
        }
    }

    /// Flush and drop the sink. Returns `false` if it was not open.
    pub async fn close(&self, request_id: Uuid) -> bool {
        let Some(mut file) = self.sinks.lock().await.remove(&request_id) else {
            return false;
        };
        if let Err(e) = file.flush().await {
            error!(request_id = %request_id, error = %e, "Failed to flush audit log");
        }
        true
    }

    pub async fn is_open(&self, request_id: Uuid) -> bool {
        self.sinks.lock().await.contains_key(&request_id)
    }

    pub async fn read(&self, request_id: Uuid) -> Result<String> {
        Ok(fs::read_to_string(self.log_path(request_id)).await?)
    }

    pub fn requests_dir(&self) -> &Path {
        &self.requests_dir
    }
}

async fn write_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}
