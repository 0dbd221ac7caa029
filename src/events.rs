//! Audit sink for prompts sent upstream.
//!
//! Recording is fire-and-forget from the relay's point of view: the relay
//! spawns the call and only logs a failure.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::identity::CallerIdentity;

const CLEAN_PROMPT_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct PromptRecord {
    pub request_id: String,
    pub user_id: String,
    pub email: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
    pub prompt: String,
    pub clean_prompt: String,
    pub timestamp: DateTime<Utc>,
}

impl PromptRecord {
    pub fn new(request_id: &str, identity: CallerIdentity, user_text: &str, prompt: String) -> Self {
        Self {
            request_id: request_id.to_string(),
            user_id: identity.user_id,
            email: identity.email,
            ip_address: identity.ip_address,
            user_agent: identity.user_agent,
            prompt,
            clean_prompt: user_text.trim().chars().take(CLEAN_PROMPT_LIMIT).collect(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to write audit record: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode audit record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait EventLogger: Send + Sync {
    async fn record_prompt(&self, record: PromptRecord) -> Result<(), LogError>;
}

/// Writes audit records to the `audit` tracing target.
#[derive(Debug, Default)]
pub struct TracingEventLogger;

#[async_trait]
impl EventLogger for TracingEventLogger {
    async fn record_prompt(&self, record: PromptRecord) -> Result<(), LogError> {
        tracing::info!(
            target: "audit",
            request_id = %record.request_id,
            user_id = %record.user_id,
            ip = %record.ip_address,
            prompt_chars = record.prompt.chars().count(),
            clean_prompt = %record.clean_prompt,
            "prompt recorded"
        );
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlEventLogger {
    path: PathBuf,
    // Serializes appends so concurrent records never interleave.
    lock: Mutex<()>,
}

impl JsonlEventLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl EventLogger for JsonlEventLogger {
    async fn record_prompt(&self, record: PromptRecord) -> Result<(), LogError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> CallerIdentity {
        CallerIdentity {
            user_id: "user-1".into(),
            email: Some("finn@example.com".into()),
            ip_address: "1.2.3.4".into(),
            user_agent: "test".into(),
        }
    }

    #[test]
    fn clean_prompt_is_trimmed_and_capped() {
        let long = format!("  {}  ", "a".repeat(800));
        let record = PromptRecord::new("req", identity(), &long, "full".into());
        assert_eq!(record.clean_prompt.len(), CLEAN_PROMPT_LIMIT);
        assert_eq!(record.user_id, "user-1");
        assert_eq!(record.prompt, "full");
    }

    #[tokio::test]
    async fn jsonl_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = JsonlEventLogger::new(&path);

        logger
            .record_prompt(PromptRecord::new("r1", identity(), "one", "p1".into()))
            .await
            .unwrap();
        logger
            .record_prompt(PromptRecord::new("r2", identity(), "two", "p2".into()))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["request_id"], "r1");
        assert_eq!(lines[1]["clean_prompt"], "two");
    }

    #[tokio::test]
    async fn jsonl_logger_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let logger = JsonlEventLogger::new(dir.path().join("missing").join("audit.jsonl"));
        let result = logger
            .record_prompt(PromptRecord::new("r", identity(), "x", "x".into()))
            .await;
        assert!(matches!(result, Err(LogError::Io(_))));
    }
}
