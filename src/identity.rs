use std::collections::HashMap;
use std::path::Path;

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// The resolved caller for one request.
///
/// Built once by the HTTP layer and handed by value to every collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerIdentity {
    pub user_id: String,
    pub email: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
}

/// One row of the access table file.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessEntry {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub entitled: bool,
}

/// Bearer tokens known to the relay, keyed by token.
#[derive(Debug, Clone, Default)]
pub struct AccessTable {
    entries: HashMap<String, AccessEntry>,
}

impl AccessTable {
    pub fn new(entries: impl IntoIterator<Item = AccessEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.token.clone(), entry))
                .collect(),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<AccessEntry> = serde_json::from_str(&raw)?;
        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn by_token(&self, token: &str) -> Option<&AccessEntry> {
        self.entries.get(token)
    }

    pub fn by_user(&self, user_id: &str) -> Option<&AccessEntry> {
        self.entries.values().find(|entry| entry.user_id == user_id)
    }

    /// Resolves the bearer credential in `headers` into a caller identity.
    pub fn identify(&self, headers: &HeaderMap) -> Result<CallerIdentity, RelayError> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(RelayError::AuthenticationMissing)?;

        let entry = self
            .by_token(token)
            .ok_or(RelayError::AuthenticationMissing)?;

        Ok(CallerIdentity {
            user_id: entry.user_id.clone(),
            email: entry.email.clone(),
            ip_address: client_ip(headers),
            user_agent: headers
                .get(USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// First `x-forwarded-for` hop, then `x-real-ip`, else `unknown`.
pub fn client_ip(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    if let Some(forwarded) = header("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            return first.trim().to_string();
        }
    }
    header("x-real-ip").unwrap_or("unknown").to_string()
}
