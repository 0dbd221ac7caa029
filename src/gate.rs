use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::identity::{AccessTable, CallerIdentity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl AccessDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("access backend unavailable: {0}")]
    Unavailable(String),
}

/// Decides whether an identified caller may open a generation stream.
#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn authorize(&self, identity: &CallerIdentity) -> Result<AccessDecision, GateError>;
}

/// Gate backed by the `entitled` flag of the access table.
pub struct StaticAccessGate {
    table: Arc<AccessTable>,
}

impl StaticAccessGate {
    pub fn new(table: Arc<AccessTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl AccessGate for StaticAccessGate {
    async fn authorize(&self, identity: &CallerIdentity) -> Result<AccessDecision, GateError> {
        Ok(match self.table.by_user(&identity.user_id) {
            Some(entry) if entry.entitled => AccessDecision::allow(),
            Some(_) => AccessDecision::deny("FINN_KEY not verified"),
            None => AccessDecision::deny("unknown user"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AccessEntry;

    fn identity(user_id: &str) -> CallerIdentity {
        CallerIdentity {
            user_id: user_id.into(),
            email: None,
            ip_address: "unknown".into(),
            user_agent: String::new(),
        }
    }

    #[tokio::test]
    async fn entitlement_drives_decision() {
        let gate = StaticAccessGate::new(Arc::new(AccessTable::new([
            AccessEntry {
                token: "a".into(),
                user_id: "yes".into(),
                email: None,
                entitled: true,
            },
            AccessEntry {
                token: "b".into(),
                user_id: "no".into(),
                email: None,
                entitled: false,
            },
        ])));

        assert!(gate.authorize(&identity("yes")).await.unwrap().allowed);

        let denied = gate.authorize(&identity("no")).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reason.as_deref(), Some("FINN_KEY not verified"));

        assert!(!gate.authorize(&identity("ghost")).await.unwrap().allowed);
    }
}
