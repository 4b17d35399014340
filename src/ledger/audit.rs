//! Append-only log of every callback delivery, matched or not

use super::SettleOutcome;
use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const DEFAULT_LIST_LIMIT: i64 = 200;
pub const MAX_LIST_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    Applied,
    IgnoredTerminal,
    Unmatched,
}

impl CallbackOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackOutcome::Applied => "applied",
            CallbackOutcome::IgnoredTerminal => "ignored_terminal",
            CallbackOutcome::Unmatched => "unmatched",
        }
    }
}

impl From<&SettleOutcome> for CallbackOutcome {
    fn from(outcome: &SettleOutcome) -> Self {
        match outcome {
            SettleOutcome::Applied(_) => CallbackOutcome::Applied,
            SettleOutcome::IgnoredTerminal(_) => CallbackOutcome::IgnoredTerminal,
            SettleOutcome::Unmatched => CallbackOutcome::Unmatched,
        }
    }
}

impl fmt::Display for CallbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallbackOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(CallbackOutcome::Applied),
            "ignored_terminal" => Ok(CallbackOutcome::IgnoredTerminal),
            "unmatched" => Ok(CallbackOutcome::Unmatched),
            other => Err(format!("unknown callback outcome: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewCallbackLog {
    pub kind: String,
    pub correlation_id: Option<String>,
    pub ledger_id: Option<Uuid>,
    pub outcome: CallbackOutcome,
    pub result_code: Option<String>,
    pub result_desc: Option<String>,
    pub content: JsonValue,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackLogEntry {
    pub id: i64,
    pub kind: String,
    pub correlation_id: Option<String>,
    pub ledger_id: Option<Uuid>,
    pub outcome: CallbackOutcome,
    pub result_code: Option<String>,
    pub result_desc: Option<String>,
    pub content: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// `limit` query parameter: default 200, at most 1000; junk falls back to the default
pub fn clamp_limit(raw: Option<&str>) -> i64 {
    match raw.and_then(|v| v.trim().parse::<i64>().ok()) {
        Some(limit) if limit > 0 => limit.min(MAX_LIST_LIMIT),
        _ => DEFAULT_LIST_LIMIT,
    }
}

#[async_trait]
pub trait CallbackLogStore: Send + Sync {
    async fn record(&self, entry: NewCallbackLog) -> Result<CallbackLogEntry, DatabaseError>;

    /// Most recent first
    async fn list(&self, limit: i64) -> Result<Vec<CallbackLogEntry>, DatabaseError>;
}

#[derive(Default)]
pub struct InMemoryCallbackLog {
    entries: Mutex<Vec<CallbackLogEntry>>,
}

impl InMemoryCallbackLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallbackLogStore for InMemoryCallbackLog {
    async fn record(&self, entry: NewCallbackLog) -> Result<CallbackLogEntry, DatabaseError> {
        let mut entries = self.entries.lock().await;
        let logged = CallbackLogEntry {
            id: entries.len() as i64 + 1,
            kind: entry.kind,
            correlation_id: entry.correlation_id,
            ledger_id: entry.ledger_id,
            outcome: entry.outcome,
            result_code: entry.result_code,
            result_desc: entry.result_desc,
            content: entry.content,
            created_at: Utc::now(),
        };
        entries.push(logged.clone());
        Ok(logged)
    }

    async fn list(&self, limit: i64) -> Result<Vec<CallbackLogEntry>, DatabaseError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn limit_parsing() {
        assert_eq!(clamp_limit(None), 200);
        assert_eq!(clamp_limit(Some("25")), 25);
        assert_eq!(clamp_limit(Some("5000")), 1000);
        assert_eq!(clamp_limit(Some("0")), 200);
        assert_eq!(clamp_limit(Some("-3")), 200);
        assert_eq!(clamp_limit(Some("abc")), 200);
    }

    #[tokio::test]
    async fn entries_list_newest_first() {
        let log = InMemoryCallbackLog::new();
        for outcome in [CallbackOutcome::Applied, CallbackOutcome::IgnoredTerminal] {
            log.record(NewCallbackLog {
                kind: "stk".to_string(),
                correlation_id: Some("ws_CO_1".to_string()),
                ledger_id: None,
                outcome,
                result_code: Some("0".to_string()),
                result_desc: None,
                content: json!({}),
            })
            .await
            .unwrap();
        }

        let listed = log.list(10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].outcome, CallbackOutcome::IgnoredTerminal);
        assert_eq!(log.list(1).await.unwrap().len(), 1);
    }
}
