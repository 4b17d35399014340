//! Status code registry
//!
//! Translates vendor result codes into a single flat space of internal integer codes that
//! integrators can build against. A pair `(external_system, external_code)` is assigned a
//! code the first time it is seen and keeps it forever. Code `0` belongs to Safaricom's
//! success code and nothing else.

pub mod export;
pub mod memory;
pub mod seed;

use crate::database::error::DatabaseError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Internal code reserved for `(safaricom, "0")`
pub const SUCCESS_INTERNAL_CODE: i64 = 0;
pub const SUCCESS_EXTERNAL_CODE: &str = "0";
pub const SUCCESS_MESSAGE: &str = "Success";
/// Code used when a vendor response carries no code at all
pub const UNKNOWN_EXTERNAL_CODE: &str = "UNKNOWN";

const MAX_ALLOCATION_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalSystem {
    Safaricom,
    Gateway,
}

impl ExternalSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalSystem::Safaricom => "safaricom",
            ExternalSystem::Gateway => "gateway",
        }
    }
}

impl fmt::Display for ExternalSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExternalSystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safaricom" => Ok(ExternalSystem::Safaricom),
            "gateway" => Ok(ExternalSystem::Gateway),
            other => Err(format!("unknown external system: {}", other)),
        }
    }
}

/// One row of the translation table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCodeMapping {
    pub external_system: ExternalSystem,
    pub external_code: String,
    pub internal_code: i64,
    pub default_message: String,
    pub is_success: bool,
}

/// Insert request handed to [`StatusCodeStore::allocate`]
#[derive(Debug, Clone)]
pub struct NewStatusCode {
    pub external_system: ExternalSystem,
    pub external_code: String,
    pub default_message: String,
    pub is_success: bool,
}

impl NewStatusCode {
    pub fn is_success_pair(&self) -> bool {
        is_success_pair(self.external_system, &self.external_code)
    }
}

/// What callers get back from [`StatusRegistry::map`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappedStatus {
    pub status_code: i64,
    pub status_message: String,
    pub external_system: ExternalSystem,
    pub external_code: String,
    pub is_success: bool,
}

pub fn is_success_pair(system: ExternalSystem, code: &str) -> bool {
    system == ExternalSystem::Safaricom && code == SUCCESS_EXTERNAL_CODE
}

/// Durable storage for the mapping table.
///
/// `allocate` is the only write on the hot path and must run as one atomic unit:
/// ensure the success row exists, re-check the requested pair, then insert it with code
/// `0` (success pair) or `max(internal_code) + 1`. Two concurrent `allocate` calls must
/// never observe the same maximum. A lost insert race may surface as a unique violation;
/// the registry recovers from that by re-reading.
#[async_trait]
pub trait StatusCodeStore: Send + Sync {
    async fn find(
        &self,
        system: ExternalSystem,
        code: &str,
    ) -> Result<Option<StatusCodeMapping>, DatabaseError>;

    async fn allocate(&self, request: NewStatusCode) -> Result<StatusCodeMapping, DatabaseError>;

    /// All rows ordered by `internal_code`
    async fn list(&self) -> Result<Vec<StatusCodeMapping>, DatabaseError>;

    /// Insert or overwrite a row with an explicit internal code. Returns `true` when created.
    async fn upsert_exact(&self, mapping: StatusCodeMapping) -> Result<bool, DatabaseError>;

    /// Sets message and success flag only where the stored message is empty.
    /// Returns `true` when a row changed.
    async fn backfill_message(
        &self,
        system: ExternalSystem,
        code: &str,
        message: &str,
        is_success: bool,
    ) -> Result<bool, DatabaseError>;

    /// Removes every row of one system. Only used by deterministic re-seeding.
    async fn delete_system(&self, system: ExternalSystem) -> Result<u64, DatabaseError>;
}

/// Anything carrying a denormalized `internal_status_code` / `internal_status_message`
/// pair, typically a ledger row.
pub trait StatusTarget {
    fn set_internal_status(&mut self, code: i64, message: String);
}

#[derive(Clone)]
pub struct StatusRegistry {
    store: Arc<dyn StatusCodeStore>,
}

impl StatusRegistry {
    pub fn new(store: Arc<dyn StatusCodeStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StatusCodeStore> {
        &self.store
    }

    /// Resolve `(system, code)` to its internal code, allocating one on first sight.
    ///
    /// Message precedence: stored default message, then `default_message`, then
    /// `external_message`, then empty.
    pub async fn map(
        &self,
        external_system: ExternalSystem,
        external_code: &str,
        external_message: Option<&str>,
        default_message: Option<&str>,
    ) -> Result<MappedStatus, DatabaseError> {
        let (system, code) = normalize_code(external_system, external_code);
        let message = external_message.map(str::trim).unwrap_or_default();
        let override_message = default_message.map(str::trim).unwrap_or_default();

        if let Some(existing) = self.store.find(system, &code).await? {
            return Ok(resolve_existing(existing, override_message, message));
        }

        let success = is_success_pair(system, &code);
        let mut stored_message = if override_message.is_empty() {
            message.to_string()
        } else {
            override_message.to_string()
        };
        if success && stored_message.is_empty() {
            stored_message = SUCCESS_MESSAGE.to_string();
        }

        let request = NewStatusCode {
            external_system: system,
            external_code: code.clone(),
            default_message: stored_message,
            is_success: success,
        };

        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            match self.store.allocate(request.clone()).await {
                Ok(mapping) => {
                    debug!(
                        external_system = %system,
                        external_code = %code,
                        internal_code = mapping.internal_code,
                        "status code resolved on allocation path"
                    );
                    // A concurrent allocator may have won with its own message; the stored
                    // one still takes precedence.
                    return Ok(resolve_existing(mapping, override_message, message));
                }
                Err(e) if e.is_unique_violation() => {
                    warn!(
                        external_system = %system,
                        external_code = %code,
                        attempt,
                        "lost status code allocation race, re-reading"
                    );
                    if let Some(existing) = self.store.find(system, &code).await? {
                        return Ok(resolve_existing(existing, override_message, message));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // Every attempt collided without the row becoming visible; a final read decides.
        match self.store.find(system, &code).await? {
            Some(existing) => Ok(resolve_existing(existing, override_message, message)),
            None => Err(DatabaseError::new(
                crate::database::error::DatabaseErrorKind::Unknown {
                    message: format!(
                        "could not allocate internal status code for {}:{}",
                        system, code
                    ),
                },
            )),
        }
    }

    /// Shorthand for Safaricom codes
    pub async fn map_vendor_status(
        &self,
        code: &str,
        message: Option<&str>,
    ) -> Result<MappedStatus, DatabaseError> {
        self.map(ExternalSystem::Safaricom, code, message, None).await
    }

    /// Map and write the result onto `target`
    pub async fn apply<T: StatusTarget + ?Sized>(
        &self,
        target: &mut T,
        external_system: ExternalSystem,
        external_code: &str,
        external_message: Option<&str>,
    ) -> Result<MappedStatus, DatabaseError> {
        let mapped = self
            .map(external_system, external_code, external_message, None)
            .await?;
        target.set_internal_status(mapped.status_code, mapped.status_message.clone());
        Ok(mapped)
    }

    pub async fn list(&self) -> Result<Vec<StatusCodeMapping>, DatabaseError> {
        self.store.list().await
    }

    /// Makes sure the success row exists; called once at startup.
    pub async fn ensure_success_mapping(&self) -> Result<MappedStatus, DatabaseError> {
        let mapped = self.map_vendor_status(SUCCESS_EXTERNAL_CODE, None).await?;
        info!(
            internal_code = mapped.status_code,
            "success status mapping present"
        );
        Ok(mapped)
    }
}

/// Trim the code; an empty code becomes `(gateway, "UNKNOWN")`
pub fn normalize_code(system: ExternalSystem, code: &str) -> (ExternalSystem, String) {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        (ExternalSystem::Gateway, UNKNOWN_EXTERNAL_CODE.to_string())
    } else {
        (system, trimmed.to_string())
    }
}

/// Vendor payloads carry result codes as numbers or strings
pub fn code_from_json(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn resolve_existing(
    mapping: StatusCodeMapping,
    override_message: &str,
    external_message: &str,
) -> MappedStatus {
    let stored = mapping.default_message.trim();
    let status_message = if !stored.is_empty() {
        stored.to_string()
    } else if !override_message.is_empty() {
        override_message.to_string()
    } else {
        external_message.to_string()
    };

    MappedStatus {
        status_code: mapping.internal_code,
        status_message,
        external_system: mapping.external_system,
        external_code: mapping.external_code,
        is_success: mapping.is_success,
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryStatusCodeStore;
    use super::*;
    use serde_json::json;

    fn registry() -> StatusRegistry {
        StatusRegistry::new(Arc::new(InMemoryStatusCodeStore::new()))
    }

    #[test]
    fn empty_code_normalizes_to_gateway_unknown() {
        assert_eq!(
            normalize_code(ExternalSystem::Safaricom, "   "),
            (ExternalSystem::Gateway, "UNKNOWN".to_string())
        );
        assert_eq!(
            normalize_code(ExternalSystem::Safaricom, " 1032 "),
            (ExternalSystem::Safaricom, "1032".to_string())
        );
    }

    #[test]
    fn json_codes_are_stringified() {
        assert_eq!(code_from_json(Some(&json!(0))), Some("0".to_string()));
        assert_eq!(code_from_json(Some(&json!(" 1032 "))), Some("1032".to_string()));
        assert_eq!(code_from_json(Some(&json!(""))), None);
        assert_eq!(code_from_json(Some(&json!(null))), None);
        assert_eq!(code_from_json(None), None);
    }

    #[tokio::test]
    async fn first_non_success_code_never_takes_zero() {
        let registry = registry();

        let mapped = registry.map_vendor_status("1032", Some("Cancelled")).await.unwrap();
        assert_eq!(mapped.status_code, 1);
        assert!(!mapped.is_success);

        let success = registry.map_vendor_status("0", None).await.unwrap();
        assert_eq!(success.status_code, 0);
        assert!(success.is_success);
        assert_eq!(success.status_message, "Success");
    }

    #[tokio::test]
    async fn override_message_is_stored_on_creation() {
        let registry = registry();

        let mapped = registry
            .map(
                ExternalSystem::Gateway,
                "HTTP_502",
                Some("Bad Gateway"),
                Some("Upstream unavailable"),
            )
            .await
            .unwrap();
        assert_eq!(mapped.status_message, "Upstream unavailable");

        let again = registry
            .map(ExternalSystem::Gateway, "HTTP_502", Some("other"), None)
            .await
            .unwrap();
        assert_eq!(again.status_code, mapped.status_code);
        assert_eq!(again.status_message, "Upstream unavailable");
    }

    #[tokio::test]
    async fn empty_code_maps_to_gateway_unknown_row() {
        let registry = registry();

        let mapped = registry.map_vendor_status("", Some("no code")).await.unwrap();
        assert_eq!(mapped.external_system, ExternalSystem::Gateway);
        assert_eq!(mapped.external_code, "UNKNOWN");
        assert_eq!(mapped.status_code, 1);
    }

    struct Row {
        code: Option<i64>,
        message: Option<String>,
    }

    impl StatusTarget for Row {
        fn set_internal_status(&mut self, code: i64, message: String) {
            self.code = Some(code);
            self.message = Some(message);
        }
    }

    #[tokio::test]
    async fn apply_writes_onto_target() {
        let registry = registry();
        let mut row = Row {
            code: None,
            message: None,
        };

        let mapped = registry
            .apply(&mut row, ExternalSystem::Safaricom, "2001", Some("Wrong PIN"))
            .await
            .unwrap();

        assert_eq!(row.code, Some(mapped.status_code));
        assert_eq!(row.message.as_deref(), Some("Wrong PIN"));
    }
}
