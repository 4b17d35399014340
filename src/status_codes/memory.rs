//! In-process [`StatusCodeStore`] for tests and local runs without Postgres.
//!
//! A single mutex plays the role of the allocation lock, so `allocate` has the same
//! atomicity as the Postgres transaction.

use super::{
    is_success_pair, ExternalSystem, NewStatusCode, StatusCodeMapping, StatusCodeStore,
    SUCCESS_EXTERNAL_CODE, SUCCESS_INTERNAL_CODE, SUCCESS_MESSAGE,
};
use crate::database::error::{DatabaseError, DatabaseErrorKind};
use async_trait::async_trait;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct InMemoryStatusCodeStore {
    rows: Mutex<Vec<StatusCodeMapping>>,
}

impl InMemoryStatusCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<StatusCodeMapping>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }
}

fn success_row() -> StatusCodeMapping {
    StatusCodeMapping {
        external_system: ExternalSystem::Safaricom,
        external_code: SUCCESS_EXTERNAL_CODE.to_string(),
        internal_code: SUCCESS_INTERNAL_CODE,
        default_message: SUCCESS_MESSAGE.to_string(),
        is_success: true,
    }
}

fn unique_violation(constraint: &str) -> DatabaseError {
    DatabaseError::new(DatabaseErrorKind::UniqueViolation {
        constraint: constraint.to_string(),
    })
}

#[async_trait]
impl StatusCodeStore for InMemoryStatusCodeStore {
    async fn find(
        &self,
        system: ExternalSystem,
        code: &str,
    ) -> Result<Option<StatusCodeMapping>, DatabaseError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .find(|r| r.external_system == system && r.external_code == code)
            .cloned())
    }

    async fn allocate(&self, request: NewStatusCode) -> Result<StatusCodeMapping, DatabaseError> {
        let mut rows = self.rows.lock().await;

        let zero_taken = rows.iter().any(|r| r.internal_code == SUCCESS_INTERNAL_CODE);
        let success_present = rows
            .iter()
            .any(|r| is_success_pair(r.external_system, &r.external_code));
        if !zero_taken && !success_present {
            rows.push(success_row());
        }

        if let Some(existing) = rows.iter().find(|r| {
            r.external_system == request.external_system && r.external_code == request.external_code
        }) {
            return Ok(existing.clone());
        }

        let internal_code = if request.is_success_pair() {
            SUCCESS_INTERNAL_CODE
        } else {
            rows.iter().map(|r| r.internal_code).max().unwrap_or(0) + 1
        };
        if rows.iter().any(|r| r.internal_code == internal_code) {
            return Err(unique_violation("status_code_mappings_internal_code_key"));
        }

        let row = StatusCodeMapping {
            external_system: request.external_system,
            external_code: request.external_code,
            internal_code,
            default_message: request.default_message,
            is_success: request.is_success,
        };
        rows.push(row.clone());
        Ok(row)
    }

    async fn list(&self) -> Result<Vec<StatusCodeMapping>, DatabaseError> {
        let mut rows = self.rows.lock().await.clone();
        rows.sort_by_key(|r| r.internal_code);
        Ok(rows)
    }

    async fn upsert_exact(&self, mapping: StatusCodeMapping) -> Result<bool, DatabaseError> {
        let mut rows = self.rows.lock().await;

        if rows.iter().any(|r| {
            r.internal_code == mapping.internal_code
                && !(r.external_system == mapping.external_system
                    && r.external_code == mapping.external_code)
        }) {
            return Err(unique_violation("status_code_mappings_internal_code_key"));
        }

        match rows.iter_mut().find(|r| {
            r.external_system == mapping.external_system && r.external_code == mapping.external_code
        }) {
            Some(existing) => {
                *existing = mapping;
                Ok(false)
            }
            None => {
                rows.push(mapping);
                Ok(true)
            }
        }
    }

    async fn backfill_message(
        &self,
        system: ExternalSystem,
        code: &str,
        message: &str,
        is_success: bool,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self.rows.lock().await;
        match rows
            .iter_mut()
            .find(|r| r.external_system == system && r.external_code == code)
        {
            Some(row) if row.default_message.trim().is_empty() && !message.trim().is_empty() => {
                row.default_message = message.trim().to_string();
                row.is_success = is_success;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_system(&self, system: ExternalSystem) -> Result<u64, DatabaseError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|r| r.external_system != system);
        Ok((before - rows.len()) as u64)
    }
}
