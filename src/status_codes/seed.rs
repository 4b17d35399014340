//! Seeding the mapping table from a version-controlled list of Safaricom codes.

use super::{
    ExternalSystem, NewStatusCode, StatusCodeMapping, StatusCodeStore, SUCCESS_EXTERNAL_CODE,
    SUCCESS_INTERNAL_CODE, SUCCESS_MESSAGE,
};
use crate::database::error::DatabaseError;
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Seed list shipped with the crate
pub const DEFAULT_SEED_PATH: &str = "data/safaricom_codes.json";

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("Seed file not found: {0}")]
    NotFound(String),

    #[error("Failed to read seed file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Seed JSON must be a list of objects")]
    NotAList,

    #[error("Invalid seed JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SeedEntry {
    pub external_code: String,
    #[serde(default)]
    pub default_message: String,
    #[serde(default)]
    pub is_success: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub created: usize,
    pub updated: usize,
}

/// Parse seed JSON, skipping non-object items and entries without a code
pub fn parse_seed(json: &str) -> Result<Vec<SeedEntry>, SeedError> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let items = value.as_array().ok_or(SeedError::NotAList)?;

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let code = super::code_from_json(obj.get("external_code")).unwrap_or_default();
        if code.is_empty() {
            continue;
        }
        entries.push(SeedEntry {
            external_code: code,
            default_message: obj
                .get("default_message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            is_success: obj
                .get("is_success")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        });
    }
    Ok(entries)
}

pub fn load_seed_file(path: &Path) -> Result<Vec<SeedEntry>, SeedError> {
    if !path.exists() {
        return Err(SeedError::NotFound(path.display().to_string()));
    }
    let raw = std::fs::read_to_string(path)?;
    parse_seed(&raw)
}

/// Sort key: plain and dotted numeric codes first (by numeric tuple), then everything
/// else lexicographically, then empty codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeSortKey {
    Numeric(Vec<u64>),
    Text(String),
    Empty,
}

impl CodeSortKey {
    fn rank(&self) -> u8 {
        match self {
            CodeSortKey::Numeric(_) => 0,
            CodeSortKey::Text(_) => 1,
            CodeSortKey::Empty => 2,
        }
    }
}

impl Ord for CodeSortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (CodeSortKey::Numeric(a), CodeSortKey::Numeric(b)) => a.cmp(b),
            (CodeSortKey::Text(a), CodeSortKey::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for CodeSortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub fn code_sort_key(code: &str) -> CodeSortKey {
    let raw = code.trim();
    if raw.is_empty() {
        return CodeSortKey::Empty;
    }

    let parts: Vec<&str> = raw.split('.').collect();
    let all_numeric = parts
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if all_numeric {
        let parsed: Option<Vec<u64>> = parts.iter().map(|p| p.parse().ok()).collect();
        if let Some(numbers) = parsed {
            return CodeSortKey::Numeric(numbers);
        }
    }

    CodeSortKey::Text(raw.to_string())
}

/// Deduplicate by code (preferring a non-empty message) and order by [`code_sort_key`].
/// The success code is dropped; it is always seeded separately as internal code 0.
pub fn normalize_entries(entries: Vec<SeedEntry>) -> Vec<SeedEntry> {
    let mut by_code: BTreeMap<String, SeedEntry> = BTreeMap::new();
    for entry in entries {
        if entry.external_code == SUCCESS_EXTERNAL_CODE {
            continue;
        }
        match by_code.get(&entry.external_code) {
            None => {
                by_code.insert(entry.external_code.clone(), entry);
            }
            Some(existing)
                if existing.default_message.trim().is_empty()
                    && !entry.default_message.trim().is_empty() =>
            {
                by_code.insert(entry.external_code.clone(), entry);
            }
            Some(_) => {}
        }
    }

    let mut sorted: Vec<SeedEntry> = by_code.into_values().collect();
    sorted.sort_by(|a, b| code_sort_key(&a.external_code).cmp(&code_sort_key(&b.external_code)));
    sorted
}

/// Seed Safaricom mappings.
///
/// With `reset`, existing Safaricom rows are removed and codes are assigned
/// deterministically from 1 in sort order, skipping codes still held by gateway rows.
/// Without it, existing codes are preserved: empty messages are backfilled and unseen
/// codes are appended after the current maximum.
pub async fn seed(
    store: &dyn StatusCodeStore,
    entries: Vec<SeedEntry>,
    reset: bool,
) -> Result<SeedReport, SeedError> {
    let entries = normalize_entries(entries);
    let mut report = SeedReport::default();

    if reset {
        let removed = store.delete_system(ExternalSystem::Safaricom).await?;
        info!(removed, "Removed existing safaricom mappings before reseed");
    }

    store
        .upsert_exact(StatusCodeMapping {
            external_system: ExternalSystem::Safaricom,
            external_code: SUCCESS_EXTERNAL_CODE.to_string(),
            internal_code: SUCCESS_INTERNAL_CODE,
            default_message: SUCCESS_MESSAGE.to_string(),
            is_success: true,
        })
        .await?;

    if reset {
        let taken: HashSet<i64> = store
            .list()
            .await?
            .into_iter()
            .filter(|r| r.external_system != ExternalSystem::Safaricom)
            .map(|r| r.internal_code)
            .collect();

        let mut next_internal = 1;
        for entry in entries {
            while taken.contains(&next_internal) {
                next_internal += 1;
            }
            let created = store
                .upsert_exact(StatusCodeMapping {
                    external_system: ExternalSystem::Safaricom,
                    external_code: entry.external_code,
                    internal_code: next_internal,
                    default_message: entry.default_message,
                    is_success: entry.is_success,
                })
                .await?;
            if created {
                report.created += 1;
            } else {
                report.updated += 1;
            }
            next_internal += 1;
        }
    } else {
        for entry in entries {
            if store
                .find(ExternalSystem::Safaricom, &entry.external_code)
                .await?
                .is_some()
            {
                if store
                    .backfill_message(
                        ExternalSystem::Safaricom,
                        &entry.external_code,
                        &entry.default_message,
                        entry.is_success,
                    )
                    .await?
                {
                    report.updated += 1;
                }
                continue;
            }

            store
                .allocate(NewStatusCode {
                    external_system: ExternalSystem::Safaricom,
                    external_code: entry.external_code,
                    default_message: entry.default_message,
                    is_success: entry.is_success,
                })
                .await?;
            report.created += 1;
        }
    }

    info!(
        created = report.created,
        updated = report.updated,
        "Seeded safaricom mappings"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_codes::memory::InMemoryStatusCodeStore;

    fn entry(code: &str, msg: &str) -> SeedEntry {
        SeedEntry {
            external_code: code.to_string(),
            default_message: msg.to_string(),
            is_success: false,
        }
    }

    #[test]
    fn sort_key_orders_numeric_dotted_then_text() {
        let mut codes = vec!["SFC_IC0003", "400.003.01", "1032", "17", "400.002.02", "2001"];
        codes.sort_by(|a, b| code_sort_key(a).cmp(&code_sort_key(b)));
        assert_eq!(
            codes,
            vec!["17", "400.002.02", "400.003.01", "1032", "2001", "SFC_IC0003"]
        );
    }

    #[test]
    fn parse_skips_invalid_items() {
        let entries = parse_seed(
            r#"[{"external_code": "1032", "default_message": "Cancelled"},
                "junk",
                {"external_code": ""},
                {"external_code": 2001, "is_success": false}]"#,
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].external_code, "2001");
    }

    #[test]
    fn parse_rejects_non_list() {
        assert!(matches!(parse_seed(r#"{"a": 1}"#), Err(SeedError::NotAList)));
    }

    #[test]
    fn dedupe_prefers_non_empty_message() {
        let entries = normalize_entries(vec![
            entry("1032", ""),
            entry("1032", "Request cancelled by user"),
            entry("0", "ignored"),
        ]);
        assert_eq!(entries, vec![entry("1032", "Request cancelled by user")]);
    }

    #[tokio::test]
    async fn reset_assigns_deterministic_codes() {
        let store = InMemoryStatusCodeStore::new();
        store
            .allocate(NewStatusCode {
                external_system: ExternalSystem::Safaricom,
                external_code: "9999".to_string(),
                default_message: String::new(),
                is_success: false,
            })
            .await
            .unwrap();

        let report = seed(
            &store,
            vec![entry("2001", "Wrong PIN"), entry("1032", "Cancelled")],
            true,
        )
        .await
        .unwrap();
        assert_eq!(report.created, 2);

        let rows = store.list().await.unwrap();
        let codes: Vec<(String, i64)> = rows
            .iter()
            .map(|r| (r.external_code.clone(), r.internal_code))
            .collect();
        assert_eq!(
            codes,
            vec![
                ("0".to_string(), 0),
                ("1032".to_string(), 1),
                ("2001".to_string(), 2)
            ]
        );
    }

    #[tokio::test]
    async fn incremental_seed_appends_and_backfills() {
        let store = InMemoryStatusCodeStore::new();
        store
            .allocate(NewStatusCode {
                external_system: ExternalSystem::Safaricom,
                external_code: "1032".to_string(),
                default_message: String::new(),
                is_success: false,
            })
            .await
            .unwrap();

        let report = seed(
            &store,
            vec![entry("1032", "Cancelled by user"), entry("1037", "Timeout")],
            false,
        )
        .await
        .unwrap();
        assert_eq!(report, SeedReport { created: 1, updated: 1 });

        let cancelled = store
            .find(ExternalSystem::Safaricom, "1032")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.internal_code, 1);
        assert_eq!(cancelled.default_message, "Cancelled by user");

        let timeout = store
            .find(ExternalSystem::Safaricom, "1037")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(timeout.internal_code, 2);
    }
}
