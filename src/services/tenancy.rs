//! Resolves which business a request acts for.
//!
//! An explicit `business_id` wins when the caller may use it. OAuth clients are bound
//! to at most one business: the first explicit id a client uses becomes its binding, and
//! later calls may omit the id. Rebinding is a maintainer action only.

use crate::database::error::DatabaseError;
use crate::error::{AppError, AppErrorKind, DomainError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessStatus {
    Active,
    Suspended,
}

impl BusinessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessStatus::Active => "active",
            BusinessStatus::Suspended => "suspended",
        }
    }
}

impl fmt::Display for BusinessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusinessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(BusinessStatus::Active),
            "suspended" => Ok(BusinessStatus::Suspended),
            other => Err(format!("unknown business status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Business {
    pub id: Uuid,
    pub name: String,
    pub status: BusinessStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Business {
    pub fn is_active(&self) -> bool {
        self.status == BusinessStatus::Active
    }
}

/// Who is calling, as established by the auth guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    OAuthClient { client_id: String },
    /// Holder of the internal API key
    Internal,
}

impl Caller {
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Caller::OAuthClient { client_id } => Some(client_id),
            Caller::Internal => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TenancyError {
    #[error("Invalid business_id")]
    InvalidBusinessId { value: String },

    #[error("business_id is required (or bind your OAuth client to a business)")]
    BusinessRequired,

    #[error("Client is not allowed to access this business")]
    Conflict { client_id: String },

    #[error("Business is suspended")]
    Suspended { business_id: Uuid },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<TenancyError> for AppError {
    fn from(err: TenancyError) -> Self {
        let domain = match err {
            TenancyError::InvalidBusinessId { value } => DomainError::InvalidBusinessId { value },
            TenancyError::BusinessRequired => DomainError::BusinessRequired,
            TenancyError::Conflict { client_id } => DomainError::TenancyConflict { client_id },
            TenancyError::Suspended { business_id } => DomainError::BusinessSuspended {
                business_id: business_id.to_string(),
            },
            TenancyError::Database(db) => return db.into(),
        };
        AppError::new(AppErrorKind::Domain(domain))
    }
}

/// Businesses and OAuth client bindings
#[async_trait]
pub trait TenancyStore: Send + Sync {
    async fn create_business(&self, name: &str) -> Result<Business, DatabaseError>;

    async fn get_business(&self, id: Uuid) -> Result<Option<Business>, DatabaseError>;

    async fn set_business_status(
        &self,
        id: Uuid,
        status: BusinessStatus,
    ) -> Result<Option<Business>, DatabaseError>;

    async fn client_binding(&self, client_id: &str) -> Result<Option<Uuid>, DatabaseError>;

    /// Bind `client_id` unless it is already bound, and return the business it ends up
    /// bound to. Concurrent first binds settle on one winner.
    async fn bind_if_unbound(
        &self,
        client_id: &str,
        business_id: Uuid,
    ) -> Result<Uuid, DatabaseError>;

    /// Unconditional rebind
    async fn set_binding(&self, client_id: &str, business_id: Uuid) -> Result<(), DatabaseError>;

    /// Returns `true` when a binding existed
    async fn remove_binding(&self, client_id: &str) -> Result<bool, DatabaseError>;
}

#[derive(Clone)]
pub struct TenancyResolver {
    store: Arc<dyn TenancyStore>,
}

impl TenancyResolver {
    pub fn new(store: Arc<dyn TenancyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TenancyStore> {
        &self.store
    }

    /// Business the caller acts for. `explicit_business_id` is the raw value from the
    /// request body or query, if any.
    pub async fn resolve(
        &self,
        caller: &Caller,
        explicit_business_id: Option<&str>,
    ) -> Result<Business, TenancyError> {
        let explicit = explicit_business_id
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let business = match explicit {
            Some(raw) => self.resolve_explicit(caller, raw).await?,
            None => self.resolve_implicit(caller).await?,
        };
        ensure_active(&business)?;
        Ok(business)
    }

    async fn resolve_explicit(&self, caller: &Caller, raw: &str) -> Result<Business, TenancyError> {
        let invalid = || TenancyError::InvalidBusinessId {
            value: raw.to_string(),
        };
        let id = Uuid::parse_str(raw).map_err(|_| invalid())?;
        let business = self.store.get_business(id).await?.ok_or_else(invalid)?;

        if let Some(client_id) = caller.client_id() {
            let conflict = || TenancyError::Conflict {
                client_id: client_id.to_string(),
            };
            match self.store.client_binding(client_id).await? {
                Some(bound) if bound != business.id => return Err(conflict()),
                Some(_) => return Ok(business),
                None => {}
            }

            // A suspended business never gains a binding
            ensure_active(&business)?;
            let bound = self.store.bind_if_unbound(client_id, business.id).await?;
            if bound != business.id {
                return Err(conflict());
            }
            debug!(client_id, business_id = %business.id, "client bound on first use");
        }

        Ok(business)
    }

    async fn resolve_implicit(&self, caller: &Caller) -> Result<Business, TenancyError> {
        let Some(client_id) = caller.client_id() else {
            return Err(TenancyError::BusinessRequired);
        };
        let Some(business_id) = self.store.client_binding(client_id).await? else {
            return Err(TenancyError::BusinessRequired);
        };
        self.store
            .get_business(business_id)
            .await?
            .ok_or(TenancyError::BusinessRequired)
    }

    /// Maintainer rebind
    pub async fn rebind(&self, client_id: &str, business_id: Uuid) -> Result<(), TenancyError> {
        if self.store.get_business(business_id).await?.is_none() {
            return Err(TenancyError::InvalidBusinessId {
                value: business_id.to_string(),
            });
        }
        self.store.set_binding(client_id, business_id).await?;
        info!(client_id, business_id = %business_id, "client rebound by maintainer");
        Ok(())
    }

    pub async fn unbind(&self, client_id: &str) -> Result<bool, TenancyError> {
        let removed = self.store.remove_binding(client_id).await?;
        if removed {
            info!(client_id, "client binding removed by maintainer");
        }
        Ok(removed)
    }
}

fn ensure_active(business: &Business) -> Result<(), TenancyError> {
    if business.is_active() {
        Ok(())
    } else {
        Err(TenancyError::Suspended {
            business_id: business.id,
        })
    }
}

#[derive(Default)]
struct TenancyState {
    businesses: HashMap<Uuid, Business>,
    bindings: HashMap<String, Uuid>,
}

#[derive(Default)]
pub struct InMemoryTenancyStore {
    state: Mutex<TenancyState>,
}

impl InMemoryTenancyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenancyStore for InMemoryTenancyStore {
    async fn create_business(&self, name: &str) -> Result<Business, DatabaseError> {
        let now = Utc::now();
        let business = Business {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: BusinessStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .await
            .businesses
            .insert(business.id, business.clone());
        Ok(business)
    }

    async fn get_business(&self, id: Uuid) -> Result<Option<Business>, DatabaseError> {
        Ok(self.state.lock().await.businesses.get(&id).cloned())
    }

    async fn set_business_status(
        &self,
        id: Uuid,
        status: BusinessStatus,
    ) -> Result<Option<Business>, DatabaseError> {
        let mut state = self.state.lock().await;
        Ok(state.businesses.get_mut(&id).map(|b| {
            b.status = status;
            b.updated_at = Utc::now();
            b.clone()
        }))
    }

    async fn client_binding(&self, client_id: &str) -> Result<Option<Uuid>, DatabaseError> {
        Ok(self.state.lock().await.bindings.get(client_id).copied())
    }

    async fn bind_if_unbound(
        &self,
        client_id: &str,
        business_id: Uuid,
    ) -> Result<Uuid, DatabaseError> {
        let mut state = self.state.lock().await;
        Ok(*state
            .bindings
            .entry(client_id.to_string())
            .or_insert(business_id))
    }

    async fn set_binding(&self, client_id: &str, business_id: Uuid) -> Result<(), DatabaseError> {
        self.state
            .lock()
            .await
            .bindings
            .insert(client_id.to_string(), business_id);
        Ok(())
    }

    async fn remove_binding(&self, client_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.state.lock().await.bindings.remove(client_id).is_some())
    }
}
