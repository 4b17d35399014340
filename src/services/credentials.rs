//! Per-business Daraja credentials and shortcodes

use crate::database::error::DatabaseError;
use crate::payments::types::{DarajaCredential, Environment, MpesaShortcode, ShortcodeType};
use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewCredential {
    pub business_id: Uuid,
    pub environment: Environment,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub token_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewShortcode {
    pub business_id: Uuid,
    pub shortcode: String,
    pub shortcode_type: ShortcodeType,
    pub lipa_passkey: Option<String>,
    pub initiator_name: Option<String>,
    pub security_credential: Option<String>,
    /// Deactivate the business's other shortcodes of the same type
    pub set_active: bool,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn active_credential(
        &self,
        business_id: Uuid,
        environment: Environment,
    ) -> Result<Option<DarajaCredential>, DatabaseError>;

    /// Replace the active credential of `(business, environment)`
    async fn upsert_credential(&self, new: NewCredential)
        -> Result<DarajaCredential, DatabaseError>;

    /// Most recently updated active shortcode of any of `types`
    async fn active_shortcode(
        &self,
        business_id: Uuid,
        types: &[ShortcodeType],
    ) -> Result<Option<MpesaShortcode>, DatabaseError>;

    /// Insert or update by `(business, shortcode)`
    async fn upsert_shortcode(&self, new: NewShortcode) -> Result<MpesaShortcode, DatabaseError>;
}

#[derive(Default)]
struct CredentialState {
    credentials: Vec<DarajaCredential>,
    // newest last
    shortcodes: Vec<MpesaShortcode>,
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    state: Mutex<CredentialState>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn active_credential(
        &self,
        business_id: Uuid,
        environment: Environment,
    ) -> Result<Option<DarajaCredential>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .credentials
            .iter()
            .find(|c| c.business_id == business_id && c.environment == environment && c.is_active)
            .cloned())
    }

    async fn upsert_credential(
        &self,
        new: NewCredential,
    ) -> Result<DarajaCredential, DatabaseError> {
        let mut state = self.state.lock().await;
        for existing in state
            .credentials
            .iter_mut()
            .filter(|c| c.business_id == new.business_id && c.environment == new.environment)
        {
            existing.is_active = false;
        }

        let credential = DarajaCredential {
            id: Uuid::new_v4(),
            business_id: new.business_id,
            environment: new.environment,
            consumer_key: new.consumer_key,
            consumer_secret: new.consumer_secret,
            token_url: new.token_url,
            is_active: true,
        };
        state.credentials.push(credential.clone());
        Ok(credential)
    }

    async fn active_shortcode(
        &self,
        business_id: Uuid,
        types: &[ShortcodeType],
    ) -> Result<Option<MpesaShortcode>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .shortcodes
            .iter()
            .rev()
            .find(|s| {
                s.business_id == business_id && s.is_active && types.contains(&s.shortcode_type)
            })
            .cloned())
    }

    async fn upsert_shortcode(&self, new: NewShortcode) -> Result<MpesaShortcode, DatabaseError> {
        let mut state = self.state.lock().await;

        if new.set_active {
            for other in state.shortcodes.iter_mut().filter(|s| {
                s.business_id == new.business_id
                    && s.shortcode_type == new.shortcode_type
                    && s.shortcode != new.shortcode
            }) {
                other.is_active = false;
            }
        }

        let position = state
            .shortcodes
            .iter()
            .position(|s| s.business_id == new.business_id && s.shortcode == new.shortcode);
        let id = position.map(|i| state.shortcodes[i].id).unwrap_or_else(Uuid::new_v4);
        let was_active = position.map(|i| state.shortcodes[i].is_active);
        if let Some(i) = position {
            state.shortcodes.remove(i);
        }

        let shortcode = MpesaShortcode {
            id,
            business_id: new.business_id,
            shortcode: new.shortcode,
            shortcode_type: new.shortcode_type,
            lipa_passkey: new.lipa_passkey,
            initiator_name: new.initiator_name,
            security_credential: new.security_credential,
            is_active: new.set_active || was_active.unwrap_or(true),
        };
        state.shortcodes.push(shortcode.clone());
        Ok(shortcode)
    }
}
