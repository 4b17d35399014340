use crate::database::error::DatabaseError;
use crate::database::parse_column;
use crate::payments::types::{DarajaCredential, Environment, MpesaShortcode, ShortcodeType};
use crate::services::credentials::{CredentialStore, NewCredential, NewShortcode};
use crate::services::tenancy::{Business, BusinessStatus, TenancyStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

const BUSINESS_COLUMNS: &str = "id, name, status, created_at, updated_at";
const CREDENTIAL_COLUMNS: &str =
    "id, business_id, environment, consumer_key, consumer_secret, token_url, is_active";
const SHORTCODE_COLUMNS: &str = "id, business_id, shortcode, shortcode_type, lipa_passkey, \
    initiator_name, security_credential, is_active";

#[derive(Debug, FromRow)]
struct BusinessRecord {
    id: Uuid,
    name: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BusinessRecord> for Business {
    type Error = DatabaseError;

    fn try_from(r: BusinessRecord) -> Result<Self, Self::Error> {
        Ok(Business {
            id: r.id,
            name: r.name,
            status: parse_column("status", &r.status)?,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CredentialRecord {
    id: Uuid,
    business_id: Uuid,
    environment: String,
    consumer_key: String,
    consumer_secret: String,
    token_url: Option<String>,
    is_active: bool,
}

impl TryFrom<CredentialRecord> for DarajaCredential {
    type Error = DatabaseError;

    fn try_from(r: CredentialRecord) -> Result<Self, Self::Error> {
        Ok(DarajaCredential {
            id: r.id,
            business_id: r.business_id,
            environment: parse_column("environment", &r.environment)?,
            consumer_key: r.consumer_key,
            consumer_secret: r.consumer_secret,
            token_url: r.token_url,
            is_active: r.is_active,
        })
    }
}

#[derive(Debug, FromRow)]
struct ShortcodeRecord {
    id: Uuid,
    business_id: Uuid,
    shortcode: String,
    shortcode_type: String,
    lipa_passkey: Option<String>,
    initiator_name: Option<String>,
    security_credential: Option<String>,
    is_active: bool,
}

impl TryFrom<ShortcodeRecord> for MpesaShortcode {
    type Error = DatabaseError;

    fn try_from(r: ShortcodeRecord) -> Result<Self, Self::Error> {
        Ok(MpesaShortcode {
            id: r.id,
            business_id: r.business_id,
            shortcode: r.shortcode,
            shortcode_type: parse_column("shortcode_type", &r.shortcode_type)?,
            lipa_passkey: r.lipa_passkey,
            initiator_name: r.initiator_name,
            security_credential: r.security_credential,
            is_active: r.is_active,
        })
    }
}

/// Repository for businesses, client bindings, credentials and shortcodes
pub struct BusinessRepository {
    pool: PgPool,
}

impl BusinessRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenancyStore for BusinessRepository {
    async fn create_business(&self, name: &str) -> Result<Business, DatabaseError> {
        sqlx::query_as::<_, BusinessRecord>(&format!(
            "INSERT INTO businesses (id, name, status) VALUES ($1, $2, 'active') RETURNING {}",
            BUSINESS_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .try_into()
    }

    async fn get_business(&self, id: Uuid) -> Result<Option<Business>, DatabaseError> {
        sqlx::query_as::<_, BusinessRecord>(&format!(
            "SELECT {} FROM businesses WHERE id = $1",
            BUSINESS_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Business::try_from)
        .transpose()
    }

    async fn set_business_status(
        &self,
        id: Uuid,
        status: BusinessStatus,
    ) -> Result<Option<Business>, DatabaseError> {
        sqlx::query_as::<_, BusinessRecord>(&format!(
            "UPDATE businesses SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING {}",
            BUSINESS_COLUMNS
        ))
        .bind(id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Business::try_from)
        .transpose()
    }

    async fn client_binding(&self, client_id: &str) -> Result<Option<Uuid>, DatabaseError> {
        sqlx::query_scalar("SELECT business_id FROM oauth_client_businesses WHERE client_id = $1")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn bind_if_unbound(
        &self,
        client_id: &str,
        business_id: Uuid,
    ) -> Result<Uuid, DatabaseError> {
        // The primary key on client_id settles concurrent first binds; the loser re-reads
        sqlx::query(
            "INSERT INTO oauth_client_businesses (client_id, business_id)
             VALUES ($1, $2)
             ON CONFLICT (client_id) DO NOTHING",
        )
        .bind(client_id)
        .bind(business_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        sqlx::query_scalar("SELECT business_id FROM oauth_client_businesses WHERE client_id = $1")
            .bind(client_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn set_binding(&self, client_id: &str, business_id: Uuid) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO oauth_client_businesses (client_id, business_id)
             VALUES ($1, $2)
             ON CONFLICT (client_id) DO UPDATE SET business_id = EXCLUDED.business_id",
        )
        .bind(client_id)
        .bind(business_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn remove_binding(&self, client_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM oauth_client_businesses WHERE client_id = $1")
            .bind(client_id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CredentialStore for BusinessRepository {
    async fn active_credential(
        &self,
        business_id: Uuid,
        environment: Environment,
    ) -> Result<Option<DarajaCredential>, DatabaseError> {
        sqlx::query_as::<_, CredentialRecord>(&format!(
            "SELECT {} FROM daraja_credentials
             WHERE business_id = $1 AND environment = $2 AND is_active
             ORDER BY created_at DESC LIMIT 1",
            CREDENTIAL_COLUMNS
        ))
        .bind(business_id)
        .bind(environment.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(DarajaCredential::try_from)
        .transpose()
    }

    async fn upsert_credential(
        &self,
        new: NewCredential,
    ) -> Result<DarajaCredential, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        sqlx::query(
            "UPDATE daraja_credentials SET is_active = FALSE, updated_at = NOW()
             WHERE business_id = $1 AND environment = $2 AND is_active",
        )
        .bind(new.business_id)
        .bind(new.environment.as_str())
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let record = sqlx::query_as::<_, CredentialRecord>(&format!(
            "INSERT INTO daraja_credentials
                 (id, business_id, environment, consumer_key, consumer_secret, token_url, is_active)
             VALUES ($1, $2, $3, $4, $5, $6, TRUE)
             RETURNING {}",
            CREDENTIAL_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(new.business_id)
        .bind(new.environment.as_str())
        .bind(&new.consumer_key)
        .bind(&new.consumer_secret)
        .bind(&new.token_url)
        .fetch_one(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        record.try_into()
    }

    async fn active_shortcode(
        &self,
        business_id: Uuid,
        types: &[ShortcodeType],
    ) -> Result<Option<MpesaShortcode>, DatabaseError> {
        let types: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        sqlx::query_as::<_, ShortcodeRecord>(&format!(
            "SELECT {} FROM mpesa_shortcodes
             WHERE business_id = $1 AND is_active AND shortcode_type = ANY($2)
             ORDER BY updated_at DESC LIMIT 1",
            SHORTCODE_COLUMNS
        ))
        .bind(business_id)
        .bind(&types)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(MpesaShortcode::try_from)
        .transpose()
    }

    async fn upsert_shortcode(&self, new: NewShortcode) -> Result<MpesaShortcode, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        if new.set_active {
            sqlx::query(
                "UPDATE mpesa_shortcodes SET is_active = FALSE, updated_at = NOW()
                 WHERE business_id = $1 AND shortcode_type = $2 AND shortcode <> $3",
            )
            .bind(new.business_id)
            .bind(new.shortcode_type.as_str())
            .bind(&new.shortcode)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        }

        let record = sqlx::query_as::<_, ShortcodeRecord>(&format!(
            "INSERT INTO mpesa_shortcodes
                 (id, business_id, shortcode, shortcode_type, lipa_passkey, initiator_name,
                  security_credential, is_active)
             VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE)
             ON CONFLICT (business_id, shortcode) DO UPDATE
             SET shortcode_type = EXCLUDED.shortcode_type,
                 lipa_passkey = COALESCE(EXCLUDED.lipa_passkey, mpesa_shortcodes.lipa_passkey),
                 initiator_name = COALESCE(EXCLUDED.initiator_name, mpesa_shortcodes.initiator_name),
                 security_credential = COALESCE(EXCLUDED.security_credential, mpesa_shortcodes.security_credential),
                 is_active = mpesa_shortcodes.is_active OR $8,
                 updated_at = NOW()
             RETURNING {}",
            SHORTCODE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(new.business_id)
        .bind(&new.shortcode)
        .bind(new.shortcode_type.as_str())
        .bind(&new.lipa_passkey)
        .bind(&new.initiator_name)
        .bind(&new.security_credential)
        .bind(new.set_active)
        .fetch_one(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        record.try_into()
    }
}
