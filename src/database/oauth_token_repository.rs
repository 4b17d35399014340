use crate::auth::{TokenInfo, TokenIntrospector};
use crate::database::error::DatabaseError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool};

/// Tokens are stored hashed; this is the lookup key
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, FromRow)]
struct TokenRecord {
    client_id: String,
    scopes: String,
}

impl From<TokenRecord> for TokenInfo {
    fn from(r: TokenRecord) -> Self {
        TokenInfo {
            client_id: r.client_id,
            scopes: r.scopes.split_whitespace().map(str::to_string).collect(),
        }
    }
}

/// Reads access tokens issued by the OAuth provider
pub struct OAuthTokenRepository {
    pool: PgPool,
}

impl OAuthTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenIntrospector for OAuthTokenRepository {
    async fn introspect(&self, token: &str) -> Result<Option<TokenInfo>, DatabaseError> {
        let record = sqlx::query_as::<_, TokenRecord>(
            "SELECT client_id, scopes FROM oauth_access_tokens
             WHERE token_hash = $1 AND NOT revoked AND expires_at > NOW()",
        )
        .bind(token_hash(token))
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(record.map(TokenInfo::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_hash_is_sha256_hex() {
        assert_eq!(
            token_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn scopes_split_on_whitespace() {
        let info = TokenInfo::from(TokenRecord {
            client_id: "c".to_string(),
            scopes: " c2b:write  b2c:read ".to_string(),
        });
        assert_eq!(info.scopes, vec!["c2b:write", "b2c:read"]);
    }
}
