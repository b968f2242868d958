//! JWT token generation and validation for agent dashboard sessions

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// JWT claims for agent bearer tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentClaims {
    /// Subject (agent ID)
    pub sub: Uuid,
    /// Organization ID
    pub org_id: Uuid,
    /// Agent role
    pub role: String,
    /// Email
    pub email: String,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
    /// Token type (access or refresh)
    pub token_type: TokenType,
    /// JWT ID for revocation tracking
    pub jti: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

/// JWT manager for token operations
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_token_expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, access_token_expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_token_expiry_hours,
        }
    }

    /// Generate an access token with a unique JTI for revocation tracking.
    pub fn generate_access_token(
        &self,
        agent_id: Uuid,
        org_id: Uuid,
        role: &str,
        email: &str,
        name: Option<&str>,
    ) -> Result<(String, String), JwtError> {
        let now = OffsetDateTime::now_utc();
        let exp = now + Duration::hours(self.access_token_expiry_hours);
        let jti = Uuid::new_v4().to_string();

        let claims = AgentClaims {
            sub: agent_id,
            org_id,
            role: role.to_string(),
            email: email.to_string(),
            name: name.map(str::to_string),
            iat: now.unix_timestamp(),
            exp: exp.unix_timestamp(),
            token_type: TokenType::Access,
            jti: jti.clone(),
        };

        // Explicit algorithm prevents algorithm confusion attacks
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))?;

        Ok((token, jti))
    }

    /// Validate and decode a token.
    pub fn validate_token(&self, token: &str) -> Result<AgentClaims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance

        decode::<AgentClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => JwtError::Invalid,
                _ => JwtError::Validation(e.to_string()),
            })
    }

    /// Validate an access token specifically.
    pub fn validate_access_token(&self, token: &str) -> Result<AgentClaims, JwtError> {
        let claims = self.validate_token(token)?;
        if claims.token_type != TokenType::Access {
            return Err(JwtError::WrongTokenType);
        }
        Ok(claims)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Wrong token type")]
    WrongTokenType,
    #[error("Token encoding failed: {0}")]
    Encoding(String),
    #[error("Token validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;

    #[test]
    fn test_token_generation_and_validation() {
        let jwt = JwtManager::new("test-secret-key-at-least-32-chars!", 24);
        let agent_id = Uuid::new_v4();
        let org_id = Uuid::new_v4();

        let (token, jti) = jwt
            .generate_access_token(agent_id, org_id, "agent", "a@example.com", Some("Ana"))
            .expect("Failed to generate token");

        let claims = jwt.validate_access_token(&token).expect("Invalid token");
        assert_eq!(claims.sub, agent_id);
        assert_eq!(claims.org_id, org_id);
        assert_eq!(claims.token_type, TokenType::Access);
        assert_eq!(claims.jti, jti);
        assert_eq!(claims.name.as_deref(), Some("Ana"));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let jwt = JwtManager::new("test-secret-key-at-least-32-chars!", 24);
        let (token, _) = jwt
            .generate_access_token(Uuid::new_v4(), Uuid::new_v4(), "agent", "a@example.com", None)
            .expect("Failed to generate token");

        let tampered = format!("{}x", &token[..token.len() - 1]);
        assert!(jwt.validate_access_token(&tampered).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let jwt = JwtManager::new("test-secret-key-at-least-32-chars!", 24);
        let other = JwtManager::new("different-secret-also-32-chars-long!", 24);

        let (token, _) = jwt
            .generate_access_token(Uuid::new_v4(), Uuid::new_v4(), "agent", "a@example.com", None)
            .expect("Failed to generate token");

        assert!(matches!(
            other.validate_access_token(&token),
            Err(JwtError::Invalid) | Err(JwtError::Validation(_))
        ));
    }
}
