//! HS256 JWT identity verification for connection upgrades.

use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use talkie_core::{AuthError, Identity, IdentityVerifier, UserId};

/// Claims carried by an access token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated user.
    pub user_id: UserId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Account email, if the issuer includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Expiry (seconds since the Unix epoch).
    pub exp: u64,
}

/// Verifies HS256 tokens signed with a shared secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for `secret`.
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        if data.claims.user_id.is_empty() {
            return Err(AuthError::InvalidToken("empty user_id claim".into()));
        }
        Ok(Identity {
            user_id: data.claims.user_id,
            display_name: data.claims.name,
        })
    }
}

/// Sign a token for `user_id` valid for `ttl`.
pub fn issue_token(
    secret: &str,
    user_id: &UserId,
    name: &str,
    ttl: Duration,
) -> Result<String, AuthError> {
    let claims = Claims {
        user_id: user_id.clone(),
        name: name.to_owned(),
        email: None,
        exp: jsonwebtoken::get_current_timestamp() + ttl.as_secs(),
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::InvalidToken(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const SECRET: &str = "test-secret";

    #[test]
    fn valid_token_yields_identity() {
        let token = issue_token(SECRET, &"A".into(), "Alice", Duration::from_secs(60)).unwrap();
        let identity = JwtVerifier::new(SECRET).verify(&token).unwrap();
        assert_eq!(identity.user_id.as_str(), "A");
        assert_eq!(identity.display_name, "Alice");
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = issue_token(SECRET, &"A".into(), "Alice", Duration::from_secs(60)).unwrap();
        let err = JwtVerifier::new("other").verify(&token).unwrap_err();
        assert_matches!(err, AuthError::InvalidToken(_));
    }

    #[test]
    fn expired_token_rejected() {
        let claims = Claims {
            user_id: "A".into(),
            name: "Alice".into(),
            email: None,
            exp: 1_000_000,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        let err = JwtVerifier::new(SECRET).verify(&token).unwrap_err();
        assert_matches!(err, AuthError::InvalidToken(msg) if msg.contains("Expired"));
    }

    #[test]
    fn empty_and_garbage_tokens_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        assert_eq!(verifier.verify("").unwrap_err(), AuthError::MissingToken);
        assert_matches!(verifier.verify("not.a.jwt"), Err(AuthError::InvalidToken(_)));
    }

    #[test]
    fn email_claim_is_optional() {
        let json = r#"{"user_id":"B","name":"Bob","exp":1}"#;
        let claims: Claims = serde_json::from_str(json).unwrap();
        assert!(claims.email.is_none());
    }
}
