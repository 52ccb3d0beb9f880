use crate::error::{Error, Result};
use crate::eval::AuthContext;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Token lifetime when minting.
const TOKEN_TTL_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    iat: u64,
    exp: u64,
}

/// HS256 token mint and verifier.
///
/// The engine only ever consumes the validated [`AuthContext`]; rule
/// evaluation never sees the token itself.
pub struct Auth {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Auth {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Mints a token for `uid`.
    pub fn create_token(&self, uid: &str, email: Option<&str>) -> Result<String> {
        let now = jsonwebtoken::get_current_timestamp();
        let claims = Claims {
            sub: uid.to_string(),
            email: email.map(String::from),
            roles: Vec::new(),
            iat: now,
            exp: now + TOKEN_TTL_SECS,
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|_| Error::InvalidToken)
    }

    /// Verifies signature and expiry, returning the caller's context.
    pub fn validate_token(&self, token: &str) -> Result<AuthContext> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|err| {
            match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Error::TokenExpired,
                _ => Error::InvalidToken,
            }
        })?;
        Ok(AuthContext {
            authenticated: true,
            uid: Some(data.claims.sub),
            email: data.claims.email,
            roles: data.claims.roles,
            exp: Some(data.claims.exp as i64),
        })
    }
}
