use anyhow::{bail, Context};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::records::UserId;

/// User id claim as issued by the account service: a JSON number or a
/// numeric string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum UserIdClaim {
    Number(UserId),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
struct AccessTokenClaims {
    id: UserIdClaim,
    #[allow(dead_code)]
    exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedCredential {
    pub user_id: UserId,
}

/// Verifies HS256 access tokens against the shared secret. Issuing tokens
/// is the account service's job; the relay only checks them.
#[derive(Clone)]
pub struct JwtCredentialVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtCredentialVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Ok(Self { decoding_key: DecodingKey::from_secret(secret.as_bytes()), validation })
    }

    pub fn verify(&self, token: &str) -> anyhow::Result<VerifiedCredential> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        let user_id = match claims.id {
            UserIdClaim::Number(id) => id,
            UserIdClaim::Text(raw) => raw
                .trim()
                .parse::<UserId>()
                .with_context(|| format!("access token user id '{raw}' is not numeric"))?,
        };

        Ok(VerifiedCredential { user_id })
    }
}
