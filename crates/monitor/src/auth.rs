//! Realtime subscriber token verification

use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use monitor_lib::gateway::{AuthError, AuthVerifier, Principal};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// HS256 bearer token verifier backed by a shared secret
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl AuthVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => Ok(Principal {
                subject: data.claims.sub,
            }),
            Err(err) => match err.kind() {
                ErrorKind::ExpiredSignature => Err(AuthError::Expired),
                _ => Err(AuthError::Invalid),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: usize,
    }

    fn token(secret: &str, sub: &str, exp_offset_secs: i64) -> String {
        let exp = (chrono::Utc::now().timestamp() + exp_offset_secs) as usize;
        encode(
            &Header::default(),
            &TestClaims {
                sub: sub.to_string(),
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_yields_principal() {
        let verifier = JwtVerifier::new("s3cret");
        let principal = verifier.verify(&token("s3cret", "alice", 3600)).unwrap();
        assert_eq!(principal.subject, "alice");
    }

    #[test]
    fn test_expired_token_is_distinguished() {
        let verifier = JwtVerifier::new("s3cret");
        // well past the default validation leeway
        let err = verifier.verify(&token("s3cret", "alice", -7200)).unwrap_err();
        assert_eq!(err, AuthError::Expired);
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let verifier = JwtVerifier::new("s3cret");
        let err = verifier.verify(&token("other", "alice", 3600)).unwrap_err();
        assert_eq!(err, AuthError::Invalid);
    }

    #[test]
    fn test_garbage_token_is_invalid() {
        let verifier = JwtVerifier::new("s3cret");
        assert_eq!(verifier.verify("not-a-jwt").unwrap_err(), AuthError::Invalid);
        assert_eq!(verifier.verify("").unwrap_err(), AuthError::Invalid);
    }
}
