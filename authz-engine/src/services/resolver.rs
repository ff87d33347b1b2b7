//! Principal resolution from bearer tokens.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{debug, warn};

use crate::models::Principal;
use crate::services::error::AuthzError;

const FACILITATOR_ROLE: &str = "facilitator";
const SERVICE_ROLE: &str = "service";

/// A raw credential as presented by the caller.
#[derive(Clone)]
pub struct Credential {
    token: String,
}

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Parse an `Authorization` header value of the form `Bearer <token>`.
    pub fn parse_authorization(header: &str) -> Result<Self, AuthzError> {
        let (scheme, token) = header
            .trim()
            .split_once(' ')
            .ok_or_else(|| AuthzError::Unauthenticated("malformed authorization header".into()))?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(AuthzError::Unauthenticated(format!(
                "unsupported authorization scheme '{}'",
                scheme
            )));
        }
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthzError::Unauthenticated("empty bearer token".into()));
        }
        Ok(Self::bearer(token))
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential").field("token", &"[redacted]").finish()
    }
}

/// Turns a credential into a principal. No side effects, no caching.
pub trait PrincipalResolver: Send + Sync {
    fn resolve(&self, credential: &Credential) -> Result<Principal, AuthzError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JwtAlgorithm {
    Hs256,
    #[default]
    Rs256,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtResolverConfig {
    #[serde(default)]
    pub algorithm: JwtAlgorithm,
    /// Shared secret for HS256.
    #[serde(default)]
    pub secret: Option<String>,
    /// PEM public key for RS256.
    #[serde(default)]
    pub public_key_path: Option<String>,
    pub user_issuer: String,
    pub service_issuer: String,
    #[serde(default)]
    pub audience: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenUse {
    User,
    Service,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalClaims {
    /// Subject (principal id)
    pub sub: String,
    /// Issuer
    pub iss: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    pub token_use: TokenUse,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Verifies signed JWTs issued by the user or service issuer.
pub struct JwtPrincipalResolver {
    decoding_key: DecodingKey,
    validation: Validation,
    user_issuer: String,
    service_issuer: String,
}

impl JwtPrincipalResolver {
    pub fn new(config: &JwtResolverConfig) -> Result<Self, anyhow::Error> {
        let (algorithm, decoding_key) = match config.algorithm {
            JwtAlgorithm::Hs256 => {
                let secret = config
                    .secret
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("HS256 requires jwt.secret"))?;
                (Algorithm::HS256, DecodingKey::from_secret(secret.as_bytes()))
            }
            JwtAlgorithm::Rs256 => {
                let path = config
                    .public_key_path
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("RS256 requires jwt.public_key_path"))?;
                let pem = fs::read_to_string(path).map_err(|e| {
                    anyhow::anyhow!("Failed to read public key from {}: {}", path, e)
                })?;
                let key = DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;
                (Algorithm::RS256, key)
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.set_issuer(&[&config.user_issuer, &config.service_issuer]);
        match &config.audience {
            Some(audience) => {
                validation.set_audience(&[audience]);
                validation.set_required_spec_claims(&["exp", "iss", "sub", "aud"]);
            }
            None => validation.validate_aud = false,
        }

        tracing::info!(algorithm = ?config.algorithm, "JWT principal resolver initialized");

        Ok(Self {
            decoding_key,
            validation,
            user_issuer: config.user_issuer.clone(),
            service_issuer: config.service_issuer.clone(),
        })
    }

    fn principal_from_claims(&self, claims: PrincipalClaims) -> Result<Principal, AuthzError> {
        if claims.sub.is_empty() {
            return Err(AuthzError::Unauthenticated("token has no subject".into()));
        }

        match claims.token_use {
            TokenUse::Service => {
                if claims.iss != self.service_issuer {
                    warn!(
                        security_event = true,
                        sub = %claims.sub,
                        iss = %claims.iss,
                        "Service token from non-service issuer"
                    );
                    return Err(AuthzError::Unauthenticated("untrusted service token".into()));
                }
                if claims.email.is_some() || claims.roles.iter().any(|r| r != SERVICE_ROLE) {
                    warn!(
                        security_event = true,
                        sub = %claims.sub,
                        "Service token carries end-user claims"
                    );
                    return Err(AuthzError::Unauthenticated("untrusted service token".into()));
                }
                Ok(Principal::service(claims.sub))
            }
            TokenUse::User => {
                if claims.iss != self.user_issuer {
                    return Err(AuthzError::Unauthenticated("unexpected issuer".into()));
                }
                if claims.roles.iter().any(|r| r == SERVICE_ROLE) {
                    warn!(
                        security_event = true,
                        sub = %claims.sub,
                        "User token claims the service role"
                    );
                    return Err(AuthzError::Unauthenticated("untrusted user token".into()));
                }
                let principal = Principal::user(claims.sub);
                if claims.roles.iter().any(|r| r == FACILITATOR_ROLE) {
                    Ok(principal.with_facilitator())
                } else {
                    Ok(principal)
                }
            }
        }
    }
}

impl PrincipalResolver for JwtPrincipalResolver {
    fn resolve(&self, credential: &Credential) -> Result<Principal, AuthzError> {
        let data = decode::<PrincipalClaims>(credential.token(), &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!(error = %e, "Token rejected");
                AuthzError::Unauthenticated(format!("invalid token: {}", e))
            })?;
        self.principal_from_claims(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Capability, PrincipalKind};
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-0123456789";

    fn config() -> JwtResolverConfig {
        JwtResolverConfig {
            algorithm: JwtAlgorithm::Hs256,
            secret: Some(SECRET.into()),
            public_key_path: None,
            user_issuer: "https://auth.example.test".into(),
            service_issuer: "https://internal.example.test".into(),
            audience: None,
        }
    }

    fn claims(sub: &str, iss: &str, token_use: TokenUse, roles: &[&str]) -> PrincipalClaims {
        let now = Utc::now();
        PrincipalClaims {
            sub: sub.into(),
            iss: iss.into(),
            exp: (now + Duration::minutes(5)).timestamp(),
            iat: now.timestamp(),
            token_use,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            email: None,
            aud: None,
        }
    }

    fn sign(claims: &PrincipalClaims) -> Credential {
        let token = encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        Credential::bearer(token)
    }

    fn resolver() -> JwtPrincipalResolver {
        JwtPrincipalResolver::new(&config()).unwrap()
    }

    #[test]
    fn test_user_token_resolves() {
        let mut c = claims("u1", "https://auth.example.test", TokenUse::User, &[]);
        c.email = Some("u1@example.test".into());
        let principal = resolver().resolve(&sign(&c)).unwrap();
        assert_eq!(principal.id(), "u1");
        assert_eq!(principal.kind(), PrincipalKind::User);
        assert!(!principal.has_capability(Capability::Facilitator));
    }

    #[test]
    fn test_facilitator_role_adds_capability() {
        let c = claims("f1", "https://auth.example.test", TokenUse::User, &["facilitator"]);
        let principal = resolver().resolve(&sign(&c)).unwrap();
        assert!(principal.has_capability(Capability::Facilitator));
        assert!(!principal.has_capability(Capability::Service));
    }

    #[test]
    fn test_user_token_claiming_service_role_is_rejected() {
        let c = claims("u1", "https://auth.example.test", TokenUse::User, &["service"]);
        assert!(matches!(
            resolver().resolve(&sign(&c)),
            Err(AuthzError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_service_token_requires_service_issuer() {
        let c = claims("worker", "https://internal.example.test", TokenUse::Service, &["service"]);
        let principal = resolver().resolve(&sign(&c)).unwrap();
        assert_eq!(principal.kind(), PrincipalKind::Service);

        let c = claims("worker", "https://auth.example.test", TokenUse::Service, &[]);
        assert!(resolver().resolve(&sign(&c)).is_err());
    }

    #[test]
    fn test_service_token_with_user_claims_is_rejected() {
        let mut c = claims("worker", "https://internal.example.test", TokenUse::Service, &[]);
        c.email = Some("someone@example.test".into());
        assert!(resolver().resolve(&sign(&c)).is_err());

        let c = claims(
            "worker",
            "https://internal.example.test",
            TokenUse::Service,
            &["facilitator"],
        );
        assert!(resolver().resolve(&sign(&c)).is_err());
    }

    #[test]
    fn test_expired_and_foreign_tokens_are_rejected() {
        let mut c = claims("u1", "https://auth.example.test", TokenUse::User, &[]);
        c.exp = (Utc::now() - Duration::minutes(10)).timestamp();
        assert!(resolver().resolve(&sign(&c)).is_err());

        let c = claims("u1", "https://evil.example.test", TokenUse::User, &[]);
        assert!(resolver().resolve(&sign(&c)).is_err());
    }

    #[test]
    fn test_audience_is_enforced_when_configured() {
        let mut config = config();
        config.audience = Some("authz".into());
        let resolver = JwtPrincipalResolver::new(&config).unwrap();

        let mut c = claims("u1", "https://auth.example.test", TokenUse::User, &[]);
        assert!(resolver.resolve(&sign(&c)).is_err());
        c.aud = Some("authz".into());
        assert!(resolver.resolve(&sign(&c)).is_ok());
    }

    #[test]
    fn test_parse_authorization_header() {
        assert_eq!(
            Credential::parse_authorization("Bearer abc").unwrap().token(),
            "abc"
        );
        assert_eq!(
            Credential::parse_authorization("bearer  abc ").unwrap().token(),
            "abc"
        );
        assert!(Credential::parse_authorization("Basic abc").is_err());
        assert!(Credential::parse_authorization("Bearer").is_err());
    }
}
