//! Handshake authentication.
//!
//! A socket is authenticated exactly once, before it is registered. The
//! bearer credential comes from the `Authorization` header or the `token`
//! query parameter; verifying it is delegated to an [`AuthValidator`].

use crate::identity::{Identity, Role, UserId};
use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Handshake rejection causes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No credential in header or query.
    #[error("No token provided")]
    MissingCredential,

    /// Credential present but unparsable.
    #[error("Malformed credential: {0}")]
    MalformedCredential(String),

    /// Signature does not verify.
    #[error("Invalid token signature")]
    InvalidSignature,

    /// Token is past its expiry.
    #[error("Token expired")]
    Expired,

    /// Token is valid but its user no longer exists.
    #[error("Unknown principal: {0}")]
    UnknownPrincipal(UserId),
}

/// Verifies a bearer token and resolves the identity it carries.
#[async_trait]
pub trait AuthValidator: Send + Sync {
    /// Verify `token`.
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Lookup of users that still exist.
#[async_trait]
pub trait PrincipalStore: Send + Sync {
    /// Whether `user_id` is a live account.
    async fn exists(&self, user_id: &UserId) -> bool;
}

/// Claims carried by dashboard session tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject of the token.
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Dashboard role; tokens minted before roles existed carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
}

/// HS256 JWT validator.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
    principals: Option<Arc<dyn PrincipalStore>>,
}

impl JwtValidator {
    /// Create a validator for tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
            principals: None,
        }
    }

    /// Accept tokens up to `seconds` past their expiry.
    #[must_use]
    pub fn with_leeway(mut self, seconds: u64) -> Self {
        self.validation.leeway = seconds;
        self
    }

    /// Reject tokens whose subject is missing from `store`.
    #[must_use]
    pub fn with_principals(mut self, store: Arc<dyn PrincipalStore>) -> Self {
        self.principals = Some(store);
        self
    }
}

#[async_trait]
impl AuthValidator for JwtValidator {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::MalformedCredential(e.to_string()),
            },
        )?;

        let identity = Identity::new(data.claims.user_id, data.claims.role.unwrap_or_default());

        if let Some(principals) = &self.principals {
            if !principals.exists(&identity.user_id).await {
                return Err(AuthError::UnknownPrincipal(identity.user_id));
            }
        }

        Ok(identity)
    }
}

/// Credential-bearing parts of an upgrade request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Handshake<'a> {
    /// Raw `Authorization` header value.
    pub authorization: Option<&'a str>,
    /// Value of the `token` query parameter.
    pub query_token: Option<&'a str>,
}

impl<'a> Handshake<'a> {
    /// Extract the bearer token. The header wins over the query parameter.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingCredential`] when neither is present and
    /// [`AuthError::MalformedCredential`] for a non-bearer header.
    pub fn bearer_token(&self) -> Result<&'a str, AuthError> {
        if let Some(header) = self.authorization {
            let mut parts = header.trim().splitn(2, ' ');
            let scheme = parts.next().unwrap_or_default();
            let token = parts.next().map(str::trim).unwrap_or_default();

            if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
                return Err(AuthError::MalformedCredential(
                    "expected `Bearer <token>`".to_string(),
                ));
            }
            return Ok(token);
        }

        match self.query_token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(AuthError::MissingCredential),
        }
    }
}

/// Resolves the identity of a socket at handshake.
#[derive(Clone)]
pub struct ConnectionAuthenticator {
    validator: Option<Arc<dyn AuthValidator>>,
}

impl ConnectionAuthenticator {
    /// Authenticate every handshake through `validator`.
    #[must_use]
    pub fn new(validator: Arc<dyn AuthValidator>) -> Self {
        Self {
            validator: Some(validator),
        }
    }

    /// Admit every handshake as [`Identity::anonymous`].
    #[must_use]
    pub fn disabled() -> Self {
        Self { validator: None }
    }

    /// Whether a credential is required.
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.validator.is_some()
    }

    /// Authenticate a handshake.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] that rejected the handshake.
    pub async fn authenticate(&self, handshake: &Handshake<'_>) -> Result<Identity, AuthError> {
        let Some(validator) = &self.validator else {
            return Ok(Identity::anonymous());
        };

        let token = handshake.bearer_token()?;
        let identity = validator.verify(token).await?;
        debug!(user = %identity.user_id, role = %identity.role, "Handshake authenticated");
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &[u8] = b"test-secret";

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn token(user: &str, role: Option<Role>, exp: u64, secret: &[u8]) -> String {
        let claims = Claims {
            user_id: user.to_string(),
            role,
            exp,
        };
        jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
            .unwrap()
    }

    struct OnlyUser(&'static str);

    #[async_trait]
    impl PrincipalStore for OnlyUser {
        async fn exists(&self, user_id: &UserId) -> bool {
            user_id.as_str() == self.0
        }
    }

    fn authenticator() -> ConnectionAuthenticator {
        ConnectionAuthenticator::new(Arc::new(JwtValidator::new(SECRET)))
    }

    #[test]
    fn test_bearer_extraction() {
        let handshake = Handshake {
            authorization: Some("Bearer abc"),
            query_token: Some("from-query"),
        };
        assert_eq!(handshake.bearer_token(), Ok("abc"));

        let handshake = Handshake {
            authorization: None,
            query_token: Some("from-query"),
        };
        assert_eq!(handshake.bearer_token(), Ok("from-query"));

        let handshake = Handshake {
            authorization: Some("Basic dXNlcjpwdw=="),
            query_token: None,
        };
        assert!(matches!(
            handshake.bearer_token(),
            Err(AuthError::MalformedCredential(_))
        ));

        assert_eq!(
            Handshake::default().bearer_token(),
            Err(AuthError::MissingCredential)
        );
    }

    #[tokio::test]
    async fn test_valid_token() {
        let token = token("u-1", Some(Role::Operator), now() + 3600, SECRET);
        let handshake = Handshake {
            authorization: None,
            query_token: Some(&token),
        };

        let identity = authenticator().authenticate(&handshake).await.unwrap();
        assert_eq!(identity, Identity::new("u-1", Role::Operator));
    }

    #[tokio::test]
    async fn test_missing_role_defaults_to_user() {
        let token = token("u-2", None, now() + 3600, SECRET);
        let header = format!("Bearer {token}");
        let handshake = Handshake {
            authorization: Some(&header),
            query_token: None,
        };

        let identity = authenticator().authenticate(&handshake).await.unwrap();
        assert_eq!(identity.role, Role::User);
    }

    #[tokio::test]
    async fn test_rejections() {
        let auth = authenticator();

        let expired = token("u-1", None, now() - 3600, SECRET);
        let forged = token("u-1", None, now() + 3600, b"other-secret");

        let check = |t: &str| {
            let t = t.to_string();
            let auth = auth.clone();
            async move {
                auth.authenticate(&Handshake {
                    authorization: None,
                    query_token: Some(&t),
                })
                .await
            }
        };

        assert_eq!(check(&expired).await, Err(AuthError::Expired));
        assert_eq!(check(&forged).await, Err(AuthError::InvalidSignature));
        assert!(matches!(
            check("not-a-jwt").await,
            Err(AuthError::MalformedCredential(_))
        ));
        assert_eq!(
            auth.authenticate(&Handshake::default()).await,
            Err(AuthError::MissingCredential)
        );
    }

    #[tokio::test]
    async fn test_deleted_principal_rejected() {
        let validator = JwtValidator::new(SECRET).with_principals(Arc::new(OnlyUser("u-1")));
        let auth = ConnectionAuthenticator::new(Arc::new(validator));

        let gone = token("u-9", None, now() + 3600, SECRET);
        let result = auth
            .authenticate(&Handshake {
                authorization: None,
                query_token: Some(&gone),
            })
            .await;
        assert_eq!(result, Err(AuthError::UnknownPrincipal(UserId::new("u-9"))));
    }

    #[tokio::test]
    async fn test_disabled_admits_anonymous() {
        let auth = ConnectionAuthenticator::disabled();
        assert!(!auth.is_required());
        let identity = auth.authenticate(&Handshake::default()).await.unwrap();
        assert_eq!(identity, Identity::anonymous());
    }
}
