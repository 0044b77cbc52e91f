//! Credential material and the providers that hand it to a session.
//!
//! Shared-access-signature tokens expire and must be refreshed before they do;
//! X.509 identities are presented as-is for the lifetime of the session.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use time::OffsetDateTime;
use tracing::debug;

use crate::errors::AuthError;

/// Signed, time-limited token.
#[derive(Clone, PartialEq, Eq)]
pub struct SasToken {
    token: String,
    expires_at: OffsetDateTime,
}

impl SasToken {
    pub fn new(token: impl Into<String>, expires_at: OffsetDateTime) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Token valid for `ttl` starting now.
    pub fn valid_for(token: impl Into<String>, ttl: Duration) -> Self {
        Self::new(token, OffsetDateTime::now_utc() + ttl)
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    /// Time left before `margin` ahead of expiry, measured from `now`.
    /// Zero once the token is inside the margin.
    pub fn time_until_renewal(&self, now: OffsetDateTime, margin: Duration) -> Duration {
        let renew_at = time::Duration::try_from(margin)
            .ok()
            .and_then(|margin| self.expires_at.checked_sub(margin));
        match renew_at {
            Some(renew_at) if renew_at > now => {
                (renew_at - now).try_into().unwrap_or(Duration::ZERO)
            }
            _ => Duration::ZERO,
        }
    }

    /// Lifetime left at `now`; zero once expired.
    pub fn remaining(&self, now: OffsetDateTime) -> Duration {
        (self.expires_at - now).try_into().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Debug for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct X509Identity {
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub passphrase: Option<String>,
}

impl X509Identity {
    pub fn new(certificate_pem: impl Into<String>, private_key_pem: impl Into<String>) -> Self {
        Self {
            certificate_pem: certificate_pem.into(),
            private_key_pem: private_key_pem.into(),
            passphrase: None,
        }
    }
}

impl fmt::Debug for X509Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509Identity")
            .field("certificate_pem", &format!("{} bytes", self.certificate_pem.len()))
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    SharedAccessSignature(SasToken),
    X509(X509Identity),
}

impl Credential {
    pub fn sas_token(&self) -> Option<&SasToken> {
        match self {
            Credential::SharedAccessSignature(token) => Some(token),
            Credential::X509(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Renewable,
    NonRenewable,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn credential_kind(&self) -> CredentialKind;

    async fn current_credential(&self) -> Result<Credential, AuthError>;

    /// Produces fresh credential material. Only renewable providers support this.
    async fn renew(&self) -> Result<Credential, AuthError> {
        Err(AuthError::NotRenewable)
    }
}

type TokenSource = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<SasToken>> + Send + Sync>;

/// Renewable provider backed by a token-minting closure.
pub struct TokenAuthProvider {
    current: Mutex<SasToken>,
    source: TokenSource,
}

impl TokenAuthProvider {
    pub fn new<F>(initial: SasToken, source: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<SasToken>> + Send + Sync + 'static,
    {
        Self {
            current: Mutex::new(initial),
            source: Box::new(source),
        }
    }

    fn snapshot(&self) -> SasToken {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store(&self, token: SasToken) {
        match self.current.lock() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }
}

#[async_trait]
impl AuthProvider for TokenAuthProvider {
    fn credential_kind(&self) -> CredentialKind {
        CredentialKind::Renewable
    }

    async fn current_credential(&self) -> Result<Credential, AuthError> {
        Ok(Credential::SharedAccessSignature(self.snapshot()))
    }

    async fn renew(&self) -> Result<Credential, AuthError> {
        let token = (self.source)().await.map_err(AuthError::Source)?;
        debug!(expires_at = %token.expires_at(), "minted shared access signature");
        self.store(token.clone());
        Ok(Credential::SharedAccessSignature(token))
    }
}

/// Certificate-based identity; never renewed.
#[derive(Debug, Clone)]
pub struct X509AuthProvider {
    identity: X509Identity,
}

impl X509AuthProvider {
    pub fn new(identity: X509Identity) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl AuthProvider for X509AuthProvider {
    fn credential_kind(&self) -> CredentialKind {
        CredentialKind::NonRenewable
    }

    async fn current_credential(&self) -> Result<Credential, AuthError> {
        Ok(Credential::X509(self.identity.clone()))
    }
}
