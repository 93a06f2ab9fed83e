//! Credential provider port
//!
//! Credential acquisition (OAuth flows, keychains) is the host's problem;
//! the engine only needs something that signs requests and reports
//! invalidation. Invalidation ends the run fatally and pauses the folder.

/// A credential the remote adapter attaches to each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { user: String, password: String },
    Bearer(String),
}

/// Port trait for request signing.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The credential to sign the next request with. May refresh behind
    /// the scenes; fails only when no valid credential can be produced.
    async fn credential(&self) -> anyhow::Result<Credential>;

    /// Called by the remote adapter when the server rejected the
    /// credential (401). Subsequent `is_valid()` must return false until
    /// the host re-authenticates.
    fn report_invalidated(&self);

    fn is_valid(&self) -> bool;
}

/// Static credentials, mainly for tests and trusted environments.
pub struct StaticCredentials {
    credential: Credential,
    valid: std::sync::atomic::AtomicBool,
}

impl StaticCredentials {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            valid: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(Credential::Basic {
            user: user.into(),
            password: password.into(),
        })
    }
}

#[async_trait::async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential(&self) -> anyhow::Result<Credential> {
        if !self.is_valid() {
            anyhow::bail!("credentials were invalidated");
        }
        Ok(self.credential.clone())
    }

    fn report_invalidated(&self) {
        self.valid
            .store(false, std::sync::atomic::Ordering::Release);
    }

    fn is_valid(&self) -> bool {
        self.valid.load(std::sync::atomic::Ordering::Acquire)
    }
}
