use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Identity, ProxyConfig};

/// Error type for credential acquisition
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no KDC found for domain {domain}")]
    KdcNotFound { domain: String },

    #[error("login against KDC {kdc} failed: {source}")]
    InvalidKdc {
        kdc: String,
        #[source]
        source: Box<AuthError>,
    },

    #[error("KDC discovery could not run: {0}")]
    DiscoveryExecutionFailed(#[source] io::Error),

    #[error("security failure: {0}")]
    GeneralSecurityFailure(String),
}

/// Result type for credential operations
pub type AuthResult<T> = Result<T, AuthError>;

/// A logged-in Kerberos identity able to mint service tokens
#[async_trait]
pub trait SecurityContext: Send + Sync + fmt::Debug {
    fn principal(&self) -> &str;

    /// Initial GSS token for the service `HTTP/<host>`. Blocking; call it
    /// from `spawn_blocking`.
    fn service_token(&self, host: &str) -> AuthResult<Vec<u8>>;

    /// Release the tickets held by this context.
    async fn logout(&self) -> AuthResult<()>;
}

/// Result of a successful login
pub struct LoginTicket {
    pub context: Arc<dyn SecurityContext>,
    pub end_time: SystemTime,
}

/// Finds KDC host names for a domain. An empty list means none exist.
#[async_trait]
pub trait KdcDiscovery: Send + Sync {
    async fn discover(&self, domain: &str) -> io::Result<Vec<String>>;
}

/// Password login against a KDC. `kdc` forces a specific KDC; `None` uses
/// whatever the static configuration names.
#[async_trait]
pub trait KerberosLogin: Send + Sync {
    async fn login(&self, identity: &Identity, kdc: Option<&str>) -> AuthResult<LoginTicket>;
}

/// Security context plus the instant after which it must be renewed
#[derive(Debug)]
pub struct Credential {
    identity: Identity,
    context: Arc<dyn SecurityContext>,
    valid_until: SystemTime,
}

impl Credential {
    pub fn new(identity: Identity, context: Arc<dyn SecurityContext>, valid_until: SystemTime) -> Self {
        Self {
            identity,
            context,
            valid_until,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn context(&self) -> &Arc<dyn SecurityContext> {
        &self.context
    }

    pub fn valid_until(&self) -> SystemTime {
        self.valid_until
    }

    pub fn is_valid(&self) -> bool {
        SystemTime::now() < self.valid_until
    }
}

/// Owns the process-wide credential and serializes logins.
pub struct CredentialManager {
    identity: Identity,
    static_kdc: bool,
    threshold: Duration,
    discovery: Arc<dyn KdcDiscovery>,
    backend: Arc<dyn KerberosLogin>,
    current: RwLock<Option<Arc<Credential>>>,
    login_lock: Mutex<()>,
}

impl CredentialManager {
    pub fn new(
        config: &ProxyConfig,
        discovery: Arc<dyn KdcDiscovery>,
        backend: Arc<dyn KerberosLogin>,
    ) -> Self {
        Self {
            identity: config.identity.clone(),
            static_kdc: config.has_static_kdc(),
            threshold: config.ticket_threshold,
            discovery,
            backend,
            current: RwLock::new(None),
            login_lock: Mutex::new(()),
        }
    }

    /// The current credential, if it is still valid.
    pub fn current(&self) -> Option<Arc<Credential>> {
        self.current
            .read()
            .as_ref()
            .filter(|credential| credential.is_valid())
            .cloned()
    }

    /// Return a valid credential, logging in if there is none.
    pub async fn authenticate(&self) -> AuthResult<Arc<Credential>> {
        if let Some(credential) = self.current() {
            return Ok(credential);
        }

        let _login = self.login_lock.lock().await;
        if let Some(credential) = self.current() {
            return Ok(credential);
        }

        let ticket = self.login().await?;
        let now = SystemTime::now();
        let valid_until = match ticket.end_time.checked_sub(self.threshold) {
            Some(renew_at) if renew_at > now => renew_at,
            _ => {
                warn!(
                    principal = ticket.context.principal(),
                    "Ticket lifetime is shorter than the renewal threshold"
                );
                ticket.end_time
            }
        };

        let credential = Arc::new(Credential::new(
            self.identity.clone(),
            ticket.context,
            valid_until,
        ));
        let previous = self.current.write().replace(Arc::clone(&credential));

        info!(
            principal = credential.context().principal(),
            valid_for_secs = valid_until.duration_since(now).unwrap_or_default().as_secs(),
            "Authenticated"
        );

        if let Some(previous) = previous {
            logout_quietly(&previous).await;
        }
        Ok(credential)
    }

    /// Run `action` with a valid credential.
    pub async fn execute_privileged<F, Fut, T, E>(&self, action: F) -> Result<T, E>
    where
        F: FnOnce(Arc<Credential>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AuthError>,
    {
        let credential = self.authenticate().await?;
        action(credential).await
    }

    /// Drop the current credential so the next call logs in again.
    pub async fn invalidate(&self) {
        let _login = self.login_lock.lock().await;
        let previous = self.current.write().take();
        if let Some(previous) = previous {
            debug!(principal = previous.context().principal(), "Credential invalidated");
            logout_quietly(&previous).await;
        }
    }

    /// Log out and forget the current credential.
    pub async fn close(&self) {
        let previous = self.current.write().take();
        match previous {
            Some(previous) => {
                logout_quietly(&previous).await;
                info!(principal = previous.context().principal(), "Logged out");
            }
            None => debug!("No credential to release"),
        }
    }

    async fn login(&self) -> AuthResult<LoginTicket> {
        if self.static_kdc {
            debug!(principal = %self.identity.principal(), "Logging in with configured KDC");
            return self.backend.login(&self.identity, None).await;
        }

        let domain = self.identity.domain.as_str();
        let kdcs = self
            .discovery
            .discover(domain)
            .await
            .map_err(AuthError::DiscoveryExecutionFailed)?;
        if kdcs.is_empty() {
            return Err(AuthError::KdcNotFound {
                domain: domain.to_string(),
            });
        }
        debug!(domain, candidates = ?kdcs, "Discovered KDCs");

        let mut last_failure = None;
        for kdc in kdcs {
            match self.backend.login(&self.identity, Some(&kdc)).await {
                Ok(ticket) => {
                    info!(%kdc, principal = %self.identity.principal(), "Logged in");
                    return Ok(ticket);
                }
                Err(e) => {
                    warn!(%kdc, "Login failed: {}", e);
                    last_failure = Some((kdc, e));
                }
            }
        }

        match last_failure {
            Some((kdc, source)) => Err(AuthError::InvalidKdc {
                kdc,
                source: Box::new(source),
            }),
            None => Err(AuthError::KdcNotFound {
                domain: domain.to_string(),
            }),
        }
    }
}

async fn logout_quietly(credential: &Credential) {
    if let Err(e) = credential.context().logout().await {
        warn!(
            principal = credential.context().principal(),
            "Logout failed: {}", e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use crate::net::HostPort;
    use crate::testing::{StubDiscovery, StubLogin};
    use std::sync::atomic::Ordering;

    fn config() -> ProxyConfig {
        ProxyConfig::for_tests(HostPort::new("proxy.test", 3128))
    }

    fn manager(
        config: &ProxyConfig,
        discovery: &Arc<StubDiscovery>,
        login: &Arc<StubLogin>,
    ) -> Arc<CredentialManager> {
        Arc::new(CredentialManager::new(config, discovery.clone(), login.clone()))
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_login() {
        let discovery = Arc::new(StubDiscovery::new(&["kdc1"]));
        let login = Arc::new(StubLogin::new().with_delay(Duration::from_millis(50)));
        let manager = manager(&config(), &discovery, &login);

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.authenticate().await })
            })
            .collect();
        let credentials: Vec<Arc<Credential>> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(login.logins.load(Ordering::SeqCst), 1);
        assert!(credentials.iter().all(|c| Arc::ptr_eq(c, &credentials[0])));
    }

    #[tokio::test]
    async fn no_discovered_kdc_fails_without_login() {
        let discovery = Arc::new(StubDiscovery::new(&[]));
        let login = Arc::new(StubLogin::new());
        let manager = manager(&config(), &discovery, &login);

        let err = manager.authenticate().await.unwrap_err();
        assert!(matches!(err, AuthError::KdcNotFound { ref domain } if domain == "corp.example.com"));
        assert_eq!(login.logins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn falls_back_to_next_kdc() {
        let discovery = Arc::new(StubDiscovery::new(&["A", "B"]));
        let login = Arc::new(StubLogin::new().failing_on(&["A"]));
        let manager = manager(&config(), &discovery, &login);

        let credential = manager.authenticate().await.unwrap();
        assert!(credential.is_valid());
        assert_eq!(
            *login.attempts.lock(),
            vec![Some("A".to_string()), Some("B".to_string())]
        );
    }

    #[tokio::test]
    async fn all_kdcs_failing_names_the_last() {
        let discovery = Arc::new(StubDiscovery::new(&["A", "B"]));
        let login = Arc::new(StubLogin::new().failing_on(&["A", "B"]));
        let manager = manager(&config(), &discovery, &login);

        match manager.authenticate().await.unwrap_err() {
            AuthError::InvalidKdc { kdc, source } => {
                assert_eq!(kdc, "B");
                assert!(matches!(*source, AuthError::GeneralSecurityFailure(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn static_kdc_skips_discovery_and_surfaces_error() {
        let mut config = config();
        config.kdc = Some("kdc.static".to_string());
        let discovery = Arc::new(StubDiscovery::new(&["ignored"]));
        let login = Arc::new(StubLogin::new().failing_always());
        let manager = manager(&config, &discovery, &login);

        let err = manager.authenticate().await.unwrap_err();
        assert!(matches!(err, AuthError::GeneralSecurityFailure(_)));
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*login.attempts.lock(), vec![None]);
    }

    #[tokio::test]
    async fn validity_ends_threshold_before_ticket_expiry() {
        let discovery = Arc::new(StubDiscovery::new(&["kdc1"]));
        let login = Arc::new(StubLogin::new().with_lifetime(Duration::from_secs(600)));
        let manager = manager(&config(), &discovery, &login);

        let credential = manager.authenticate().await.unwrap();
        let remaining = credential
            .valid_until()
            .duration_since(SystemTime::now())
            .unwrap();
        assert!(remaining <= Duration::from_secs(540));
        assert!(remaining > Duration::from_secs(530));
    }

    #[tokio::test]
    async fn invalidate_forces_new_login() {
        let discovery = Arc::new(StubDiscovery::new(&["kdc1"]));
        let login = Arc::new(StubLogin::new());
        let manager = manager(&config(), &discovery, &login);

        let first = manager.authenticate().await.unwrap();
        let again = manager.authenticate().await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        manager.invalidate().await;
        let second = manager.authenticate().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(login.logins.load(Ordering::SeqCst), 2);
        assert_eq!(login.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_swallows_logout_failure() {
        let discovery = Arc::new(StubDiscovery::new(&["kdc1"]));
        let login = Arc::new(StubLogin::new().with_failing_logout());
        let manager = manager(&config(), &discovery, &login);

        manager.authenticate().await.unwrap();
        manager.close().await;
        assert_eq!(login.logouts.load(Ordering::SeqCst), 1);
        assert!(manager.current().is_none());

        // closing twice is harmless
        manager.close().await;
    }

    #[tokio::test]
    async fn execute_privileged_converts_auth_errors() {
        let discovery = Arc::new(StubDiscovery::new(&[]));
        let login = Arc::new(StubLogin::new());
        let manager = manager(&config(), &discovery, &login);

        let result: Result<(), ProxyError> = manager
            .execute_privileged(|_credential| async { Ok(()) })
            .await;
        assert!(matches!(
            result,
            Err(ProxyError::Auth(AuthError::KdcNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn execute_privileged_passes_credential() {
        let discovery = Arc::new(StubDiscovery::new(&["kdc1"]));
        let login = Arc::new(StubLogin::new());
        let manager = manager(&config(), &discovery, &login);

        let principal: Result<String, AuthError> = manager
            .execute_privileged(|credential| async move {
                Ok(credential.context().principal().to_string())
            })
            .await;
        assert_eq!(principal.unwrap(), "alice@CORP.EXAMPLE.COM");
    }
}
