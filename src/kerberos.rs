//! Password login through `kinit`, with tickets kept in a private file
//! credential cache.
//!
//! The cache and the generated configuration live at fixed paths in the
//! work directory. Both are exported to the environment once at startup,
//! before the runtime spawns any thread; renewed logins overwrite the same
//! cache.

use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::ccache::CredentialCache;
use crate::config::{Identity, ProxyConfig};
use crate::credentials::{AuthError, AuthResult, KerberosLogin, LoginTicket, SecurityContext};

const SYSTEM_KRB5_CONF: &str = "/etc/krb5.conf";

/// Logs in by running `kinit` against the cache file in the work directory.
#[derive(Debug)]
pub struct KinitLogin {
    kdc: Option<String>,
    cache: PathBuf,
    generated_config: PathBuf,
    config_path: OsString,
    generation: Arc<AtomicU64>,
}

impl KinitLogin {
    pub fn new(config: &ProxyConfig) -> io::Result<Self> {
        std::fs::create_dir_all(&config.work_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&config.work_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let pid = std::process::id();
        let generated_config = config.work_dir.join(format!("krb5_{}.conf", pid));
        let base = match config.krb5_conf.as_ref() {
            Some(path) => path.as_os_str().to_owned(),
            None => std::env::var_os("KRB5_CONFIG").unwrap_or_else(|| SYSTEM_KRB5_CONF.into()),
        };
        // the generated file is read first and may be absent
        let mut search = vec![generated_config.clone()];
        search.extend(std::env::split_paths(&base));
        let config_path = std::env::join_paths(search)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        Ok(Self {
            kdc: config.kdc.clone(),
            cache: config.work_dir.join(format!("krb5cc_{}", pid)),
            generated_config,
            config_path,
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Point `kinit` and the GSSAPI library at the private cache and
    /// configuration. Call before any other thread is running.
    pub fn export_environment(&self) {
        std::env::set_var("KRB5CCNAME", cache_name(&self.cache));
        std::env::set_var("KRB5_CONFIG", &self.config_path);
        debug!(cache = %self.cache.display(), "Kerberos environment exported");
    }

    /// Write the configuration naming the forced KDC, or remove a stale one
    /// so the base configuration applies.
    async fn write_config(&self, realm: &str, kdc: Option<&str>) -> io::Result<()> {
        match kdc.or(self.kdc.as_deref()) {
            Some(kdc) => tokio::fs::write(&self.generated_config, render_krb5_conf(realm, kdc)).await,
            None => match tokio::fs::remove_file(&self.generated_config).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
        }
    }

    async fn run_kinit(&self, principal: &str, password: &str) -> AuthResult<()> {
        let mut command = Command::new("kinit");
        command
            .arg("-c")
            .arg(cache_name(&self.cache))
            .arg(principal)
            .env("KRB5_CONFIG", &self.config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| AuthError::GeneralSecurityFailure(format!("cannot run kinit: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            let line = format!("{}\n", password);
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                debug!("kinit closed stdin early: {}", e);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AuthError::GeneralSecurityFailure(format!("kinit did not finish: {}", e)))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(AuthError::GeneralSecurityFailure(format!(
            "kinit for {} failed ({}): {}",
            principal,
            output.status,
            stderr.trim()
        )))
    }

    fn context(&self, principal: String) -> KerberosContext {
        KerberosContext {
            principal,
            cache: self.cache.clone(),
            generated_config: self.generated_config.clone(),
            generation: self.generation.fetch_add(1, Ordering::AcqRel) + 1,
            current: Arc::clone(&self.generation),
        }
    }
}

#[async_trait]
impl KerberosLogin for KinitLogin {
    async fn login(&self, identity: &Identity, kdc: Option<&str>) -> AuthResult<LoginTicket> {
        let realm = identity.realm();
        let principal = identity.principal();

        self.write_config(&realm, kdc)
            .await
            .map_err(|e| AuthError::GeneralSecurityFailure(format!("cannot write krb5.conf: {}", e)))?;
        self.run_kinit(&principal, &identity.password).await?;

        let end_time = CredentialCache::read_file(&self.cache)
            .await
            .map_err(|e| AuthError::GeneralSecurityFailure(e.to_string()))?
            .ticket_end_time(&realm)
            .ok_or_else(|| {
                AuthError::GeneralSecurityFailure(format!(
                    "credential cache for {} holds no ticket",
                    principal
                ))
            })?;

        let context = self.context(principal);
        debug!(principal = %context.principal, generation = context.generation, "Ticket acquired");
        Ok(LoginTicket {
            context: Arc::new(context),
            end_time,
        })
    }
}

fn cache_name(cache: &Path) -> String {
    format!("FILE:{}", cache.display())
}

fn render_krb5_conf(realm: &str, kdc: &str) -> String {
    format!(
        "[libdefaults]\n\
         \tdefault_realm = {realm}\n\
         \tdns_lookup_kdc = false\n\
         \tdns_lookup_realm = false\n\
         \trdns = false\n\
         \n\
         [realms]\n\
         \t{realm} = {{\n\
         \t\tkdc = {kdc}\n\
         \t}}\n"
    )
}

/// Tickets of one login, held in the private cache file until a newer
/// login overwrites it
#[derive(Debug)]
pub struct KerberosContext {
    principal: String,
    cache: PathBuf,
    generated_config: PathBuf,
    generation: u64,
    current: Arc<AtomicU64>,
}

impl KerberosContext {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.generation
    }
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), "Cannot remove file: {}", e);
        }
    }
}

#[async_trait]
impl SecurityContext for KerberosContext {
    fn principal(&self) -> &str {
        &self.principal
    }

    fn service_token(&self, host: &str) -> AuthResult<Vec<u8>> {
        service_token(&self.principal, host)
    }

    async fn logout(&self) -> AuthResult<()> {
        if !self.is_current() {
            debug!(principal = %self.principal, generation = self.generation, "Cache already holds a newer login");
            return Ok(());
        }
        match tokio::fs::remove_file(&self.cache).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(AuthError::GeneralSecurityFailure(format!(
                    "cannot destroy {}: {}",
                    self.cache.display(),
                    e
                )))
            }
        }
        remove_if_present(&self.generated_config).await;
        Ok(())
    }
}

#[cfg(feature = "gssapi")]
fn service_token(principal: &str, host: &str) -> AuthResult<Vec<u8>> {
    use cross_krb5::{ClientCtx, InitiateFlags};

    let service = format!("HTTP/{}", host);
    let (_pending, token) = ClientCtx::new(InitiateFlags::empty(), Some(principal), &service, None)
        .map_err(|e| {
            AuthError::GeneralSecurityFailure(format!("cannot create token for {}: {}", service, e))
        })?;
    Ok(token.to_vec())
}

#[cfg(not(feature = "gssapi"))]
fn service_token(_principal: &str, host: &str) -> AuthResult<Vec<u8>> {
    Err(AuthError::GeneralSecurityFailure(format!(
        "cannot create token for HTTP/{}: built without the gssapi feature",
        host
    )))
}
