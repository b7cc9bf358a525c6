//! Stubs shared by the unit tests.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::config::{Identity, ProxyConfig};
use crate::credentials::{
    AuthError, AuthResult, Credential, CredentialManager, KdcDiscovery, KerberosLogin,
    LoginTicket, SecurityContext,
};
use crate::http::has_token;
use crate::net::HostPort;

pub const STUB_TOKEN: &[u8] = b"stub-gss-token";

#[derive(Debug)]
pub struct StubContext {
    principal: String,
    logouts: Arc<AtomicUsize>,
    fail_logout: bool,
}

impl StubContext {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            logouts: Arc::new(AtomicUsize::new(0)),
            fail_logout: false,
        }
    }
}

#[async_trait]
impl SecurityContext for StubContext {
    fn principal(&self) -> &str {
        &self.principal
    }

    fn service_token(&self, _host: &str) -> AuthResult<Vec<u8>> {
        Ok(STUB_TOKEN.to_vec())
    }

    async fn logout(&self) -> AuthResult<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        if self.fail_logout {
            return Err(AuthError::GeneralSecurityFailure("logout refused".into()));
        }
        Ok(())
    }
}

pub struct StubDiscovery {
    kdcs: Vec<String>,
    pub calls: AtomicUsize,
}

impl StubDiscovery {
    pub fn new(kdcs: &[&str]) -> Self {
        Self {
            kdcs: kdcs.iter().map(|k| k.to_string()).collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl KdcDiscovery for StubDiscovery {
    async fn discover(&self, _domain: &str) -> io::Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.kdcs.clone())
    }
}

pub struct StubLogin {
    pub logins: AtomicUsize,
    pub logouts: Arc<AtomicUsize>,
    pub attempts: Mutex<Vec<Option<String>>>,
    failing: Vec<String>,
    fail_always: bool,
    fail_logout: bool,
    delay: Duration,
    lifetime: Duration,
}

impl StubLogin {
    pub fn new() -> Self {
        Self {
            logins: AtomicUsize::new(0),
            logouts: Arc::new(AtomicUsize::new(0)),
            attempts: Mutex::new(Vec::new()),
            failing: Vec::new(),
            fail_always: false,
            fail_logout: false,
            delay: Duration::ZERO,
            lifetime: Duration::from_secs(3600),
        }
    }

    pub fn failing_on(mut self, kdcs: &[&str]) -> Self {
        self.failing = kdcs.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn failing_always(mut self) -> Self {
        self.fail_always = true;
        self
    }

    pub fn with_failing_logout(mut self) -> Self {
        self.fail_logout = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }
}

#[async_trait]
impl KerberosLogin for StubLogin {
    async fn login(&self, identity: &Identity, kdc: Option<&str>) -> AuthResult<LoginTicket> {
        self.attempts.lock().push(kdc.map(str::to_string));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let rejected = self.fail_always || kdc.is_some_and(|k| self.failing.iter().any(|f| f == k));
        if rejected {
            return Err(AuthError::GeneralSecurityFailure(format!(
                "pre-authentication failed at {}",
                kdc.unwrap_or("configured KDC")
            )));
        }
        self.logins.fetch_add(1, Ordering::SeqCst);
        let context = StubContext {
            principal: identity.principal(),
            logouts: self.logouts.clone(),
            fail_logout: self.fail_logout,
        };
        Ok(LoginTicket {
            context: Arc::new(context),
            end_time: SystemTime::now() + self.lifetime,
        })
    }
}

/// A valid credential backed by [`StubContext`].
pub fn stub_credential() -> Arc<Credential> {
    let identity = Identity::new("alice", "corp.example.com", "secret");
    let context = Arc::new(StubContext::new(identity.principal()));
    Arc::new(Credential::new(
        identity,
        context,
        SystemTime::now() + Duration::from_secs(3600),
    ))
}

/// A credential manager whose logins always succeed.
pub fn stub_credentials(config: &ProxyConfig) -> Arc<CredentialManager> {
    Arc::new(CredentialManager::new(
        config,
        Arc::new(StubDiscovery::new(&["kdc.test"])),
        Arc::new(StubLogin::new()),
    ))
}

/// A request seen by [`fake_upstream`].
#[derive(Debug)]
pub struct Recorded {
    /// Index of the accepted connection it arrived on.
    pub connection: usize,
    pub method: String,
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Plain HTTP upstream that answers each request with the next canned
/// response, then resolves to the requests it saw. A response carrying
/// `Connection: close` ends its connection.
pub async fn fake_upstream(responses: &[&'static str]) -> (HostPort, JoinHandle<Vec<Recorded>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = HostPort::new("127.0.0.1", listener.local_addr().unwrap().port());
    let responses = responses.to_vec();
    let handle = tokio::spawn(async move {
        let mut recorded = Vec::new();
        let mut responses = responses.into_iter().peekable();
        let mut connection = 0;
        while responses.peek().is_some() {
            let (stream, _) = listener.accept().await.unwrap();
            let mut wire = Wire {
                stream,
                buf: BytesMut::new(),
            };
            while let Some(response) = responses.peek().copied() {
                let Some((method, target, headers)) = wire.head().await else {
                    break;
                };
                let Some(body) = wire.body(&headers).await else {
                    break;
                };
                recorded.push(Recorded {
                    connection,
                    method,
                    target,
                    headers,
                    body,
                });
                wire.stream.write_all(response.as_bytes()).await.unwrap();
                responses.next();
                if response.contains("Connection: close") {
                    break;
                }
            }
            connection += 1;
        }
        recorded
    });
    (upstream, handle)
}

const MAX_HEAD: usize = 64 * 1024;

struct Wire {
    stream: TcpStream,
    buf: BytesMut,
}

impl Wire {
    async fn fill(&mut self) -> Option<()> {
        match self.stream.read_buf(&mut self.buf).await {
            Ok(n) if n > 0 => Some(()),
            _ => None,
        }
    }

    async fn head(&mut self) -> Option<(String, String, HeaderMap)> {
        loop {
            let parsed = {
                let mut slots = [httparse::EMPTY_HEADER; 64];
                let mut request = httparse::Request::new(&mut slots);
                match request.parse(&self.buf).ok()? {
                    httparse::Status::Complete(len) => {
                        let mut headers = HeaderMap::new();
                        for header in request.headers.iter() {
                            headers.append(
                                HeaderName::from_bytes(header.name.as_bytes()).ok()?,
                                HeaderValue::from_bytes(header.value).ok()?,
                            );
                        }
                        let method = request.method?.to_string();
                        let target = request.path?.to_string();
                        Some((len, method, target, headers))
                    }
                    httparse::Status::Partial => None,
                }
            };
            if let Some((len, method, target, headers)) = parsed {
                let _ = self.buf.split_to(len);
                return Some((method, target, headers));
            }
            if self.buf.len() > MAX_HEAD {
                return None;
            }
            self.fill().await?;
        }
    }

    async fn body(&mut self, headers: &HeaderMap) -> Option<Bytes> {
        if has_token(headers, "transfer-encoding", "chunked") {
            let mut body = BytesMut::new();
            loop {
                let line = self.line().await?;
                let size = line.split(';').next()?.trim();
                let size = usize::from_str_radix(size, 16).ok()?;
                if size == 0 {
                    while !self.line().await?.is_empty() {}
                    return Some(body.freeze());
                }
                body.extend_from_slice(&self.take(size).await?);
                self.line().await?;
            }
        }
        let length = headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        self.take(length).await
    }

    async fn take(&mut self, n: usize) -> Option<Bytes> {
        while self.buf.len() < n {
            self.fill().await?;
        }
        Some(self.buf.split_to(n).freeze())
    }

    async fn line(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos + 2);
                return Some(String::from_utf8_lossy(&line[..pos]).into_owned());
            }
            self.fill().await?;
        }
    }
}
