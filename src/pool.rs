use bytes::Bytes;
use http::header::{
    CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION,
};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::body::{ProxyBody, ReplayableBody};
use crate::config::ProxyConfig;
use crate::credentials::Credential;
use crate::error::{ProxyError, ProxyResult};
use crate::http::{has_token, keep_alive_timeout};
use crate::net::{self, HostPort, Route};
use crate::scheme::{parse_challenges, AuthRequest, AuthState};

/// Pooled upstream connections, idle eviction and background tasks
pub struct ConnectionPool {
    config: Arc<ProxyConfig>,
    manager: Arc<ConnectionManager>,
    workers: CancellationToken,
    eviction: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Must be called from within a Tokio runtime.
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        let manager = Arc::new(ConnectionManager::new(&config));
        let eviction = config.eviction_enabled.then(|| {
            spawn_eviction(
                Arc::clone(&manager),
                config.eviction_period,
                config.max_connection_idle,
            )
        });
        info!(
            max_total = config.max_connections,
            max_per_route = config.max_connections_per_route,
            eviction = config.eviction_enabled,
            "Connection pool ready"
        );
        Self {
            config,
            manager,
            workers: CancellationToken::new(),
            eviction: Mutex::new(eviction),
        }
    }

    /// Client for forwarding requests through the upstream proxy. With
    /// `retries_allowed`, a request that fails on a stale pooled connection
    /// is resent once on a fresh one.
    pub fn http_client(&self, retries_allowed: bool) -> ProxyClient {
        ProxyClient {
            manager: Arc::clone(&self.manager),
            proxy: self.config.upstream.clone(),
            default_keep_alive: self.config.max_connection_idle,
            retries_allowed,
        }
    }

    /// Run `task` in the background until it finishes or the pool closes.
    pub fn execute_async<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancelled = self.workers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => debug!("Background task cancelled"),
                _ = task => {}
            }
        });
    }

    pub fn close_expired(&self) -> usize {
        self.manager.close_expired()
    }

    pub fn close_idle(&self, max_idle: Duration) -> usize {
        self.manager.close_idle(max_idle)
    }

    pub fn idle_count(&self) -> usize {
        self.manager.idle_count()
    }

    pub fn close(&self) {
        self.workers.cancel();
        info!("Background tasks cancelled");

        self.manager.shutdown();
        info!("Connection manager closed");

        if let Some(handle) = self.eviction.lock().take() {
            handle.abort();
            info!("Idle connection eviction stopped");
        }
    }
}

fn spawn_eviction(
    manager: Arc<ConnectionManager>,
    period: Duration,
    max_idle: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let expired = manager.close_expired();
            let idle = manager.close_idle(max_idle);
            if expired + idle > 0 {
                debug!(expired, idle, "Evicted pooled connections");
            }
        }
    })
}

struct Permits {
    _total: OwnedSemaphorePermit,
    _route: OwnedSemaphorePermit,
}

/// A live HTTP/1.1 connection to the upstream proxy. Dropping it closes
/// the connection and frees its pool slots.
pub struct Connection {
    route: Route,
    sender: SendRequest<ProxyBody>,
    reused: bool,
    permits: Option<Permits>,
    released: Arc<Notify>,
}

impl Connection {
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    async fn send(&mut self, request: Request<ProxyBody>) -> Result<Response<Incoming>, hyper::Error> {
        self.sender.ready().await?;
        self.sender.send_request(request).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.permits.take();
        self.released.notify_waiters();
    }
}

struct IdleConnection {
    connection: Connection,
    idle_since: Instant,
    expires_at: Instant,
}

struct ConnectionManager {
    idle: Mutex<HashMap<Route, Vec<IdleConnection>>>,
    routes: Mutex<HashMap<Route, Arc<Semaphore>>>,
    total: Arc<Semaphore>,
    max_per_route: usize,
    socket_buffer_size: usize,
    released: Arc<Notify>,
    closed: AtomicBool,
}

impl ConnectionManager {
    fn new(config: &ProxyConfig) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            total: Arc::new(Semaphore::new(config.max_connections)),
            max_per_route: config.max_connections_per_route,
            socket_buffer_size: config.socket_buffer_size,
            released: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> ProxyResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ProxyError::PoolClosed)
        } else {
            Ok(())
        }
    }

    fn route_slots(&self, route: &Route) -> Arc<Semaphore> {
        let mut routes = self.routes.lock();
        let slots = routes
            .entry(route.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_route)));
        Arc::clone(slots)
    }

    /// An idle connection for `route` if one is usable, else a new one once
    /// the route and total limits allow it.
    async fn lease(&self, route: &Route, reuse_idle: bool) -> ProxyResult<Connection> {
        let slots = self.route_slots(route);
        loop {
            self.ensure_open()?;
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if reuse_idle {
                if let Some(connection) = self.take_idle(route) {
                    debug!(%route, "Reusing pooled connection");
                    return Ok(connection);
                }
            }

            let route_permit = match Arc::clone(&slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::Closed) => return Err(ProxyError::PoolClosed),
                Err(TryAcquireError::NoPermits) => {
                    released.await;
                    continue;
                }
            };
            let total_permit = match Arc::clone(&self.total).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::Closed) => return Err(ProxyError::PoolClosed),
                Err(TryAcquireError::NoPermits) => {
                    drop(route_permit);
                    if !self.evict_oldest_idle() {
                        released.await;
                    }
                    continue;
                }
            };

            return self
                .connect(
                    route,
                    Permits {
                        _total: total_permit,
                        _route: route_permit,
                    },
                )
                .await;
        }
    }

    async fn connect(&self, route: &Route, permits: Permits) -> ProxyResult<Connection> {
        let stream = net::connect(&route.proxy, self.socket_buffer_size).await?;
        let (sender, connection) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(stream))
            .await?;

        let proxy = route.proxy.clone();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(%proxy, "Upstream connection error: {:?}", err);
            }
        });

        debug!(%route, "Opened upstream connection");
        Ok(self.adopt(route, sender, permits))
    }

    fn adopt(&self, route: &Route, sender: SendRequest<ProxyBody>, permits: Permits) -> Connection {
        Connection {
            route: route.clone(),
            sender,
            reused: false,
            permits: Some(permits),
            released: Arc::clone(&self.released),
        }
    }

    fn take_idle(&self, route: &Route) -> Option<Connection> {
        let now = Instant::now();
        let mut stale = Vec::new();
        let found = {
            let mut idle = self.idle.lock();
            let connections = idle.get_mut(route)?;
            let mut found = None;
            while let Some(candidate) = connections.pop() {
                if candidate.expires_at <= now || candidate.connection.sender.is_closed() {
                    stale.push(candidate);
                    continue;
                }
                found = Some(candidate.connection);
                break;
            }
            if connections.is_empty() {
                idle.remove(route);
            }
            found
        };
        drop(stale);
        found
    }

    /// Park a connection for reuse by later requests to the same route.
    fn release(&self, mut connection: Connection, keep_alive: Duration) {
        if self.closed.load(Ordering::Acquire) || connection.sender.is_closed() {
            return;
        }
        let now = Instant::now();
        connection.reused = true;
        let route = connection.route.clone();
        self.idle.lock().entry(route).or_default().push(IdleConnection {
            connection,
            idle_since: now,
            expires_at: now + keep_alive,
        });
        self.released.notify_waiters();
    }

    fn evict_oldest_idle(&self) -> bool {
        let oldest = {
            let mut idle = self.idle.lock();
            let oldest_route = idle
                .iter()
                .filter_map(|(route, list)| list.first().map(|c| (route.clone(), c.idle_since)))
                .min_by_key(|(_, since)| *since)
                .map(|(route, _)| route);
            oldest_route.and_then(|route| {
                let list = idle.get_mut(&route)?;
                let oldest = list.remove(0);
                if list.is_empty() {
                    idle.remove(&route);
                }
                Some(oldest)
            })
        };
        oldest.is_some()
    }

    fn evict_where<F>(&self, mut evict: F) -> usize
    where
        F: FnMut(&IdleConnection) -> bool,
    {
        let mut evicted = Vec::new();
        {
            let mut idle = self.idle.lock();
            for list in idle.values_mut() {
                let mut i = 0;
                while i < list.len() {
                    if evict(&list[i]) {
                        evicted.push(list.remove(i));
                    } else {
                        i += 1;
                    }
                }
            }
            idle.retain(|_, list| !list.is_empty());
        }
        let max_per_route = self.max_per_route;
        self.routes.lock().retain(|_, slots| {
            Arc::strong_count(slots) > 1 || slots.available_permits() < max_per_route
        });
        evicted.len()
    }

    fn close_expired(&self) -> usize {
        let now = Instant::now();
        self.evict_where(|c| c.expires_at <= now || c.connection.sender.is_closed())
    }

    fn close_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        self.evict_where(|c| now.duration_since(c.idle_since) > max_idle)
    }

    fn idle_count(&self) -> usize {
        self.idle.lock().values().map(Vec::len).sum()
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.total.close();
        for slots in self.routes.lock().values() {
            slots.close();
        }
        let idle = std::mem::take(&mut *self.idle.lock());
        drop(idle);
        self.released.notify_waiters();
    }
}

/// Response keep-alive policy: `None` when the connection must not be
/// reused, else how long it may idle.
pub fn keep_alive_duration(
    headers: &HeaderMap,
    version: Version,
    default: Duration,
) -> Option<Duration> {
    let connection_has = |token: &str| {
        has_token(headers, "connection", token) || has_token(headers, "proxy-connection", token)
    };
    if connection_has("close") {
        return None;
    }
    if version == Version::HTTP_10 && !connection_has("keep-alive") {
        return None;
    }
    headers
        .get("keep-alive")
        .and_then(|v| v.to_str().ok())
        .and_then(keep_alive_timeout)
        .or(Some(default))
}

/// Request to forward in absolute form through the upstream proxy
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl ForwardRequest {
    fn target(&self) -> ProxyResult<HostPort> {
        let host = self
            .uri
            .host()
            .ok_or_else(|| ProxyError::BadRequest(format!("no host in {}", self.uri)))?;
        let default_port = if self.uri.scheme_str() == Some("https") { 443 } else { 80 };
        Ok(HostPort::new(
            host.trim_start_matches('[').trim_end_matches(']'),
            self.uri.port_u16().unwrap_or(default_port),
        ))
    }

    fn build(
        &self,
        entity: &ReplayableBody,
        authorization: Option<&HeaderValue>,
    ) -> ProxyResult<Request<ProxyBody>> {
        let mut request = Request::new(entity.take_body()?);
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();

        let headers = request.headers_mut();
        *headers = self.headers.clone();
        if !headers.contains_key(HOST) {
            if let Some(authority) = self.uri.authority() {
                if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
                    headers.insert(HOST, host);
                }
            }
        }
        if let Some(content_type) = entity.content_type() {
            headers.insert(CONTENT_TYPE, content_type.clone());
        }
        if let Some(content_encoding) = entity.content_encoding() {
            headers.insert(CONTENT_ENCODING, content_encoding.clone());
        }
        match entity.content_length() {
            Some(length) if length > 0 || expects_body(&self.method) => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
            }
            _ => {}
        }
        if let Some(authorization) = authorization {
            headers.insert(PROXY_AUTHORIZATION, authorization.clone());
        }
        Ok(request)
    }
}

fn expects_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

fn is_stale_connection_error(err: &hyper::Error) -> bool {
    err.is_canceled() || err.is_closed() || err.is_incomplete_message()
}

/// Forwarding client over the shared pool. Holds no credentials of its
/// own, never follows redirects and keeps no cookies.
#[derive(Clone)]
pub struct ProxyClient {
    manager: Arc<ConnectionManager>,
    proxy: HostPort,
    default_keep_alive: Duration,
    retries_allowed: bool,
}

impl ProxyClient {
    /// Send `request` and answer proxy challenges with `credential` as long
    /// as the body can be resent.
    pub async fn execute(
        &self,
        request: &ForwardRequest,
        entity: &ReplayableBody,
        credential: &Credential,
    ) -> ProxyResult<ProxyResponse> {
        let route = Route::new(self.proxy.clone(), request.target()?);
        let uri = request.uri.to_string();
        let auth_request = AuthRequest {
            method: request.method.as_str(),
            uri: &uri,
            proxy_host: &self.proxy.host,
        };
        let mut auth = AuthState::new();
        let mut stale_retry = self.retries_allowed && entity.is_repeatable();
        let mut connection = self.manager.lease(&route, true).await?;

        loop {
            let outgoing = request.build(entity, auth.response_header())?;
            let mut response = match connection.send(outgoing).await {
                Ok(response) => response,
                Err(e) if stale_retry && connection.is_reused() && is_stale_connection_error(&e) => {
                    debug!(%route, "Stale pooled connection, retrying: {}", e);
                    stale_retry = false;
                    drop(connection);
                    connection = self.manager.lease(&route, false).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let keep_alive =
                keep_alive_duration(response.headers(), response.version(), self.default_keep_alive);

            if response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED && entity.is_repeatable() {
                let challenges = parse_challenges(
                    response
                        .headers()
                        .get_all(PROXY_AUTHENTICATE)
                        .iter()
                        .map(HeaderValue::as_bytes),
                );
                if auth.handle_challenge(&challenges, &auth_request, credential).await {
                    let drained = drain(response.body_mut()).await;
                    match (drained, keep_alive) {
                        (Ok(()), Some(_)) => {}
                        _ => {
                            drop(response);
                            drop(connection);
                            connection = self.manager.lease(&route, true).await?;
                        }
                    }
                    continue;
                }
            }

            debug!(%route, status = %response.status(), "Upstream response");
            let lease = Lease {
                connection,
                manager: Arc::clone(&self.manager),
                keep_alive,
            };
            return Ok(ProxyResponse {
                inner: response.map(|body| PooledBody::new(body, lease)),
            });
        }
    }
}

async fn drain(body: &mut Incoming) -> Result<(), hyper::Error> {
    while let Some(frame) = body.frame().await {
        frame?;
    }
    Ok(())
}

struct Lease {
    connection: Connection,
    manager: Arc<ConnectionManager>,
    keep_alive: Option<Duration>,
}

impl Lease {
    fn release(self) {
        match self.keep_alive {
            Some(keep_alive) => self.manager.release(self.connection, keep_alive),
            None => debug!(route = %self.connection.route, "Connection not reusable, closing"),
        }
    }
}

/// Response body that hands its connection back to the pool once the last
/// frame has been read. Dropping it earlier closes the connection.
pub struct PooledBody {
    inner: Incoming,
    lease: Option<Lease>,
}

impl PooledBody {
    fn new(inner: Incoming, lease: Lease) -> Self {
        let mut body = Self {
            inner,
            lease: Some(lease),
        };
        body.release_if_done();
        body
    }

    fn release_if_done(&mut self) {
        if self.inner.is_end_stream() {
            if let Some(lease) = self.lease.take() {
                lease.release();
            }
        }
    }
}

impl Body for PooledBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                if let Some(lease) = this.lease.take() {
                    lease.release();
                }
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(frame))) => {
                this.release_if_done();
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                if this.lease.take().is_some() {
                    debug!("Discarding connection after body error: {}", e);
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Upstream response still attached to its pooled connection. Dropping it
/// before the body ends closes the connection; reading the body to its end
/// returns it to the pool.
pub struct ProxyResponse {
    inner: Response<PooledBody>,
}

impl ProxyResponse {
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// The response with a body that streams from the pooled connection.
    pub fn into_inner(self) -> Response<PooledBody> {
        self.inner
    }
}

#[cfg(test)]
impl ProxyResponse {
    /// Reason phrase as sent by the proxy, else the canonical one.
    pub fn reason(&self) -> String {
        match self.inner.extensions().get::<hyper::ext::ReasonPhrase>() {
            Some(reason) => String::from_utf8_lossy(reason.as_bytes()).into_owned(),
            None => self
                .inner
                .status()
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// Next piece of the de-chunked body; `None` at the end.
    pub async fn next_data(&mut self) -> Option<Result<Bytes, hyper::Error>> {
        loop {
            match self.inner.body_mut().frame().await? {
                Ok(frame) => {
                    if let Ok(data) = frame.into_data() {
                        return Some(Ok(data));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
