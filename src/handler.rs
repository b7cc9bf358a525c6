use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use http::request::Parts;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::body::{ProxyBody, ReplayableBody};
use crate::error::{ProxyError, ProxyResult};
use crate::http::{strip_chunked, tokens};
use crate::net::HostPort;
use crate::pool::{ConnectionPool, ForwardRequest, ProxyResponse};
use crate::repeater::repeat;
use crate::server::ProxyServices;
use crate::tunnel::Established;

/// Largest request head accepted from a local client.
const MAX_HEAD: usize = 64 * 1024;

/// Request headers that are recomputed from the entity or only concern the
/// hop to this proxy.
const DROPPED_HEADERS: [&str; 8] = [
    "content-length",
    "content-type",
    "content-encoding",
    "transfer-encoding",
    "proxy-authorization",
    "proxy-connection",
    "connection",
    "keep-alive",
];

/// Response headers that only concern the hop from the upstream proxy.
const HOP_RESPONSE_HEADERS: [&str; 3] = ["connection", "proxy-connection", "keep-alive"];

/// Tunnel whose local side is handed over once the CONNECT answer is out.
struct PendingTunnel {
    target: HostPort,
    local: OnUpgrade,
    upstream: TokioIo<Upgraded>,
}

type TunnelSlot = Arc<Mutex<Option<PendingTunnel>>>;

/// Serves one request on one accepted local connection.
pub struct RequestHandler {
    services: Arc<ProxyServices>,
    connection: Option<(TcpStream, SocketAddr)>,
    bound: bool,
}

impl RequestHandler {
    pub fn new(services: Arc<ProxyServices>) -> Self {
        Self {
            services,
            connection: None,
            bound: false,
        }
    }

    pub fn bind(&mut self, stream: TcpStream, peer: SocketAddr) -> ProxyResult<()> {
        if self.bound {
            return Err(ProxyError::AlreadyBound);
        }
        self.bound = true;
        self.connection = Some((stream, peer));
        Ok(())
    }

    /// Read and serve the request, then relay the tunnel if it opened one.
    /// Failures are logged; the local connection is closed in every case.
    pub async fn handle_request(&mut self) {
        let Some((stream, peer)) = self.connection.take() else {
            warn!("No connection bound to handler");
            return;
        };

        let slot: TunnelSlot = Arc::new(Mutex::new(None));
        let service = {
            let services = Arc::clone(&self.services);
            let slot = Arc::clone(&slot);
            service_fn(move |req| {
                let services = Arc::clone(&services);
                let slot = Arc::clone(&slot);
                async move { Ok::<_, Infallible>(respond(&services, req, &slot, peer).await) }
            })
        };

        let served = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .keep_alive(false)
            .max_buf_size(MAX_HEAD)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await;
        if let Err(e) = served {
            let e = if e.is_incomplete_message() {
                ProxyError::ConnectionClosed
            } else {
                ProxyError::Http(e)
            };
            if e.is_disconnect() {
                debug!(%peer, "Client went away: {}", e);
            } else {
                warn!(%peer, "Connection failed: {}", e);
            }
        }

        let pending = slot.lock().take();
        if let Some(tunnel) = pending {
            tunnel.run(&self.services.pool).await;
        }
    }
}

async fn respond(
    services: &ProxyServices,
    req: Request<Incoming>,
    slot: &TunnelSlot,
    peer: SocketAddr,
) -> Response<ProxyBody> {
    debug!(%peer, method = %req.method(), uri = %req.uri(), "Request received");
    let result = if req.method() == Method::CONNECT {
        connect(services, req, slot).await
    } else {
        forward(services, req).await
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            if e.is_disconnect() {
                debug!(%peer, "Client went away: {}", e);
            } else {
                warn!(%peer, "Request failed: {}", e);
            }
            error_response(&e)
        }
    }
}

async fn connect(
    services: &ProxyServices,
    mut req: Request<Incoming>,
    slot: &TunnelSlot,
) -> ProxyResult<Response<ProxyBody>> {
    let target = req
        .uri()
        .authority()
        .and_then(|authority| HostPort::parse(authority.as_str(), 80))
        .ok_or_else(|| ProxyError::BadRequest(format!("invalid CONNECT target {:?}", req.uri().to_string())))?;
    let proxy = &services.config.upstream;
    let tunnel = &services.tunnel;
    let version = req.version();

    let established = {
        let target = &target;
        services
            .credentials
            .execute_privileged(|credential| async move {
                tunnel.tunnel(proxy, target, version, &credential).await
            })
            .await
    };

    let Established { head, stream } = match established {
        Ok(established) => established,
        Err(ProxyError::TunnelRefused(refused)) => {
            info!(%target, status = %refused.head.status, "Tunnel refused by upstream proxy");
            return Ok(refused.into_response());
        }
        Err(e) => return Err(e),
    };

    debug!(%target, "Tunnel established");
    *slot.lock() = Some(PendingTunnel {
        target,
        local: hyper::upgrade::on(&mut req),
        upstream: stream,
    });
    Ok(Response::from_parts(head, empty()))
}

async fn forward(services: &ProxyServices, req: Request<Incoming>) -> ProxyResult<Response<ProxyBody>> {
    let (parts, body) = req.into_parts();
    let request = forward_request(&parts)?;
    let entity = ReplayableBody::new(body).await?.with_entity_headers(
        parts.headers.get(CONTENT_TYPE).cloned(),
        parts.headers.get(CONTENT_ENCODING).cloned(),
    );

    let retries_allowed = entity.is_repeatable();
    let max_attempts = services.config.repeats_on_failure;
    let client = services.pool.http_client(retries_allowed);
    debug!(uri = %request.uri, repeatable = retries_allowed, "Forwarding request");

    let credentials = &services.credentials;
    let response = {
        let (client, request, entity) = (&client, &request, &entity);
        credentials
            .execute_privileged(|credential| async move {
                if !retries_allowed {
                    return client.execute(request, entity, &credential).await;
                }
                let outcome = repeat(
                    || client.execute(request, entity, &credential),
                    |response: &ProxyResponse| {
                        response.status() != StatusCode::PROXY_AUTHENTICATION_REQUIRED
                    },
                    max_attempts,
                )
                .await?;
                if !outcome.is_accepted() {
                    warn!(uri = %request.uri, attempts = max_attempts, "Upstream proxy kept asking for authentication");
                    // next request starts from a fresh ticket
                    credentials.invalidate().await;
                }
                Ok(outcome.into_inner())
            })
            .await?
    };

    Ok(local_response(response))
}

impl PendingTunnel {
    async fn run(self, pool: &ConnectionPool) {
        let PendingTunnel {
            target,
            local,
            upstream,
        } = self;
        let local = match local.await {
            Ok(local) => TokioIo::new(local),
            Err(e) => {
                debug!(%target, "Local side never switched to tunnel: {}", e);
                return;
            }
        };
        relay(pool, local, upstream).await;
        debug!(%target, "Tunnel closed");
    }
}

/// Copy bytes both ways until either side closes.
async fn relay<L, U>(pool: &ConnectionPool, local: L, upstream: U)
where
    L: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut local_in, mut local_out) = tokio::io::split(local);
    let (mut upstream_in, mut upstream_out) = tokio::io::split(upstream);

    let stop = CancellationToken::new();
    let _stop_on_exit = stop.clone().drop_guard();
    pool.execute_async(async move {
        tokio::select! {
            _ = stop.cancelled() => {}
            result = tokio::io::copy(&mut local_in, &mut upstream_out) => match result {
                Ok(bytes) => debug!(bytes, "Client closed tunnel"),
                Err(e) => debug!("Client side of tunnel failed: {}", e),
            },
        }
        let _ = upstream_out.shutdown().await;
    });

    match tokio::io::copy(&mut upstream_in, &mut local_out).await {
        Ok(bytes) => debug!(bytes, "Upstream closed tunnel"),
        Err(e) => debug!("Upstream side of tunnel failed: {}", e),
    }
    let _ = local_out.shutdown().await;
}

/// Absolute-form request with the headers that go upstream.
fn forward_request(parts: &Parts) -> ProxyResult<ForwardRequest> {
    let uri = if parts.uri.scheme().is_some() {
        parts.uri.clone()
    } else {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::BadRequest(format!("no host for {}", parts.uri)))?;
        let path = parts.uri.path_and_query().map_or("/", |p| p.as_str());
        let target = format!("http://{}{}", host, path);
        target
            .parse::<Uri>()
            .map_err(|e| ProxyError::BadRequest(format!("invalid request target {:?}: {}", target, e)))?
    };
    if uri.host().is_none() {
        return Err(ProxyError::BadRequest(format!("no host in {}", uri)));
    }

    let named_by_connection: Vec<&str> = tokens(&parts.headers, "connection").collect();
    let mut headers = HeaderMap::with_capacity(parts.headers.len());
    for (name, value) in parts.headers.iter() {
        let dropped = DROPPED_HEADERS.contains(&name.as_str())
            || named_by_connection
                .iter()
                .any(|d| name.as_str().eq_ignore_ascii_case(d));
        if !dropped {
            headers.append(name.clone(), value.clone());
        }
    }

    Ok(ForwardRequest {
        method: parts.method.clone(),
        uri,
        headers,
    })
}

/// Upstream response as it goes back to the local client, which is only
/// ever served this one request.
fn local_response(response: ProxyResponse) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_inner().into_parts();
    for name in HOP_RESPONSE_HEADERS {
        parts.headers.remove(name);
    }
    if let Some(codings) = parts.headers.remove(TRANSFER_ENCODING) {
        let rest = codings
            .to_str()
            .ok()
            .and_then(strip_chunked)
            .and_then(|rest| HeaderValue::from_str(&rest).ok());
        if let Some(rest) = rest {
            parts.headers.insert(TRANSFER_ENCODING, rest);
        }
    }
    parts
        .headers
        .insert(CONNECTION, HeaderValue::from_static("close"));

    let body = body.map_err(std::io::Error::other).boxed_unsync();
    Response::from_parts(parts, body)
}

fn error_response(e: &ProxyError) -> Response<ProxyBody> {
    let status = match e {
        ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
        ProxyError::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };
    let mut response = Response::new(full(e.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}
