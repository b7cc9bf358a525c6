use bytes::{Bytes, BytesMut};
use http::header::{
    CONTENT_LENGTH, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TRANSFER_ENCODING, USER_AGENT,
};
use http::response::Parts;
use http::{HeaderValue, Method, Request, Response, StatusCode, Version};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tracing::debug;

use crate::body::ProxyBody;
use crate::config::ProxyConfig;
use crate::credentials::Credential;
use crate::error::{ProxyError, ProxyResult};
use crate::net::{self, HostPort};
use crate::pool::keep_alive_duration;
use crate::scheme::{parse_challenges, AuthRequest, AuthState};

const AGENT: &str = concat!("kproxy/", env!("CARGO_PKG_VERSION"));
const MAX_REFUSAL_BODY: usize = 1024 * 1024;

/// Final non-2xx answer of the upstream proxy to a CONNECT request
#[derive(Debug)]
pub struct RefusedResponse {
    pub head: Parts,
    pub body: Bytes,
    /// The body went past the relay limit and was cut short.
    pub truncated: bool,
}

impl RefusedResponse {
    /// The refusal as it goes back to the local client.
    pub fn into_response(self) -> Response<ProxyBody> {
        let mut head = self.head;
        if self.truncated {
            head.headers.remove(TRANSFER_ENCODING);
            head.headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        }
        let body = Full::new(self.body).map_err(|never| match never {}).boxed_unsync();
        Response::from_parts(head, body)
    }
}

/// An open tunnel: the proxy's success head and the raw stream behind it,
/// including any bytes the proxy sent after its head.
pub struct Established {
    pub head: Parts,
    pub stream: TokioIo<Upgraded>,
}

/// Opens CONNECT tunnels through the upstream proxy.
#[derive(Debug, Clone)]
pub struct TunnelClient {
    socket_buffer_size: usize,
}

impl TunnelClient {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            socket_buffer_size: config.socket_buffer_size,
        }
    }

    /// Establish a tunnel to `target`, answering proxy challenges with
    /// `credential`.
    pub async fn tunnel(
        &self,
        proxy: &HostPort,
        target: &HostPort,
        version: Version,
        credential: &Credential,
    ) -> ProxyResult<Established> {
        let authority = target.to_string();
        let auth_request = AuthRequest {
            method: "CONNECT",
            uri: &authority,
            proxy_host: &proxy.host,
        };
        let mut auth = AuthState::new();
        let mut reusable: Option<SendRequest<Empty<Bytes>>> = None;

        let (upstream, mut response) = loop {
            let mut upstream = match reusable.take() {
                Some(mut upstream) => {
                    if upstream.ready().await.is_ok() {
                        upstream
                    } else {
                        self.open(proxy).await?
                    }
                }
                None => self.open(proxy).await?,
            };

            let request = connect_request(&authority, version, auth.response_header())?;
            let mut response = upstream.send_request(request).await?;
            debug!(%target, status = %response.status(), "CONNECT response");

            if response.status().is_informational() {
                return Err(ProxyError::Protocol(format!(
                    "unexpected response to CONNECT: {}",
                    response.status()
                )));
            }

            if response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
                let challenges = parse_challenges(
                    response
                        .headers()
                        .get_all(PROXY_AUTHENTICATE)
                        .iter()
                        .map(HeaderValue::as_bytes),
                );
                if auth.handle_challenge(&challenges, &auth_request, credential).await {
                    let keep_alive =
                        keep_alive_duration(response.headers(), response.version(), Duration::ZERO);
                    if keep_alive.is_some() && drain(response.body_mut()).await.is_ok() {
                        reusable = Some(upstream);
                    }
                    continue;
                }
            }

            break (upstream, response);
        };

        if !response.status().is_success() {
            let (body, truncated) = read_limited(response.body_mut(), MAX_REFUSAL_BODY).await?;
            drop(upstream);
            let (head, _) = response.into_parts();
            return Err(ProxyError::TunnelRefused(Box::new(RefusedResponse {
                head,
                body,
                truncated,
            })));
        }

        let stream = hyper::upgrade::on(&mut response).await?;
        drop(upstream);
        let (head, _) = response.into_parts();
        Ok(Established {
            head,
            stream: TokioIo::new(stream),
        })
    }

    async fn open(&self, proxy: &HostPort) -> ProxyResult<SendRequest<Empty<Bytes>>> {
        let stream = net::connect(proxy, self.socket_buffer_size).await?;
        let (sender, connection) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(stream))
            .await?;

        let proxy = proxy.clone();
        tokio::spawn(async move {
            if let Err(err) = connection.with_upgrades().await {
                debug!(%proxy, "CONNECT connection error: {:?}", err);
            }
        });
        Ok(sender)
    }
}

async fn drain(body: &mut Incoming) -> Result<(), hyper::Error> {
    while let Some(frame) = body.frame().await {
        frame?;
    }
    Ok(())
}

/// Up to `limit` bytes of `body`, and whether more was cut off.
async fn read_limited(body: &mut Incoming, limit: usize) -> Result<(Bytes, bool), hyper::Error> {
    let mut collected = BytesMut::new();
    while let Some(frame) = body.frame().await {
        if let Ok(data) = frame?.into_data() {
            let room = limit - collected.len();
            if data.len() > room {
                collected.extend_from_slice(&data[..room]);
                return Ok((collected.freeze(), true));
            }
            collected.extend_from_slice(&data);
        }
    }
    Ok((collected.freeze(), false))
}

fn connect_request(
    authority: &str,
    version: Version,
    authorization: Option<&HeaderValue>,
) -> ProxyResult<Request<Empty<Bytes>>> {
    let mut builder = Request::builder()
        .method(Method::CONNECT)
        .uri(authority)
        .version(version)
        .header(HOST, authority)
        .header(USER_AGENT, AGENT)
        .header("proxy-connection", "Keep-Alive");
    if let Some(authorization) = authorization {
        builder = builder.header(PROXY_AUTHORIZATION, authorization.clone());
    }
    builder
        .body(Empty::new())
        .map_err(|e| ProxyError::BadRequest(format!("invalid CONNECT target {:?}: {}", authority, e)))
}
