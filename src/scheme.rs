//! Proxy authentication schemes and per-request negotiation state.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::HeaderValue;
use rand::Rng;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Identity;
use crate::credentials::{AuthError, AuthResult, Credential};

/// Supported schemes, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthScheme {
    Negotiate,
    Kerberos,
    Digest,
    Basic,
}

impl AuthScheme {
    pub const PREFERENCE: [AuthScheme; 4] = [
        AuthScheme::Negotiate,
        AuthScheme::Kerberos,
        AuthScheme::Digest,
        AuthScheme::Basic,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AuthScheme::Negotiate => "Negotiate",
            AuthScheme::Kerberos => "Kerberos",
            AuthScheme::Digest => "Digest",
            AuthScheme::Basic => "Basic",
        }
    }

    /// `Proxy-Authorization` value answering `challenge`.
    pub async fn generate_response(
        self,
        challenge: &Challenge,
        request: &AuthRequest<'_>,
        credential: &Credential,
    ) -> AuthResult<HeaderValue> {
        let value = match self {
            AuthScheme::Negotiate | AuthScheme::Kerberos => {
                let context = Arc::clone(credential.context());
                let host = request.proxy_host.to_string();
                let token = tokio::task::spawn_blocking(move || context.service_token(&host))
                    .await
                    .map_err(|e| AuthError::GeneralSecurityFailure(format!("token task failed: {}", e)))??;
                format!("{} {}", self.name(), BASE64.encode(token))
            }
            AuthScheme::Digest => {
                let cnonce = hex::encode(rand::thread_rng().gen::<[u8; 16]>());
                digest_response(challenge, credential.identity(), request, &cnonce)?
            }
            AuthScheme::Basic => {
                let identity = credential.identity();
                let pair = format!("{}:{}", identity.username, identity.password);
                format!("Basic {}", BASE64.encode(pair))
            }
        };
        HeaderValue::from_str(&value)
            .map_err(|e| AuthError::GeneralSecurityFailure(format!("invalid auth header: {}", e)))
    }
}

/// Request the credentials are for
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    pub method: &'a str,
    pub uri: &'a str,
    pub proxy_host: &'a str,
}

/// One challenge of a `Proxy-Authenticate` header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub token: Option<String>,
    pub params: HashMap<String, String>,
}

impl Challenge {
    fn new(scheme: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            ..Self::default()
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Parse every challenge in the given `Proxy-Authenticate` values. One
/// value may carry several comma-separated challenges.
pub fn parse_challenges<'a, I>(values: I) -> Vec<Challenge>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut challenges = Vec::new();
    for value in values {
        let Ok(value) = std::str::from_utf8(value) else {
            continue;
        };
        let mut current: Option<Challenge> = None;
        for item in split_quoted(value, ',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let starts_challenge = match (item.find(' '), item.find('=')) {
                (Some(space), Some(eq)) => space < eq,
                (_, None) => true,
                (None, Some(_)) => false,
            };
            if starts_challenge {
                if let Some(done) = current.take() {
                    challenges.push(done);
                }
                let (scheme, rest) = item.split_once(' ').unwrap_or((item, ""));
                let mut challenge = Challenge::new(scheme);
                let rest = rest.trim();
                if is_token68(rest) {
                    challenge.token = Some(rest.to_string());
                } else if let Some((name, value)) = rest.split_once('=') {
                    challenge.params.insert(name.trim().to_ascii_lowercase(), unquote(value));
                }
                current = Some(challenge);
            } else if let (Some(challenge), Some((name, value))) = (current.as_mut(), item.split_once('=')) {
                challenge.params.insert(name.trim().to_ascii_lowercase(), unquote(value));
            }
        }
        if let Some(done) = current {
            challenges.push(done);
        }
    }
    challenges
}

fn split_quoted(value: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c == separator && !in_quotes => {
                parts.push(&value[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

fn is_token68(value: &str) -> bool {
    let body = value.trim_end_matches('=');
    !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | '+' | '/'))
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}

fn md5_hex(data: &str) -> String {
    hex::encode(Md5::digest(data.as_bytes()))
}

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// RFC 2617 / RFC 7616 response for MD5 and SHA-256 challenges, plain or
/// `-sess`. A challenge without `algorithm` means MD5.
fn digest_response(
    challenge: &Challenge,
    identity: &Identity,
    request: &AuthRequest<'_>,
    cnonce: &str,
) -> AuthResult<String> {
    let algorithm = challenge.param("algorithm").unwrap_or("MD5");
    let (hash, session): (fn(&str) -> String, bool) = match algorithm.to_ascii_uppercase().as_str() {
        "MD5" => (md5_hex, false),
        "MD5-SESS" => (md5_hex, true),
        "SHA-256" => (sha256_hex, false),
        "SHA-256-SESS" => (sha256_hex, true),
        _ => {
            return Err(AuthError::GeneralSecurityFailure(format!(
                "unsupported digest algorithm {}",
                algorithm
            )))
        }
    };

    let realm = challenge.param("realm").unwrap_or_default();
    let nonce = challenge
        .param("nonce")
        .ok_or_else(|| AuthError::GeneralSecurityFailure("digest challenge without nonce".into()))?;
    let qop = challenge
        .param("qop")
        .filter(|qop| qop.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")))
        .map(|_| "auth");

    let mut ha1 = hash(&format!("{}:{}:{}", identity.username, realm, identity.password));
    if session {
        ha1 = hash(&format!("{}:{}:{}", ha1, nonce, cnonce));
    }
    let ha2 = hash(&format!("{}:{}", request.method, request.uri));
    let nc = "00000001";
    let response = match qop {
        Some(qop) => hash(&format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2)),
        None => hash(&format!("{}:{}:{}", ha1, nonce, ha2)),
    };

    let mut header = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
        identity.username, realm, nonce, request.uri, algorithm, response
    );
    if let Some(qop) = qop {
        header.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce));
    }
    if let Some(opaque) = challenge.param("opaque") {
        header.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    Ok(header)
}

/// Negotiation state for one tunnel handshake or one forwarded request
#[derive(Debug, Default)]
pub struct AuthState {
    current: Option<AuthScheme>,
    failed: Vec<AuthScheme>,
    response: Option<HeaderValue>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for the next request's `Proxy-Authorization` header.
    pub fn response_header(&self) -> Option<&HeaderValue> {
        self.response.as_ref()
    }

    pub fn scheme(&self) -> Option<AuthScheme> {
        self.current
    }

    /// React to a 407. The scheme answered last is considered rejected;
    /// the strongest remaining offered scheme is answered instead. Returns
    /// `false` when nothing can be answered.
    pub async fn handle_challenge(
        &mut self,
        challenges: &[Challenge],
        request: &AuthRequest<'_>,
        credential: &Credential,
    ) -> bool {
        if let Some(rejected) = self.current.take() {
            debug!(scheme = rejected.name(), "Proxy rejected credentials");
            self.failed.push(rejected);
        }
        self.response = None;

        for scheme in AuthScheme::PREFERENCE {
            if self.failed.contains(&scheme) {
                continue;
            }
            let Some(challenge) = challenges
                .iter()
                .find(|c| c.scheme.eq_ignore_ascii_case(scheme.name()))
            else {
                continue;
            };
            match scheme.generate_response(challenge, request, credential).await {
                Ok(value) => {
                    debug!(scheme = scheme.name(), proxy = request.proxy_host, "Answering proxy challenge");
                    self.current = Some(scheme);
                    self.response = Some(value);
                    return true;
                }
                Err(e) => {
                    warn!(scheme = scheme.name(), "Cannot answer proxy challenge: {}", e);
                    self.failed.push(scheme);
                }
            }
        }
        false
    }
}
