use bytes::{Bytes, BytesMut};
use futures::stream;
use futures::StreamExt;
use http::HeaderValue;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Full, StreamBody};
use hyper::body::{Body, Frame};
use parking_lot::Mutex;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Request bodies up to this size are kept in memory so the request can be
/// sent again after a proxy authentication round.
pub const REPLAY_THRESHOLD: u64 = 100 * 1024;

/// Body type sent to the upstream proxy and back to local clients
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

/// Inbound request body adapted for (possibly repeated) upstream sends.
///
/// Bodies whose end arrives within [`REPLAY_THRESHOLD`] bytes are fully
/// buffered and can be written any number of times. Anything larger is
/// streamed from the local connection once.
pub struct ReplayableBody {
    declared_length: Option<u64>,
    buffered: Bytes,
    repeatable: bool,
    remainder: Mutex<Option<ProxyBody>>,
    content_type: Option<HeaderValue>,
    content_encoding: Option<HeaderValue>,
}

impl std::fmt::Debug for ReplayableBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayableBody")
            .field("declared_length", &self.declared_length)
            .field("buffered", &self.buffered.len())
            .field("repeatable", &self.repeatable)
            .finish()
    }
}

impl ReplayableBody {
    pub async fn new<B>(body: B) -> io::Result<Self>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let declared_length = body.size_hint().exact();
        let mut body = body.map_err(io::Error::other).boxed_unsync();
        if declared_length.is_some_and(|length| length > REPLAY_THRESHOLD) {
            return Ok(Self::streamed(declared_length, Bytes::new(), body));
        }

        let limit = declared_length.unwrap_or(REPLAY_THRESHOLD) as usize;
        let mut buffered = BytesMut::new();
        let mut ended = false;
        while buffered.len() < limit {
            match body.frame().await {
                Some(frame) => {
                    if let Ok(data) = frame?.into_data() {
                        buffered.extend_from_slice(&data);
                    }
                }
                None => {
                    ended = true;
                    break;
                }
            }
        }

        let buffered = buffered.freeze();
        if !(ended || body.is_end_stream()) {
            return Ok(Self::streamed(declared_length, buffered, body));
        }
        Ok(Self {
            declared_length,
            buffered,
            repeatable: true,
            remainder: Mutex::new(None),
            content_type: None,
            content_encoding: None,
        })
    }

    fn streamed(declared_length: Option<u64>, buffered: Bytes, rest: ProxyBody) -> Self {
        Self {
            declared_length,
            buffered,
            repeatable: false,
            remainder: Mutex::new(Some(rest)),
            content_type: None,
            content_encoding: None,
        }
    }

    /// Body of a request that carries none.
    #[cfg(test)]
    pub fn empty() -> Self {
        Self {
            declared_length: Some(0),
            buffered: Bytes::new(),
            repeatable: true,
            remainder: Mutex::new(None),
            content_type: None,
            content_encoding: None,
        }
    }

    /// Attach the `Content-Type` / `Content-Encoding` the entity carries.
    pub fn with_entity_headers(
        mut self,
        content_type: Option<HeaderValue>,
        content_encoding: Option<HeaderValue>,
    ) -> Self {
        self.content_type = content_type;
        self.content_encoding = content_encoding;
        self
    }

    pub fn is_repeatable(&self) -> bool {
        self.repeatable
    }

    /// Length the entity is sent with; `None` means it goes out chunked.
    pub fn content_length(&self) -> Option<u64> {
        if self.repeatable {
            Some(self.buffered.len() as u64)
        } else {
            self.declared_length
        }
    }

    pub fn content_type(&self) -> Option<&HeaderValue> {
        self.content_type.as_ref()
    }

    pub fn content_encoding(&self) -> Option<&HeaderValue> {
        self.content_encoding.as_ref()
    }

    /// Write the body to `out`. A repeatable body writes the same bytes on
    /// every call; a streamed body can only be written once.
    pub async fn write_to<W>(&self, out: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        if self.repeatable {
            out.write_all(&self.buffered).await?;
            return Ok(self.buffered.len() as u64);
        }

        let mut rest = self.take_remainder()?;
        out.write_all(&self.buffered).await?;
        let mut written = self.buffered.len() as u64;
        while let Some(frame) = rest.frame().await {
            if let Ok(data) = frame?.into_data() {
                out.write_all(&data).await?;
                written += data.len() as u64;
            }
        }
        Ok(written)
    }

    /// The body as an HTTP body for one upstream send, under the same
    /// rules as [`write_to`](Self::write_to).
    pub fn take_body(&self) -> io::Result<ProxyBody> {
        if self.repeatable {
            return Ok(Full::new(self.buffered.clone())
                .map_err(|never| match never {})
                .boxed_unsync());
        }

        let rest = self.take_remainder()?;
        let prefix = (!self.buffered.is_empty())
            .then(|| Ok::<_, io::Error>(Frame::data(self.buffered.clone())));
        Ok(StreamBody::new(stream::iter(prefix).chain(BodyStream::new(rest))).boxed_unsync())
    }

    fn take_remainder(&self) -> io::Result<ProxyBody> {
        self.remainder.lock().take().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "streamed request body was already sent",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized(data: Vec<u8>) -> Full<Bytes> {
        Full::new(Bytes::from(data))
    }

    /// A body of unknown length, delivered in 4 KiB frames.
    fn unknown_length(data: &[u8]) -> impl Body<Data = Bytes, Error = io::Error> + Send + Unpin + 'static {
        let frames: Vec<Result<Frame<Bytes>, io::Error>> = data
            .chunks(4096)
            .map(|piece| Ok(Frame::data(Bytes::copy_from_slice(piece))))
            .collect();
        StreamBody::new(stream::iter(frames))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn small_known_length_is_repeatable() {
        let body = ReplayableBody::new(sized(b"hello".to_vec())).await.unwrap();
        assert!(body.is_repeatable());
        assert_eq!(body.content_length(), Some(5));

        let mut first = Vec::new();
        let mut second = Vec::new();
        body.write_to(&mut first).await.unwrap();
        body.write_to(&mut second).await.unwrap();
        assert_eq!(first, b"hello");
        assert_eq!(first, second);

        let sent = body.take_body().unwrap().collect().await.unwrap().to_bytes();
        let resent = body.take_body().unwrap().collect().await.unwrap().to_bytes();
        assert_eq!(&sent[..], b"hello");
        assert_eq!(sent, resent);
    }

    #[tokio::test]
    async fn threshold_sized_body_is_repeatable() {
        let data = pattern(REPLAY_THRESHOLD as usize);
        let body = ReplayableBody::new(sized(data.clone())).await.unwrap();
        assert!(body.is_repeatable());
        let sent = body.take_body().unwrap().collect().await.unwrap().to_bytes();
        assert_eq!(&sent[..], &data[..]);
    }

    #[tokio::test]
    async fn large_known_length_streams_once() {
        let data = pattern(200 * 1024);
        let body = ReplayableBody::new(sized(data.clone())).await.unwrap();
        assert!(!body.is_repeatable());
        assert_eq!(body.content_length(), Some(200 * 1024));

        let mut out = Vec::new();
        let written = body.write_to(&mut out).await.unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(out, data);

        let err = body.write_to(&mut Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(body.take_body().is_err());
    }

    #[tokio::test]
    async fn short_unknown_length_body_is_repeatable() {
        let body = ReplayableBody::new(unknown_length(b"abc123")).await.unwrap();
        assert!(body.is_repeatable());
        assert_eq!(body.content_length(), Some(6));
        let sent = body.take_body().unwrap().collect().await.unwrap().to_bytes();
        assert_eq!(&sent[..], b"abc123");
    }

    #[tokio::test]
    async fn unbounded_body_streams_whole_payload() {
        let data = pattern(150 * 1024);
        let body = ReplayableBody::new(unknown_length(&data)).await.unwrap();
        assert!(!body.is_repeatable());
        assert_eq!(body.content_length(), None);

        let sent = body.take_body().unwrap().collect().await.unwrap().to_bytes();
        assert_eq!(sent.len(), data.len());
        assert_eq!(&sent[..], &data[..]);
        assert!(body.take_body().is_err());
    }

    #[tokio::test]
    async fn empty_body_is_repeatable() {
        let body = ReplayableBody::new(Full::new(Bytes::new())).await.unwrap();
        assert!(body.is_repeatable());
        assert_eq!(body.content_length(), Some(0));
    }

    #[tokio::test]
    async fn entity_headers_are_carried() {
        let body = ReplayableBody::empty().with_entity_headers(
            Some(HeaderValue::from_static("text/plain")),
            Some(HeaderValue::from_static("gzip")),
        );
        assert!(body.is_repeatable());
        assert_eq!(body.content_length(), Some(0));
        assert_eq!(body.content_type().unwrap(), "text/plain");
        assert_eq!(body.content_encoding().unwrap(), "gzip");
    }
}
