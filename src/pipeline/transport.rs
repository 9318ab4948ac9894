//! HTTP transport: turns a [`FinalizedRequest`] into bytes on the wire and
//! back into a [`RawResponse`] (§4.2 "dispatch", §4.4).

use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use md5::{Digest, Md5};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::trace;

use crate::error::{ErrorKind, StorageClientError, StorageClientResult};
use crate::request::{FinalizedRequest, RequestBody};

/// A received response body: either fully buffered or a streamed reader,
/// mirroring [`RequestBody`]'s split so large downloads never round-trip
/// through an in-memory buffer (§4.4, §4.5).
pub enum ResponseBody {
    Buffer(Bytes),
    Stream(Pin<Box<dyn AsyncRead + Send + Sync>>),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Buffer(b) => write!(f, "Buffer({} bytes)", b.len()),
            ResponseBody::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

/// The running MD5 + byte count accumulated while a headers-only response
/// body is streamed through (§4.3 step 5). Populated once the stream is
/// fully drained; readers that never exhaust the body never see a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportDigest {
    pub content_md5: [u8; 16],
    pub content_length: u64,
}

pub type DigestSlot = Arc<StdMutex<Option<TransportDigest>>>;

/// Wraps a streamed response body, updating a running MD5 and length counter
/// as the caller reads, and publishing the final digest into `slot` once the
/// stream hits end-of-file (§4.3 step 5).
pub(crate) struct DigestingReader {
    inner: Pin<Box<dyn AsyncRead + Send + Sync>>,
    hasher: Option<Md5>,
    length: u64,
    slot: DigestSlot,
}

impl DigestingReader {
    pub(crate) fn new(inner: Pin<Box<dyn AsyncRead + Send + Sync>>, slot: DigestSlot) -> Self {
        Self { inner, hasher: Some(Md5::new()), length: 0, slot }
    }
}

impl AsyncRead for DigestingReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match this.inner.as_mut().poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = &buf.filled()[before..];
                if read.is_empty() {
                    if let Some(hasher) = this.hasher.take() {
                        let digest: [u8; 16] = hasher.finalize().into();
                        *this.slot.lock().unwrap() =
                            Some(TransportDigest { content_md5: digest, content_length: this.length });
                        trace!(content_length = this.length, "transport digest finalized");
                    }
                } else if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(read);
                    this.length += read.len() as u64;
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// Set by the pipeline executor when it wraps a streamed body for
    /// headers-only MD5/length accounting (§4.3 step 5); `None` for buffered
    /// responses, which already have their full bytes in hand.
    pub transport_digest: Option<DigestSlot>,
}

impl RawResponse {
    /// Buffers the body in full, regardless of how it arrived. Used for
    /// non-streaming operations and by the response normalizer (§4.4).
    pub async fn into_buffered(self) -> StorageClientResult<(u16, HeaderMap, Bytes)> {
        let bytes = match self.body {
            ResponseBody::Buffer(b) => b,
            ResponseBody::Stream(mut reader) => {
                use tokio::io::AsyncReadExt;
                let mut buf = Vec::new();
                reader
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|e| StorageClientError::new(ErrorKind::NetworkError, e.to_string()))?;
                Bytes::from(buf)
            }
        };
        Ok((self.status, self.headers, bytes))
    }
}

/// Dispatches a finalized, signed request and returns the raw response.
/// Implementations never interpret status codes or bodies — that is the
/// response normalizer's job (§4.4).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, req: FinalizedRequest) -> StorageClientResult<RawResponse>;
}

type WireBody = BoxBody<Bytes, StorageClientError>;

fn buffered_body(bytes: Bytes) -> WireBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn streamed_body(reader: Pin<Box<dyn AsyncRead + Send + Sync>>) -> WireBody {
    let stream = ReaderStream::new(reader);
    let mapped = futures::stream::StreamExt::map(stream, |chunk| {
        chunk
            .map(Frame::data)
            .map_err(|e| StorageClientError::new(ErrorKind::NetworkError, e.to_string()))
    });
    StreamBody::new(mapped).boxed()
}

/// `hyper` + `hyper-rustls` backed transport, the one shipped for real use.
pub struct HyperTransport {
    client: Client<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>, WireBody>,
}

impl HyperTransport {
    pub fn new() -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("native root certificates available")
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);
        Self { client }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for HyperTransport {
    async fn send(&self, req: FinalizedRequest) -> StorageClientResult<RawResponse> {
        let method = req.method().clone();
        let url = req.url().clone();
        let headers = req.headers().clone();
        let headers_only = req.wants_streamed_response();

        let body: WireBody = match req.into_body() {
            RequestBody::Absent => buffered_body(Bytes::new()),
            RequestBody::Buffer(bytes) => buffered_body(bytes),
            RequestBody::Reader { reader, .. } => streamed_body(reader),
        };

        let mut builder = hyper::Request::builder().method(method).uri(url.as_str());
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let request = builder
            .body(body)
            .map_err(|e| StorageClientError::new(ErrorKind::InvalidInput, e.to_string()))?;

        trace!(url = %url, headers_only, "dispatching request");
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| StorageClientError::new(ErrorKind::NetworkError, e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        if headers_only {
            let data_stream = futures::stream::StreamExt::map(response.into_body().into_data_stream(), |chunk| {
                chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            });
            let reader: Pin<Box<dyn AsyncRead + Send + Sync>> = Box::pin(StreamReader::new(data_stream));
            return Ok(RawResponse { status, headers, body: ResponseBody::Stream(reader), transport_digest: None });
        }

        let collected = response
            .into_body()
            .collect()
            .await
            .map_err(|e| StorageClientError::new(ErrorKind::NetworkError, e.to_string()))?
            .to_bytes();

        Ok(RawResponse { status, headers, body: ResponseBody::Buffer(collected), transport_digest: None })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! A deterministic, socket-free transport for pipeline/retry tests (§10.4).

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    pub struct ScriptedResponse {
        pub status: u16,
        pub headers: Vec<(&'static str, &'static str)>,
        pub body: &'static [u8],
    }

    /// Replays a fixed script of responses in order, one per call to `send`,
    /// and records every request it was handed.
    pub struct FakeTransport {
        script: Mutex<Vec<ScriptedResponse>>,
        cursor: AtomicUsize,
        pub seen: Mutex<Vec<(String, String)>>,
    }

    impl FakeTransport {
        pub fn new(script: Vec<ScriptedResponse>) -> Self {
            Self {
                script: Mutex::new(script),
                cursor: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.cursor.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpTransport for FakeTransport {
        async fn send(&self, req: FinalizedRequest) -> StorageClientResult<RawResponse> {
            self.seen
                .lock()
                .unwrap()
                .push((req.method().to_string(), req.url().to_string()));
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
            let script = self.script.lock().unwrap();
            let scripted = script.get(idx).unwrap_or_else(|| script.last().expect("non-empty script"));
            let mut headers = HeaderMap::new();
            for (name, value) in &scripted.headers {
                headers.insert(
                    http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                    http::HeaderValue::from_str(value).unwrap(),
                );
            }
            Ok(RawResponse {
                status: scripted.status,
                headers,
                body: ResponseBody::Buffer(Bytes::from_static(scripted.body)),
                transport_digest: None,
            })
        }
    }

    #[tokio::test]
    async fn digesting_reader_publishes_md5_and_length_on_eof() {
        let payload = b"the quick brown fox".to_vec();
        let reader: Pin<Box<dyn AsyncRead + Send + Sync>> = Box::pin(std::io::Cursor::new(payload.clone()));
        let slot: DigestSlot = Arc::new(StdMutex::new(None));
        let mut digesting = DigestingReader::new(reader, slot.clone());

        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        digesting.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, payload);

        let digest = slot.lock().unwrap().clone().expect("digest published after EOF");
        assert_eq!(digest.content_length, payload.len() as u64);
        let mut expected = Md5::new();
        expected.update(&payload);
        let expected: [u8; 16] = expected.finalize().into();
        assert_eq!(digest.content_md5, expected);
    }

    #[tokio::test]
    async fn replays_scripted_responses_in_order() {
        let transport = FakeTransport::new(vec![
            ScriptedResponse { status: 503, headers: vec![], body: b"" },
            ScriptedResponse { status: 200, headers: vec![], body: b"ok" },
        ]);
        let cfg = crate::config::ClientConfigBuilder::new()
            .account("a")
            .primary_host(url::Url::parse("https://a.blob.core.example/").unwrap())
            .build()
            .unwrap();
        let req1 = crate::request::RequestBuilder::new(http::Method::GET, "/c")
            .finalize(&cfg, crate::config::Location::Primary, None)
            .unwrap();
        let resp1 = transport.send(req1).await.unwrap();
        assert_eq!(resp1.status, 503);

        let req2 = crate::request::RequestBuilder::new(http::Method::GET, "/c")
            .finalize(&cfg, crate::config::Location::Primary, None)
            .unwrap();
        let resp2 = transport.send(req2).await.unwrap();
        assert_eq!(resp2.status, 200);
        assert_eq!(transport.calls(), 2);
    }
}
