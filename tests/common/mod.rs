//! Shared fixtures for the integration tests: a deterministic, socket-free
//! `HttpTransport` that replays a scripted sequence of responses (§10.4).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use storage_client_core::{FinalizedRequest, HttpTransport, RawResponse, ResponseBody, StorageClientResult};

pub struct ScriptedResponse {
    pub status: u16,
    pub body: &'static [u8],
}

pub struct FakeTransport {
    script: Vec<ScriptedResponse>,
    cursor: AtomicUsize,
    pub seen_urls: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new(script: Vec<ScriptedResponse>) -> Self {
        Self { script, cursor: AtomicUsize::new(0), seen_urls: Mutex::new(Vec::new()) }
    }

    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn send(&self, req: FinalizedRequest) -> StorageClientResult<RawResponse> {
        self.seen_urls.lock().unwrap().push(req.url().to_string());
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.get(idx).unwrap_or_else(|| self.script.last().expect("non-empty script"));
        Ok(RawResponse {
            status: scripted.status,
            headers: HeaderMap::new(),
            body: ResponseBody::Buffer(Bytes::from_static(scripted.body)),
            transport_digest: None,
        })
    }
}
