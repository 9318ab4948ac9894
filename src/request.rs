//! Request Builder: owns the mutable request descriptor and the rules for
//! assembling its canonical (signing) and wire representations (§4.2).
//!
//! Mutation and finalization are split at the type level: [`RequestBuilder`]
//! exposes the mutators, and [`finalize`](RequestBuilder::finalize) consumes
//! it into a [`FinalizedRequest`] that no longer exposes them — so "no
//! signature-affecting mutation after finalize" (§3) is a compile-time
//! invariant rather than a runtime check.

use std::collections::BTreeMap;
use std::pin::Pin;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tokio::io::AsyncRead;
use url::Url;
use uuid::Uuid;

use crate::config::{AccessConditions, ClientConfig, ContentTypeDisposition, Location, PINNED_API_VERSION};
use crate::error::{ErrorKind, StorageClientError, StorageClientResult};

/// A pull-stream body source. Boxed so callers can hand in files, network
/// pipes, or anything else that implements `AsyncRead`.
pub type BodyReader = Pin<Box<dyn AsyncRead + Send + Sync>>;

/// The request body: absent, fully buffered, or a streamed reader (§3).
pub enum RequestBody {
    Absent,
    Buffer(Bytes),
    Reader { reader: BodyReader, length: u64 },
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Absent => write!(f, "Absent"),
            RequestBody::Buffer(b) => write!(f, "Buffer({} bytes)", b.len()),
            RequestBody::Reader { length, .. } => write!(f, "Reader({} bytes)", length),
        }
    }
}

impl RequestBody {
    pub fn len(&self) -> u64 {
        match self {
            RequestBody::Absent => 0,
            RequestBody::Buffer(b) => b.len() as u64,
            RequestBody::Reader { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Formats a UTC timestamp as RFC 1123 GMT, the wire format for `Date`/`x-ms-date` (§6).
pub fn format_http_date(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Groups query parameters by lowercased name, preserving first-appearance
/// order and joining duplicate values with commas, sorted lexicographically
/// by name — the shape both URL assembly and the canonicalized resource
/// string need (§4.1).
fn canonicalize_query(query: &[(String, String)]) -> Vec<(String, String)> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in query {
        grouped.entry(name.to_lowercase()).or_default().push(value.clone());
    }
    grouped
        .into_iter()
        .map(|(name, mut values)| {
            values.sort();
            (name, values.join(","))
        })
        .collect()
}

/// Mutable request descriptor (§3 Request Descriptor). Query parameters are
/// kept as an insertion-ordered multimap; signing re-sorts them lazily.
#[derive(Debug)]
pub struct RequestBuilder {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: RequestBody,
    raw_response: bool,
    stream_response: bool,
    content_type_disposition: ContentTypeDisposition,
}

impl RequestBuilder {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self {
            method,
            path,
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Absent,
            raw_response: false,
            stream_response: false,
            content_type_disposition: ContentTypeDisposition::LibraryDefault,
        }
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> StorageClientResult<Self> {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| StorageClientError::new(ErrorKind::InvalidInput, e.to_string()))?;
        let header_value = HeaderValue::from_str(&value.into())
            .map_err(|e| StorageClientError::new(ErrorKind::InvalidInput, e.to_string()))?;
        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    /// Appends an `x-ms-meta-*` entry, comma-joining in insertion order when a
    /// key differs only in case from one already present (§9).
    pub fn add_metadata(mut self, key: &str, value: &str) -> StorageClientResult<Self> {
        let header_name_str = format!("x-ms-meta-{}", key.to_lowercase());
        let name = HeaderName::from_bytes(header_name_str.as_bytes())
            .map_err(|e| StorageClientError::new(ErrorKind::InvalidInput, e.to_string()))?;
        let merged = match self.headers.get(&name) {
            Some(existing) => format!("{},{}", existing.to_str().unwrap_or_default(), value),
            None => value.to_string(),
        };
        let header_value = HeaderValue::from_str(&merged)
            .map_err(|e| StorageClientError::new(ErrorKind::InvalidInput, e.to_string()))?;
        self.headers.insert(name, header_value);
        Ok(self)
    }

    pub fn body_buffer(mut self, bytes: impl Into<Bytes>) -> Self {
        self.body = RequestBody::Buffer(bytes.into());
        self
    }

    pub fn body_reader(mut self, reader: BodyReader, length: u64) -> Self {
        self.body = RequestBody::Reader { reader, length };
        self
    }

    pub fn raw_response(mut self, raw: bool) -> Self {
        self.raw_response = raw;
        self
    }

    /// Requests that the transport hand back the response body as a stream
    /// rather than buffering it, so the pipeline executor can run its
    /// headers-only MD5/length accounting (§4.3 step 5) while the caller
    /// consumes the body incrementally (used by the download engine).
    pub fn stream_response(mut self, stream: bool) -> Self {
        self.stream_response = stream;
        self
    }

    pub fn content_type(mut self, disposition: ContentTypeDisposition) -> Self {
        self.content_type_disposition = disposition;
        self
    }

    /// Appends the `If-*`/lease headers from a conditional-access bundle. The
    /// operation's own target uses the plain HTTP conditional headers plus
    /// `x-ms-lease-id`; a copy source (`source: true`) uses the `x-ms-source-*`
    /// equivalents (§9 `accessConditions`/`sourceAccessConditions`).
    fn append_access_conditions(mut self, conditions: &AccessConditions, source: bool) -> StorageClientResult<Self> {
        let name = |suffix: &str| if source { format!("x-ms-source-{}", suffix) } else { suffix.to_string() };
        if let Some(v) = &conditions.if_match {
            self = self.header(&name("if-match"), v.clone())?;
        }
        if let Some(v) = &conditions.if_none_match {
            self = self.header(&name("if-none-match"), v.clone())?;
        }
        if let Some(v) = &conditions.if_modified_since {
            self = self.header(&name("if-modified-since"), v.clone())?;
        }
        if let Some(v) = &conditions.if_unmodified_since {
            self = self.header(&name("if-unmodified-since"), v.clone())?;
        }
        if let Some(v) = &conditions.lease_id {
            let lease_name = if source { "x-ms-source-lease-id".to_string() } else { "x-ms-lease-id".to_string() };
            self = self.header(&lease_name, v.clone())?;
        }
        Ok(self)
    }

    /// Appends `conditions` as the operation's own preconditions (§9 `accessConditions`).
    pub fn access_conditions(self, conditions: &AccessConditions) -> StorageClientResult<Self> {
        self.append_access_conditions(conditions, false)
    }

    /// Appends `conditions` as a copy source's preconditions, wire-prefixed
    /// `x-ms-source-*` (§9 `sourceAccessConditions`).
    pub fn source_access_conditions(self, conditions: &AccessConditions) -> StorageClientResult<Self> {
        self.append_access_conditions(conditions, true)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn canonical_query(&self) -> Vec<(String, String)> {
        canonicalize_query(&self.query)
    }

    /// Resolves the URL against the chosen host, normalizes `Content-Type`,
    /// stamps `Content-Length`, `x-ms-date`, `x-ms-version`,
    /// `x-ms-client-request-id`, and `User-Agent` (§4.2, §10.5), and consumes
    /// `self` into a [`FinalizedRequest`] that can no longer be mutated.
    pub fn finalize(
        mut self,
        config: &ClientConfig,
        location: Location,
        client_request_id: Option<&str>,
    ) -> StorageClientResult<FinalizedRequest> {
        let host = config.hosts.host_for(location).ok_or_else(|| {
            StorageClientError::new(
                ErrorKind::MissingHostForLocation,
                format!("no host configured for {:?}", location),
            )
        })?;

        let full_path = if config.hosts.path_style {
            format!("/{}{}", config.account, self.path)
        } else {
            self.path.clone()
        };

        let mut url = host.clone();
        url.set_path(&full_path);
        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            for (name, value) in &self.query {
                pairs.append_pair(name, value);
            }
        }
        if self.query.is_empty() {
            url.set_query(None);
        }

        match &self.content_type_disposition {
            ContentTypeDisposition::LibraryDefault => {}
            ContentTypeDisposition::PresentEmpty => {
                self.headers
                    .insert(http::header::CONTENT_TYPE, HeaderValue::from_static(""));
            }
            ContentTypeDisposition::Stripped => {
                self.headers.remove(http::header::CONTENT_TYPE);
            }
            ContentTypeDisposition::Explicit(value) => {
                self.headers.insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_str(value)
                        .map_err(|e| StorageClientError::new(ErrorKind::InvalidInput, e.to_string()))?,
                );
            }
        }

        if !self.headers.contains_key(http::header::CONTENT_LENGTH) {
            let len = self.body.len();
            self.headers.insert(
                http::header::CONTENT_LENGTH,
                HeaderValue::from_str(&len.to_string())
                    .map_err(|e| StorageClientError::new(ErrorKind::CanonicalizationError, e.to_string()))?,
            );
        }

        let now = chrono::Utc::now();
        self.headers.insert(
            HeaderName::from_static("x-ms-date"),
            HeaderValue::from_str(&format_http_date(&now))
                .map_err(|e| StorageClientError::new(ErrorKind::CanonicalizationError, e.to_string()))?,
        );
        self.headers.insert(
            HeaderName::from_static("x-ms-version"),
            HeaderValue::from_static(PINNED_API_VERSION),
        );

        let request_id = client_request_id
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.headers.insert(
            HeaderName::from_static("x-ms-client-request-id"),
            HeaderValue::from_str(&request_id)
                .map_err(|e| StorageClientError::new(ErrorKind::CanonicalizationError, e.to_string()))?,
        );

        let user_agent = format!(
            "{}/{} (rust)",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        );
        self.headers.insert(
            http::header::USER_AGENT,
            HeaderValue::from_str(&user_agent)
                .map_err(|e| StorageClientError::new(ErrorKind::CanonicalizationError, e.to_string()))?,
        );

        Ok(FinalizedRequest {
            method: self.method,
            path: self.path,
            query: self.query,
            headers: self.headers,
            body: self.body,
            raw_response: self.raw_response,
            stream_response: self.stream_response,
            url,
        })
    }
}

/// A request descriptor past the point of no further signature-affecting
/// mutation (§3 invariant). Only the `Authorization` header — the signature
/// itself — is added after this point, by the signing engine.
#[derive(Debug)]
pub struct FinalizedRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: RequestBody,
    raw_response: bool,
    stream_response: bool,
    url: Url,
}

impl FinalizedRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The signing engine is the one permitted mutator past finalize: it
    /// inserts `Authorization` without touching any signature-affecting field.
    pub fn set_authorization(&mut self, value: HeaderValue) {
        self.headers.insert(http::header::AUTHORIZATION, value);
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn into_body(self) -> RequestBody {
        self.body
    }

    pub fn is_raw_response(&self) -> bool {
        self.raw_response
    }

    pub fn wants_streamed_response(&self) -> bool {
        self.stream_response
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Appends a pre-signed SAS query string (with or without a leading `?`)
    /// to the request URL. Unlike Shared-Key/Bearer, a SAS credential needs no
    /// HMAC computation here — the token was already signed at mint time.
    pub fn append_sas_token(&mut self, token: &str) {
        let token = token.strip_prefix('?').unwrap_or(token);
        let pairs: Vec<(String, String)> =
            url::form_urlencoded::parse(token.as_bytes()).into_owned().collect();
        let mut qp = self.url.query_pairs_mut();
        for (k, v) in pairs {
            qp.append_pair(&k, &v);
        }
    }

    pub fn canonical_query(&self) -> Vec<(String, String)> {
        canonicalize_query(&self.query)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `x-ms-*` headers, lower-cased and sorted, with empty/whitespace-only
    /// values omitted (§4.1 canonicalized headers).
    pub fn ms_headers(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .headers
            .iter()
            .filter_map(|(name, value)| {
                let name = name.as_str();
                if !name.starts_with("x-ms-") {
                    return None;
                }
                let value = value.to_str().ok()?;
                let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
                if normalized.trim().is_empty() {
                    return None;
                }
                Some((name.to_lowercase(), normalized))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
