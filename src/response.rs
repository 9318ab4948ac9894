//! Response Normalizer (§4.4): classifies status, decodes the body by
//! `Content-Type`, and extracts a uniform error envelope on failure.

use bytes::Bytes;
use http::HeaderMap;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::config::Location;
use crate::error::{ErrorKind, StorageClientError, StorageClientResult};
use crate::pipeline::transport::RawResponse;

/// A decoded XML element tree. Attributes live under `"$"`, text content
/// under `"_"`; an element with neither children nor attributes decodes
/// straight to [`XmlValue::Text`] rather than a one-key object (§4.4).
///
/// Unlike the common `xml2js`-style convention, the root element's own tag
/// name is kept as the sole top-level key rather than stripped, so error
/// envelope lookup (`Error`/`error`) is symmetric between XML and JSON bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlValue {
    Object(Vec<(String, XmlValue)>),
    Array(Vec<XmlValue>),
    Text(String),
}

impl XmlValue {
    pub fn get(&self, key: &str) -> Option<&XmlValue> {
        match self {
            XmlValue::Object(entries) => entries
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// The element's own text: either a bare [`XmlValue::Text`], or the `"_"`
    /// entry of an object that also carries attributes/children.
    pub fn text(&self) -> Option<&str> {
        match self {
            XmlValue::Text(s) => Some(s),
            XmlValue::Object(_) => self.get("_").and_then(XmlValue::text),
            XmlValue::Array(_) => None,
        }
    }
}

struct Frame {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<(String, XmlValue)>,
    text: String,
}

impl Frame {
    fn into_value(self) -> XmlValue {
        let trimmed = self.text.trim();
        if self.attrs.is_empty() && self.children.is_empty() {
            return XmlValue::Text(trimmed.to_string());
        }

        let mut entries = Vec::new();
        if !self.attrs.is_empty() {
            entries.push((
                "$".to_string(),
                XmlValue::Object(self.attrs.into_iter().map(|(k, v)| (k, XmlValue::Text(v))).collect()),
            ));
        }
        if !trimmed.is_empty() {
            entries.push(("_".to_string(), XmlValue::Text(trimmed.to_string())));
        }

        let mut grouped: Vec<(String, Vec<XmlValue>)> = Vec::new();
        for (name, value) in self.children {
            match grouped.iter_mut().find(|(n, _)| *n == name) {
                Some((_, values)) => values.push(value),
                None => grouped.push((name, vec![value])),
            }
        }
        for (name, mut values) in grouped {
            let collapsed = if values.len() == 1 { values.remove(0) } else { XmlValue::Array(values) };
            entries.push((name, collapsed));
        }

        XmlValue::Object(entries)
    }
}

/// Decodes an XML document into a generic attribute/text/children tree
/// (§4.4). Entity-specific payload shapes are out of scope; callers descend
/// the tree themselves with [`XmlValue::get`].
pub fn decode_xml(bytes: &[u8]) -> StorageClientResult<XmlValue> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| StorageClientError::new(ErrorKind::CanonicalizationError, e.to_string()))?;
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<(String, XmlValue)> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let mut attrs = Vec::new();
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr
                        .unescape_value()
                        .map_err(|e| StorageClientError::new(ErrorKind::CanonicalizationError, e.to_string()))?
                        .to_string();
                    attrs.push((key, value));
                }
                stack.push(Frame { name, attrs, children: Vec::new(), text: String::new() });
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let mut attrs = Vec::new();
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr
                        .unescape_value()
                        .map_err(|e| StorageClientError::new(ErrorKind::CanonicalizationError, e.to_string()))?
                        .to_string();
                    attrs.push((key, value));
                }
                let value = Frame { name: name.clone(), attrs, children: Vec::new(), text: String::new() }.into_value();
                push_finished(&mut stack, &mut root, name, value);
            }
            Ok(Event::Text(e)) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(
                        &e.unescape()
                            .map_err(|e| StorageClientError::new(ErrorKind::CanonicalizationError, e.to_string()))?,
                    );
                }
            }
            Ok(Event::End(_)) => {
                let frame = stack.pop().ok_or_else(|| {
                    StorageClientError::new(ErrorKind::CanonicalizationError, "unbalanced XML end tag")
                })?;
                let name = frame.name.clone();
                let value = frame.into_value();
                push_finished(&mut stack, &mut root, name, value);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(StorageClientError::new(ErrorKind::CanonicalizationError, e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    match root {
        Some((name, value)) => Ok(XmlValue::Object(vec![(name, value)])),
        None => Ok(XmlValue::Object(Vec::new())),
    }
}

fn push_finished(stack: &mut Vec<Frame>, root: &mut Option<(String, XmlValue)>, name: String, value: XmlValue) {
    match stack.last_mut() {
        Some(parent) => parent.children.push((name, value)),
        None => *root = Some((name, value)),
    }
}

/// Coarse status classification (§4.4, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Retryable,
    ClientFatal,
}

pub fn classify_status(status: u16) -> StatusClass {
    if (200..300).contains(&status) {
        StatusClass::Success
    } else if status == 408 || (500..600).contains(&status) {
        StatusClass::Retryable
    } else {
        StatusClass::ClientFatal
    }
}

/// A successfully decoded response body.
#[derive(Debug)]
pub enum NormalizedBody {
    /// Raw-response flag set: bytes are returned untouched (§4.4).
    Raw(Bytes),
    Json(serde_json::Value),
    Xml(XmlValue),
    Empty,
    ContentTypeUnknown(Bytes),
}

/// The uniform result of a successful pipeline operation (§4.4, §2).
#[derive(Debug)]
pub struct NormalizedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub target_location: Location,
    pub body: NormalizedBody,
    pub request_id: Option<String>,
}

fn decode_body(content_type: &str, bytes: &Bytes) -> StorageClientResult<NormalizedBody> {
    if bytes.is_empty() {
        return Ok(NormalizedBody::Empty);
    }
    if content_type.starts_with("application/json") {
        let value = serde_json::from_slice(bytes)
            .map_err(|e| StorageClientError::new(ErrorKind::CanonicalizationError, e.to_string()))?;
        Ok(NormalizedBody::Json(value))
    } else if content_type.starts_with("application/xml")
        || content_type.starts_with("application/atom+xml")
        || content_type.starts_with("text/xml")
    {
        Ok(NormalizedBody::Xml(decode_xml(bytes)?))
    } else {
        Ok(NormalizedBody::ContentTypeUnknown(bytes.clone()))
    }
}

fn xml_error_message(envelope: &XmlValue) -> Option<String> {
    envelope
        .get("message")
        .and_then(XmlValue::text)
        .map(|s| s.to_string())
}

fn xml_error_code(envelope: &XmlValue) -> Option<String> {
    envelope.get("code").and_then(XmlValue::text).map(|s| s.to_string())
}

fn json_message_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(obj) => obj
            .get("value")
            .or_else(|| obj.get("Value"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

fn json_error_envelope(value: &serde_json::Value) -> Option<&serde_json::Value> {
    let obj = value.as_object()?;
    obj.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("error") || key.eq_ignore_ascii_case("odata.error"))
        .map(|(_, v)| v)
}

/// Extracts `(code, message)` from a decoded body's error envelope
/// (`Error`/`error`/`odata.error`), lower-casing property names and
/// flattening `{lang, value}` message objects (§4.4).
fn extract_error_envelope(body: &NormalizedBody) -> (Option<String>, Option<String>) {
    match body {
        NormalizedBody::Xml(value) => match value.get("error") {
            Some(envelope) => (xml_error_code(envelope), xml_error_message(envelope)),
            None => (None, None),
        },
        NormalizedBody::Json(value) => match json_error_envelope(value) {
            Some(envelope) => {
                let code = envelope
                    .as_object()
                    .and_then(|o| o.get("code").or_else(|| o.get("Code")))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                let message = envelope
                    .as_object()
                    .and_then(|o| o.get("message").or_else(|| o.get("Message")))
                    .and_then(json_message_value);
                (code, message)
            }
            None => (None, None),
        },
        _ => (None, None),
    }
}

/// Decodes `raw` and resolves it to either a success [`NormalizedResponse`]
/// or a normalized [`StorageClientError`] (§4.4).
pub async fn normalize(
    raw: RawResponse,
    raw_response: bool,
    target_location: Location,
) -> StorageClientResult<NormalizedResponse> {
    let (status, headers, bytes) = raw.into_buffered().await?;
    let request_id = headers
        .get("x-ms-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if raw_response && classify_status(status) == StatusClass::Success {
        return Ok(NormalizedResponse {
            status,
            headers,
            target_location,
            body: NormalizedBody::Raw(bytes),
            request_id,
        });
    }

    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();
    let body = decode_body(&content_type, &bytes)?;

    if classify_status(status) == StatusClass::Success {
        return Ok(NormalizedResponse { status, headers, target_location, body, request_id });
    }

    let (code, message) = extract_error_envelope(&body);
    let kind = StorageClientError::kind_for_status(status);
    let mut err = StorageClientError::new(
        kind,
        message.unwrap_or_else(|| format!("request failed with status {}", status)),
    )
    .with_status(status);
    if let Some(id) = request_id {
        err = err.with_request_id(id);
    }
    if let Some(code) = code {
        err = err.with_service_code(code);
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_flat_xml_element_to_text() {
        let tree = decode_xml(b"<Code>ResourceNotFound</Code>").unwrap();
        assert_eq!(tree.get("Code").and_then(XmlValue::text), Some("ResourceNotFound"));
    }

    #[test]
    fn decodes_attributes_under_dollar_key() {
        let tree = decode_xml(br#"<Blob name="a.txt">ok</Blob>"#).unwrap();
        let blob = tree.get("Blob").unwrap();
        assert_eq!(blob.get("$").unwrap().get("name").and_then(XmlValue::text), Some("a.txt"));
        assert_eq!(blob.text(), Some("ok"));
    }

    #[test]
    fn repeated_siblings_become_array_single_stays_bare() {
        let tree = decode_xml(b"<Blobs><Blob>a</Blob><Blob>b</Blob></Blobs>").unwrap();
        let blobs = tree.get("Blobs").unwrap();
        match blobs.get("Blob").unwrap() {
            XmlValue::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("expected array, got {:?}", other),
        }

        let single = decode_xml(b"<Blobs><Blob>a</Blob></Blobs>").unwrap();
        let blob = single.get("Blobs").unwrap().get("Blob").unwrap();
        assert_eq!(blob.text(), Some("a"));
    }

    #[test]
    fn status_classification_matches_taxonomy() {
        assert_eq!(classify_status(200), StatusClass::Success);
        assert_eq!(classify_status(408), StatusClass::Retryable);
        assert_eq!(classify_status(503), StatusClass::Retryable);
        assert_eq!(classify_status(404), StatusClass::ClientFatal);
    }

    #[test]
    fn extracts_xml_error_envelope_message() {
        let body = NormalizedBody::Xml(
            decode_xml(b"<Error><Code>ContainerNotFound</Code><Message>The specified container does not exist.</Message></Error>")
                .unwrap(),
        );
        let (code, message) = extract_error_envelope(&body);
        assert_eq!(code.as_deref(), Some("ContainerNotFound"));
        assert_eq!(message.as_deref(), Some("The specified container does not exist."));
    }

    #[tokio::test]
    async fn normalize_surfaces_the_envelope_code_on_the_error() {
        use crate::pipeline::transport::{RawResponse, ResponseBody};
        let xml = b"<Error><Code>ContainerNotFound</Code><Message>nope</Message></Error>";
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, "application/xml".parse().unwrap());
        let raw = RawResponse {
            status: 404,
            headers,
            body: ResponseBody::Buffer(Bytes::from_static(xml)),
            transport_digest: None,
        };
        let err = normalize(raw, false, Location::Primary).await.unwrap_err();
        assert_eq!(err.service_code.as_deref(), Some("ContainerNotFound"));
        assert_eq!(err.kind, ErrorKind::ResourceNotFound);
    }

    #[test]
    fn extracts_odata_error_envelope_with_flattened_message() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"odata.error": {"code": "InvalidInput", "message": {"lang": "en-US", "value": "bad request"}}}"#,
        )
        .unwrap();
        let (code, message) = extract_error_envelope(&NormalizedBody::Json(json));
        assert_eq!(code.as_deref(), Some("InvalidInput"));
        assert_eq!(message.as_deref(), Some("bad request"));
    }
}
