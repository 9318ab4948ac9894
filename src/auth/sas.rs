//! Shared Access Signature (SAS) token generation and parsing (§4.1, §3 Signed-Access Policy).

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::PINNED_API_VERSION;
use crate::error::{ErrorKind, StorageClientError, StorageClientResult};

type HmacSha256 = Hmac<Sha256>;

/// The service a SAS resource scope belongs to, used in the canonicalized
/// resource string `/<service>/<account><path>` (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Blob,
    File,
    Queue,
    Table,
}

impl Service {
    fn as_str(&self) -> &'static str {
        match self {
            Service::Blob => "blob",
            Service::File => "file",
            Service::Queue => "queue",
            Service::Table => "table",
        }
    }

    pub fn from_str(s: &str) -> Option<Service> {
        match s {
            "blob" => Some(Service::Blob),
            "file" => Some(Service::File),
            "queue" => Some(Service::Queue),
            "table" => Some(Service::Table),
            _ => None,
        }
    }
}

/// The resource a SAS token is scoped to.
#[derive(Debug, Clone)]
pub struct ResourceScope {
    pub service: Service,
    pub account: String,
    /// Resource path, e.g. `/container/blob`, not including the account.
    pub path: String,
    /// `sr` query value (`b`, `c`, `bs`, `bv`, ...), when the service uses one.
    pub signed_resource: Option<String>,
}

impl ResourceScope {
    pub fn canonicalized_resource(&self) -> String {
        format!("/{}/{}{}", self.service.as_str(), self.account, self.path)
    }
}

/// `rscc`/`rscd`/`rsce`/`rscl`/`rsct` response header overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaderOverrides {
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_type: Option<String>,
}

/// Table-service partition/row range (`spk`/`srk`/`epk`/`erk`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRowRange {
    pub start_partition_key: Option<String>,
    pub start_row_key: Option<String>,
    pub end_partition_key: Option<String>,
    pub end_row_key: Option<String>,
}

/// Immutable access policy consumed by the SAS generator (§3 Signed-Access Policy).
#[derive(Debug, Clone)]
pub struct SasPolicy {
    pub permissions: String,
    pub start: Option<DateTime<Utc>>,
    pub expiry: DateTime<Utc>,
    pub identifier: Option<String>,
    pub resource_scope: ResourceScope,
    pub response_header_overrides: Option<ResponseHeaderOverrides>,
    pub table_row_range: Option<TableRowRange>,
}

fn format_sas_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn parse_sas_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ")
                .ok()
                .map(|dt| dt.and_utc())
        })
}

fn hmac_sha256_base64(string_to_sign: &str, account_key_b64: &str) -> StorageClientResult<String> {
    let key_bytes = BASE64
        .decode(account_key_b64)
        .map_err(|_| StorageClientError::new(ErrorKind::InvalidKey, "account key is not valid base64"))?;
    let mut mac = HmacSha256::new_from_slice(&key_bytes)
        .map_err(|e| StorageClientError::new(ErrorKind::CanonicalizationError, e.to_string()))?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Builds the version-dependent string-to-sign (§4.1): permissions, start,
/// expiry, canonicalized resource, signed-identifier, version, then (when
/// applicable) response-header overrides and table partition/row ranges.
/// Empty optional fields still produce their delimiter newline.
fn build_string_to_sign(policy: &SasPolicy, version: &str) -> String {
    let mut lines = vec![
        policy.permissions.clone(),
        policy.start.map(|dt| format_sas_datetime(&dt)).unwrap_or_default(),
        format_sas_datetime(&policy.expiry),
        policy.resource_scope.canonicalized_resource(),
        policy.identifier.clone().unwrap_or_default(),
        version.to_string(),
    ];

    let overrides = policy.response_header_overrides.clone().unwrap_or_default();
    lines.push(overrides.cache_control.unwrap_or_default());
    lines.push(overrides.content_disposition.unwrap_or_default());
    lines.push(overrides.content_encoding.unwrap_or_default());
    lines.push(overrides.content_language.unwrap_or_default());
    lines.push(overrides.content_type.unwrap_or_default());

    if policy.resource_scope.service == Service::Table {
        let range = policy.table_row_range.clone().unwrap_or_default();
        lines.push(range.start_partition_key.unwrap_or_default());
        lines.push(range.start_row_key.unwrap_or_default());
        lines.push(range.end_partition_key.unwrap_or_default());
        lines.push(range.end_row_key.unwrap_or_default());
    }

    lines.join("\n")
}

/// Generates a full SAS query string (no leading `?`) for `policy` signed
/// with `account_key`. Rejects unknown wire versions (§4.1).
pub fn generate_sas(
    policy: &SasPolicy,
    account_key: &str,
    version: &str,
) -> StorageClientResult<String> {
    if version != PINNED_API_VERSION {
        return Err(StorageClientError::new(
            ErrorKind::InvalidInput,
            format!("unsupported SAS wire version: {}", version),
        ));
    }

    let string_to_sign = build_string_to_sign(policy, version);
    let signature = hmac_sha256_base64(&string_to_sign, account_key)?;

    let mut pairs: Vec<(&str, String)> = vec![("sv", version.to_string()), ("sp", policy.permissions.clone())];
    if let Some(start) = policy.start {
        pairs.push(("st", format_sas_datetime(&start)));
    }
    pairs.push(("se", format_sas_datetime(&policy.expiry)));
    if let Some(ref id) = policy.identifier {
        pairs.push(("si", id.clone()));
    }
    if let Some(ref sr) = policy.resource_scope.signed_resource {
        pairs.push(("sr", sr.clone()));
    }
    if let Some(ref overrides) = policy.response_header_overrides {
        if let Some(ref v) = overrides.cache_control {
            pairs.push(("rscc", v.clone()));
        }
        if let Some(ref v) = overrides.content_disposition {
            pairs.push(("rscd", v.clone()));
        }
        if let Some(ref v) = overrides.content_encoding {
            pairs.push(("rsce", v.clone()));
        }
        if let Some(ref v) = overrides.content_language {
            pairs.push(("rscl", v.clone()));
        }
        if let Some(ref v) = overrides.content_type {
            pairs.push(("rsct", v.clone()));
        }
    }
    if let Some(ref range) = policy.table_row_range {
        if let Some(ref v) = range.start_partition_key {
            pairs.push(("spk", v.clone()));
        }
        if let Some(ref v) = range.start_row_key {
            pairs.push(("srk", v.clone()));
        }
        if let Some(ref v) = range.end_partition_key {
            pairs.push(("epk", v.clone()));
        }
        if let Some(ref v) = range.end_row_key {
            pairs.push(("erk", v.clone()));
        }
    }
    pairs.push(("sig", signature));

    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter().map(|(k, v)| (*k, v.as_str())))
        .finish();
    Ok(query)
}

/// A parsed SAS token: the reconstructed policy, wire version, and signature.
#[derive(Debug, Clone)]
pub struct ParsedSas {
    pub policy: SasPolicy,
    pub version: String,
    pub signature: String,
}

/// Parses a SAS query string, tolerating an optional leading `?` (§4.1: "the
/// parser is its inverse"). `service`/`account`/`path` must be supplied by the
/// caller since they are not encoded in the query string itself.
pub fn parse_sas(
    query: &str,
    service: Service,
    account: &str,
    path: &str,
) -> StorageClientResult<ParsedSas> {
    let query = query.strip_prefix('?').unwrap_or(query);
    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    let get = |k: &str| params.get(k).cloned();
    let require = |k: &str| {
        params.get(k).cloned().ok_or_else(|| {
            StorageClientError::new(ErrorKind::InvalidInput, format!("missing required SAS field: {}", k))
        })
    };

    let version = require("sv")?;
    let permissions = require("sp")?;
    let expiry = get("se")
        .and_then(|s| parse_sas_datetime(&s))
        .ok_or_else(|| StorageClientError::new(ErrorKind::InvalidInput, "missing or invalid se"))?;
    let start = get("st").and_then(|s| parse_sas_datetime(&s));
    let identifier = get("si");
    let signed_resource = get("sr");
    let signature = require("sig")?;

    let overrides = ResponseHeaderOverrides {
        cache_control: get("rscc"),
        content_disposition: get("rscd"),
        content_encoding: get("rsce"),
        content_language: get("rscl"),
        content_type: get("rsct"),
    };
    let response_header_overrides = if overrides == ResponseHeaderOverrides::default() {
        None
    } else {
        Some(overrides)
    };

    let table_range = TableRowRange {
        start_partition_key: get("spk"),
        start_row_key: get("srk"),
        end_partition_key: get("epk"),
        end_row_key: get("erk"),
    };
    let table_row_range = if service == Service::Table && table_range != TableRowRange::default() {
        Some(table_range)
    } else {
        None
    };

    let policy = SasPolicy {
        permissions,
        start,
        expiry,
        identifier,
        resource_scope: ResourceScope {
            service,
            account: account.to_string(),
            path: path.to_string(),
            signed_resource,
        },
        response_header_overrides,
        table_row_range,
    };

    Ok(ParsedSas { policy, version, signature })
}
