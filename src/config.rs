//! Client configuration: host pairs, location policy, and the closed per-request
//! options set (§9 — no dynamic property bag).

use url::Url;

/// Pinned wire version sent as `x-ms-version` on every request.
pub const PINNED_API_VERSION: &str = "2021-10-04";

/// Default account name and key for the local storage emulator, matching the
/// well-known development credentials.
pub const EMULATOR_ACCOUNT: &str = "devstoreaccount1";
pub const EMULATOR_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

/// Which physical location an attempt should target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Primary,
    Secondary,
}

impl Location {
    pub fn other(self) -> Location {
        match self {
            Location::Primary => Location::Secondary,
            Location::Secondary => Location::Primary,
        }
    }
}

/// Caller policy for whether to prefer primary, secondary, or alternate under retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationMode {
    PrimaryOnly,
    SecondaryOnly,
    PrimaryThenSecondary,
    SecondaryThenPrimary,
}

impl LocationMode {
    /// The location an operation under this mode starts at.
    pub fn initial_location(&self) -> Location {
        match self {
            LocationMode::PrimaryOnly | LocationMode::PrimaryThenSecondary => Location::Primary,
            LocationMode::SecondaryOnly | LocationMode::SecondaryThenPrimary => {
                Location::Secondary
            }
        }
    }

    /// Whether `loc` is a location this mode permits an attempt to use.
    pub fn allows(&self, loc: Location) -> bool {
        match self {
            LocationMode::PrimaryOnly => loc == Location::Primary,
            LocationMode::SecondaryOnly => loc == Location::Secondary,
            LocationMode::PrimaryThenSecondary | LocationMode::SecondaryThenPrimary => true,
        }
    }

    /// The next location to rotate to on retry, or `None` if this mode is pinned
    /// to a single location.
    pub fn next_location(&self, current: Location) -> Option<Location> {
        match self {
            LocationMode::PrimaryOnly | LocationMode::SecondaryOnly => None,
            LocationMode::PrimaryThenSecondary | LocationMode::SecondaryThenPrimary => {
                Some(current.other())
            }
        }
    }
}

/// A per-request constraint on which location(s) an operation may target,
/// independent of the client-wide [`LocationMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestLocationMode {
    PrimaryOnly,
    SecondaryOnly,
    Either,
}

impl RequestLocationMode {
    /// Resolves a forced location, or `None` when either location is acceptable.
    pub fn forced_location(&self) -> Option<Location> {
        match self {
            RequestLocationMode::PrimaryOnly => Some(Location::Primary),
            RequestLocationMode::SecondaryOnly => Some(Location::Secondary),
            RequestLocationMode::Either => None,
        }
    }
}

/// A pair of primary/secondary service endpoints. At least one must be present.
#[derive(Debug, Clone)]
pub struct HostConfiguration {
    primary: Option<Url>,
    secondary: Option<Url>,
    /// Path-style URIs (`/<account>/...`) vs. virtual-host style (account in subdomain).
    pub path_style: bool,
}

impl HostConfiguration {
    pub fn new(primary: Option<Url>, secondary: Option<Url>, path_style: bool) -> Self {
        assert!(
            primary.is_some() || secondary.is_some(),
            "at least one of primary/secondary host must be present"
        );
        Self {
            primary,
            secondary,
            path_style,
        }
    }

    pub fn primary_only(primary: Url, path_style: bool) -> Self {
        Self::new(Some(primary), None, path_style)
    }

    pub fn host_for(&self, location: Location) -> Option<&Url> {
        match location {
            Location::Primary => self.primary.as_ref(),
            Location::Secondary => self.secondary.as_ref(),
        }
    }

    /// Constructs host configuration for the well-known local emulator, which
    /// always uses path-style URIs.
    pub fn emulator(blob_endpoint: Url) -> Self {
        Self::new(Some(blob_endpoint), None, true)
    }
}

/// Controls whether `Content-Type` is sent as empty, omitted (library default),
/// or stripped entirely (§4.2, §10.5).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ContentTypeDisposition {
    /// No opinion: let the transport/library default apply.
    #[default]
    LibraryDefault,
    /// Send an explicit empty `Content-Type` header.
    PresentEmpty,
    /// Suppress the header entirely.
    Stripped,
    /// Send this exact value.
    Explicit(String),
}

/// An `If-*` precondition and/or lease scoping bundle (§9 "dynamic property
/// bags" — `accessConditions`/`sourceAccessConditions`), appended to a request
/// as conditional headers rather than carried loose on `RequestOptions`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessConditions {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
    pub if_unmodified_since: Option<String>,
    pub lease_id: Option<String>,
}

/// The closed set of recognized per-request options (§9). Unknown keys are a
/// compile error rather than a runtime rejection, since there is no catch-all field.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub timeout_interval_ms: Option<u64>,
    pub maximum_execution_time_ms: Option<u64>,
    pub location_mode: LocationMode,
    pub request_location_mode: RequestLocationMode,
    pub use_nagle: bool,
    pub disable_content_md5_validation: bool,
    pub client_request_id: Option<String>,
    pub range_start: Option<u64>,
    pub range_end: Option<u64>,
    pub parallel_operation_thread_count: usize,
    /// Overrides `Accept-Encoding`/body decoding for the response, e.g. `"gzip"`.
    pub response_encoding: Option<String>,
    /// Conditional headers scoping the operation itself (the `If-*`/lease
    /// headers on a write or read against the target resource).
    pub access_conditions: Option<AccessConditions>,
    /// Conditional headers scoping a copy source, kept separate since a copy
    /// operation has independent preconditions on source and destination.
    pub source_access_conditions: Option<AccessConditions>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout_interval_ms: None,
            maximum_execution_time_ms: None,
            location_mode: LocationMode::PrimaryOnly,
            request_location_mode: RequestLocationMode::Either,
            use_nagle: false,
            disable_content_md5_validation: false,
            client_request_id: None,
            range_start: None,
            range_end: None,
            parallel_operation_thread_count: 1,
            response_encoding: None,
            access_conditions: None,
            source_access_conditions: None,
        }
    }
}

/// Top-level client configuration, constructed once and never mutated (§5).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub account: String,
    pub hosts: HostConfiguration,
    pub proxy: Option<Url>,
    pub emulated: bool,
}

/// Builder mirroring the `Config`/`Args` split this workspace already uses for
/// construction-time ergonomics around a fully-specified runtime struct.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    account: Option<String>,
    primary: Option<Url>,
    secondary: Option<Url>,
    path_style: bool,
    proxy: Option<Url>,
    emulated: bool,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn primary_host(mut self, url: Url) -> Self {
        self.primary = Some(url);
        self
    }

    pub fn secondary_host(mut self, url: Url) -> Self {
        self.secondary = Some(url);
        self
    }

    pub fn path_style(mut self, path_style: bool) -> Self {
        self.path_style = path_style;
        self
    }

    pub fn proxy(mut self, url: Url) -> Self {
        self.proxy = Some(url);
        self
    }

    pub fn emulated(mut self, emulated: bool) -> Self {
        self.emulated = emulated;
        self
    }

    pub fn build(self) -> Result<ClientConfig, &'static str> {
        let account = self.account.ok_or("account is required")?;
        if self.primary.is_none() && self.secondary.is_none() {
            return Err("at least one of primary/secondary host must be configured");
        }
        Ok(ClientConfig {
            account,
            hosts: HostConfiguration::new(self.primary, self.secondary, self.path_style),
            proxy: self.proxy,
            emulated: self.emulated,
        })
    }

    /// Convenience constructor matching the well-known emulator account/key/endpoint.
    pub fn for_emulator(blob_endpoint: Url) -> ClientConfig {
        ClientConfig {
            account: EMULATOR_ACCOUNT.to_string(),
            hosts: HostConfiguration::emulator(blob_endpoint),
            proxy: None,
            emulated: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_mode_rotation() {
        assert_eq!(
            LocationMode::PrimaryThenSecondary.next_location(Location::Primary),
            Some(Location::Secondary)
        );
        assert_eq!(LocationMode::PrimaryOnly.next_location(Location::Primary), None);
    }

    #[test]
    fn builder_requires_account_and_host() {
        assert!(ClientConfigBuilder::new().build().is_err());
        assert!(ClientConfigBuilder::new().account("a").build().is_err());
        let cfg = ClientConfigBuilder::new()
            .account("a")
            .primary_host(Url::parse("https://a.blob.core.example/").unwrap())
            .build()
            .unwrap();
        assert_eq!(cfg.account, "a");
    }
}
