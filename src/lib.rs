//! Core request pipeline, signing, and streaming engine for a cloud blob
//! storage client.
//!
//! This crate provides the request pipeline and retry/location engine, the
//! streaming upload/download engine, and the authentication/signing engine
//! that a higher-level, per-service client builds on. It does not itself
//! expose blob/container/queue/table operations.
//!
//! # Example
//!
//! ```no_run
//! use storage_client_core::config::{ClientConfigBuilder, Location, RequestOptions};
//! use storage_client_core::credential::Credential;
//! use storage_client_core::pipeline::retry::RetryPolicy;
//! use storage_client_core::pipeline::transport::HyperTransport;
//! use storage_client_core::pipeline::PipelineExecutor;
//! use storage_client_core::request::RequestBuilder;
//! use std::sync::Arc;
//! use url::Url;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfigBuilder::new()
//!     .account("myaccount")
//!     .primary_host(Url::parse("https://myaccount.blob.core.windows.net/")?)
//!     .build()?;
//! let credential = Credential::SharedKey {
//!     account: "myaccount".to_string(),
//!     key: "base64key==".to_string(),
//!     path_style: false,
//! };
//! let executor = PipelineExecutor::new(
//!     credential,
//!     RetryPolicy::exponential_default(),
//!     Arc::new(HyperTransport::new()),
//! );
//! let options = RequestOptions::default();
//! let _location = Location::Primary;
//! let _response = executor
//!     .execute(&config, &options, || Ok(RequestBuilder::new(http::Method::GET, "/container")))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod credential;
pub mod error;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod streaming;

pub use config::{ClientConfig, ClientConfigBuilder, HostConfiguration, Location, LocationMode, RequestLocationMode, RequestOptions};
pub use credential::{Credential, TokenProvider};
pub use error::{ErrorKind, StorageClientError, StorageClientResult};
pub use pipeline::retry::RetryPolicy;
pub use pipeline::transport::{DigestSlot, HttpTransport, HyperTransport, RawResponse, ResponseBody, TransportDigest};
pub use pipeline::{ExecutionContext, Filter, PipelineExecutor};
pub use request::{FinalizedRequest, RequestBody, RequestBuilder};
pub use response::{NormalizedBody, NormalizedResponse, XmlValue};
pub use streaming::batch_scheduler::{BatchScheduler, SchedulerLimits};
pub use streaming::range_planner::{Range, RangeKind, RangePlanner, RemoteRangeSource};
