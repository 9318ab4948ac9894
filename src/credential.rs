//! Credential types consumed by the signing engine (§3 Credential).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StorageClientResult;

/// Supplies a bearer token on demand. Refresh is the provider's responsibility;
/// the signing engine treats it as opaque (§4.1 Bearer signing).
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> StorageClientResult<String>;
}

impl fmt::Debug for dyn TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn TokenProvider")
    }
}

/// The authentication scheme a request is signed with (§3 Credential).
#[derive(Clone)]
pub enum Credential {
    SharedKey {
        account: String,
        /// Base64-encoded account key.
        key: String,
        path_style: bool,
    },
    SharedAccessSignature(String),
    Bearer(Arc<dyn TokenProvider>),
    Anonymous,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::SharedKey { account, path_style, .. } => f
                .debug_struct("SharedKey")
                .field("account", account)
                .field("path_style", path_style)
                .field("key", &"<redacted>")
                .finish(),
            Credential::SharedAccessSignature(_) => {
                f.debug_tuple("SharedAccessSignature").field(&"<redacted>").finish()
            }
            Credential::Bearer(_) => f.debug_tuple("Bearer").field(&"<provider>").finish(),
            Credential::Anonymous => write!(f, "Anonymous"),
        }
    }
}
