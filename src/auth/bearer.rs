//! Bearer token signing (§4.1). The token provider is opaque; refresh is its
//! own responsibility.

use http::HeaderValue;
use tracing::warn;

use crate::credential::TokenProvider;
use crate::error::{ErrorKind, StorageClientError, StorageClientResult};
use crate::request::FinalizedRequest;

pub async fn sign_request(
    req: &mut FinalizedRequest,
    provider: &dyn TokenProvider,
) -> StorageClientResult<()> {
    let token = provider.token().await.map_err(|err| {
        warn!(error = %err, "bearer token provider failed");
        err
    })?;
    let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| StorageClientError::new(ErrorKind::CanonicalizationError, e.to_string()))?;
    req.set_authorization(value);
    Ok(())
}
