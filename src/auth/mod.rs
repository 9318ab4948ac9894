//! Authentication engine: dispatches to the signer matching the active
//! [`Credential`] (§4.1).

pub mod bearer;
pub mod sas;
pub mod shared_key;

use crate::credential::Credential;
use crate::error::StorageClientResult;
use crate::request::FinalizedRequest;

/// Signs `req` in place according to `credential`. Anonymous credentials are
/// a no-op (§4.1).
pub async fn sign(req: &mut FinalizedRequest, credential: &Credential) -> StorageClientResult<()> {
    match credential {
        Credential::SharedKey { account, key, .. } => shared_key::sign_request(req, account, key),
        Credential::SharedAccessSignature(token) => {
            req.append_sas_token(token);
            Ok(())
        }
        Credential::Bearer(provider) => bearer::sign_request(req, provider.as_ref()).await,
        Credential::Anonymous => Ok(()),
    }
}
