//! Stable account-key derivation for login de-duplication.

use crate::auth::credential::QwenCredential;
use crate::utils::jwt::decode_jwt_claims;
use sha2::{Digest, Sha256};

/// Derive a stable identity fingerprint for a credential.
///
/// Prefers a claim embedded in the access token (`sub`, then `email`); falls
/// back to a hash of the refresh token for opaque access tokens. The refresh
/// token itself never appears in the accounts file in fingerprint form.
pub fn derive_account_key(cred: &QwenCredential) -> String {
    if let Some(claims) = decode_jwt_claims(&cred.access_token) {
        for claim in ["sub", "email"] {
            if let Some(value) = claims.get(claim).and_then(|v| v.as_str()) {
                if !value.is_empty() {
                    return format!("{claim}:{value}");
                }
            }
        }
    }

    let digest = Sha256::digest(cred.refresh_token.as_bytes());
    format!("rt:{digest:x}")
}
