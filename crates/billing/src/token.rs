//! Anonymous entitlement tokens
//!
//! Stateless grants for buyers without an account. The wire form is
//! `base64url(json) "." base64url(hmac_sha256(json))`; nothing is stored
//! server-side and the only revocation is expiry.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use fixitflow_shared::{Capability, PlanTier};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::plans::PlanCatalog;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymousToken {
    pub plan: PlanTier,
    #[serde(with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
    pub features: Vec<Capability>,
    pub session_id: String,
}

impl AnonymousToken {
    /// Build the token for a completed anonymous purchase. `issued_at` should
    /// come from the provider so re-issuing for the same checkout is stable.
    pub fn for_purchase(
        plan: PlanTier,
        session_id: impl Into<String>,
        issued_at: OffsetDateTime,
    ) -> BillingResult<Self> {
        let duration = PlanCatalog::duration(plan).ok_or_else(|| {
            BillingError::Validation(format!("Plan '{}' cannot be sold anonymously", plan))
        })?;

        Ok(Self {
            plan,
            expires_at: issued_at + duration,
            features: PlanCatalog::capabilities(plan).to_vec(),
            session_id: session_id.into(),
        })
    }

    pub fn encode(&self, secret: &[u8]) -> BillingResult<String> {
        let payload = serde_json::to_vec(self)?;
        let signature = sign(&payload, secret)?;
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Decode and verify. Unsigned or tampered tokens are rejected.
    pub fn decode(token: &str, secret: &[u8]) -> BillingResult<Self> {
        let (payload_b64, signature_b64) = token
            .trim()
            .split_once('.')
            .ok_or_else(|| BillingError::TokenDecode("missing signature".to_string()))?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| BillingError::TokenDecode(format!("payload: {}", e)))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| BillingError::TokenDecode(format!("signature: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| BillingError::Config("invalid token signing secret".to_string()))?;
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| BillingError::TokenDecode("signature mismatch".to_string()))?;

        serde_json::from_slice(&payload)
            .map_err(|e| BillingError::TokenDecode(format!("claims: {}", e)))
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    /// Capabilities still usable, empty once expired
    pub fn remaining_features(&self, now: OffsetDateTime) -> &[Capability] {
        if self.is_expired(now) {
            &[]
        } else {
            &self.features
        }
    }

    pub fn allows(&self, capability: Capability, now: OffsetDateTime) -> bool {
        !self.is_expired(now) && self.features.contains(&capability)
    }
}

fn sign(payload: &[u8], secret: &[u8]) -> BillingResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| BillingError::Config("invalid token signing secret".to_string()))?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}
