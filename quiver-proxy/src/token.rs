//! Stateless selection tokens.
//!
//! A token carries the full selection context across the select -> feedback
//! gap so the feedback path never touches the catalog or the selector. Wire
//! format: `base64url( json(payload) || HMAC-SHA256(json(payload))[..16] )`
//! with compact payload keys. The signing secret is process configuration
//! and never appears in payloads, messages, or logs.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use quiver_core::Context;

type HmacSha256 = Hmac<Sha256>;

const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token expired: age {age_ms}ms exceeds {max_age_ms}ms")]
    Expired { age_ms: i64, max_age_ms: i64 },
}

/// Decoded selection data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionEntry {
    #[serde(rename = "exp_id")]
    pub experiment_id: String,
    #[serde(rename = "arm_idx")]
    pub arm_index: usize,
    #[serde(rename = "ctx_id")]
    pub context_id: String,
    #[serde(rename = "ctx_vec")]
    pub context_vector: Vec<f64>,
    #[serde(rename = "ctx_meta")]
    pub context_metadata: HashMap<String, String>,
    #[serde(rename = "ts")]
    pub timestamp_ms: i64,
}

pub struct TokenCodec {
    secret: Vec<u8>,
    max_age_ms: Option<i64>,
}

// The secret stays out of Debug output.
impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("max_age_ms", &self.max_age_ms)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(secret: impl Into<Vec<u8>>, max_age_ms: Option<i64>) -> Self {
        Self {
            secret: secret.into(),
            max_age_ms,
        }
    }

    pub fn encode(
        &self,
        experiment_id: &str,
        arm_index: usize,
        context: &Context,
    ) -> Result<String, TokenError> {
        let payload = SelectionEntry {
            experiment_id: experiment_id.to_string(),
            arm_index,
            context_id: context.id.clone(),
            context_vector: context.vector.clone(),
            context_metadata: context.metadata.clone(),
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        let mut raw = serde_json::to_vec(&payload)
            .map_err(|e| TokenError::Invalid(format!("payload encoding: {e}")))?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| TokenError::Invalid(format!("mac init: {e}")))?;
        mac.update(&raw);
        let tag = mac.finalize().into_bytes();
        raw.extend_from_slice(&tag[..TAG_LEN]);
        Ok(URL_SAFE.encode(raw))
    }

    /// Verify and decode. Order matters: encoding, length, constant-time tag
    /// check, JSON parse, then the age check.
    pub fn decode(&self, token: &str) -> Result<SelectionEntry, TokenError> {
        let raw = URL_SAFE
            .decode(token)
            .map_err(|e| TokenError::Invalid(format!("bad encoding: {e}")))?;
        if raw.len() < TAG_LEN + 1 {
            return Err(TokenError::Invalid("token too short".to_string()));
        }
        let (data, tag) = raw.split_at(raw.len() - TAG_LEN);
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| TokenError::Invalid(format!("mac init: {e}")))?;
        mac.update(data);
        // Constant-time comparison of the truncated tag.
        mac.verify_truncated_left(tag)
            .map_err(|_| TokenError::Invalid("signature mismatch".to_string()))?;

        let payload: SelectionEntry = serde_json::from_slice(data)
            .map_err(|e| TokenError::Invalid(format!("bad payload: {e}")))?;

        if let Some(max_age_ms) = self.max_age_ms {
            let age_ms = Utc::now().timestamp_millis() - payload.timestamp_ms;
            if age_ms > max_age_ms {
                return Err(TokenError::Expired { age_ms, max_age_ms });
            }
        }
        Ok(payload)
    }
}
