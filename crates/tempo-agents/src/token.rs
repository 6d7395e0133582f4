//! Agent bearer tokens.
//!
//! Format: `<agent_id>.<expiry_unix>.<hex hmac-sha256>` where the MAC covers
//! `<agent_id>.<expiry_unix>`. The agent id may itself contain dots, so
//! tokens are split from the right.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tempo_core::AgentId;

use crate::error::{AgentError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Issues and verifies agent tokens with a shared secret.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl_secs: u64) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl: Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX / 1000)),
        }
    }

    /// Token lifetime in seconds, reported to agents as `expires_in`.
    pub fn ttl_secs(&self) -> u64 {
        u64::try_from(self.ttl.num_seconds()).unwrap_or(0)
    }

    pub fn issue(&self, agent_id: &AgentId, now: DateTime<Utc>) -> Result<String> {
        let expiry = (now + self.ttl).timestamp();
        let payload = format!("{agent_id}.{expiry}");
        let sig = hex::encode(self.mac(&payload)?.finalize().into_bytes());
        Ok(format!("{payload}.{sig}"))
    }

    /// Return the agent the token was issued to, if it is authentic and unexpired.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<AgentId> {
        let mut parts = token.rsplitn(3, '.');
        let (Some(sig_hex), Some(expiry), Some(agent_id)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(AgentError::InvalidToken("malformed token".to_string()));
        };

        let sig = hex::decode(sig_hex)
            .map_err(|_| AgentError::InvalidToken("signature is not valid hex".to_string()))?;
        self.mac(&format!("{agent_id}.{expiry}"))?
            .verify_slice(&sig)
            .map_err(|_| AgentError::InvalidToken("signature mismatch".to_string()))?;

        let expiry: i64 = expiry
            .parse()
            .map_err(|_| AgentError::InvalidToken("malformed expiry".to_string()))?;
        if now.timestamp() >= expiry {
            return Err(AgentError::InvalidToken("token expired".to_string()));
        }

        Ok(AgentId::from(agent_id))
    }

    fn mac(&self, payload: &str) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| AgentError::InvalidToken("invalid HMAC key length".to_string()))?;
        mac.update(payload.as_bytes());
        Ok(mac)
    }
}
