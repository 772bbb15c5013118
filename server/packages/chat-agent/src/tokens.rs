use std::fmt;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;

const TOKEN_BYTES: usize = 32;

/// Lifetime rules for capability tokens.
#[derive(Debug, Clone, Copy)]
pub struct TokenPolicy {
    pub ttl: Duration,
    /// A token this close to expiry is replaced on the next `start`.
    pub refresh_window: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            refresh_window: Duration::from_secs(60),
        }
    }
}

/// Bearer credential scoped to exactly one chat.
#[derive(Clone)]
pub struct CapabilityToken {
    value: String,
    chat_id: String,
    expires_at: DateTime<Utc>,
}

impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityToken")
            .field("value", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl CapabilityToken {
    pub fn mint(chat_id: &str, policy: &TokenPolicy) -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let ttl = chrono::Duration::from_std(policy.ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            value: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes),
            chat_id: chat_id.to_string(),
            expires_at: Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn needs_refresh(&self, policy: &TokenPolicy) -> bool {
        let window = chrono::Duration::from_std(policy.refresh_window).unwrap_or(chrono::Duration::MAX);
        match self.expires_at.checked_sub_signed(window) {
            Some(threshold) => Utc::now() >= threshold,
            None => true,
        }
    }

    /// True when `presented` is this token and it is presented for the chat it
    /// was minted for.
    pub fn authorizes(&self, chat_id: &str, presented: &str) -> bool {
        self.chat_id == chat_id && !self.is_expired() && constant_time_eq(&self.value, presented)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
