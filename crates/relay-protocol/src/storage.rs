use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached value together with its write time and expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: Value,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StoredEntry {
    pub fn new(value: Value, ttl: Duration) -> Self {
        let stored_at = Utc::now();
        Self {
            value,
            stored_at,
            expires_at: stored_at + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.stored_at
    }
}
