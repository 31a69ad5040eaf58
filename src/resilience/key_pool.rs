use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const PLACEHOLDER_MARKERS: &[&str] = &[
    "your",
    "placeholder",
    "changeme",
    "change_me",
    "example",
    "insert",
    "replace",
    "xxxx",
    "<",
    ">",
    "...",
];

const MIN_CREDENTIAL_LEN: usize = 20;

/// Ordered, non-empty set of structurally valid credentials for one provider.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredentialSet {
    keys: Vec<String>,
}

impl ProviderCredentialSet {
    /// Keep only the structurally valid credentials, in order, without
    /// duplicates. Returns `None` when nothing usable remains, which marks
    /// the provider as unconfigured.
    pub fn from_keys<I, S>(keys: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut valid: Vec<String> = Vec::new();
        for key in keys {
            let key = key.as_ref().trim();
            if Self::is_valid_credential(key) && !valid.iter().any(|k| k == key) {
                valid.push(key.to_string());
            }
        }

        if valid.is_empty() {
            None
        } else {
            Some(Self { keys: valid })
        }
    }

    /// Rejects empty, short, whitespace-bearing and placeholder-looking keys.
    pub fn is_valid_credential(key: &str) -> bool {
        if key.len() < MIN_CREDENTIAL_LEN {
            return false;
        }
        if !key.chars().all(|c| c.is_ascii_graphic()) {
            return false;
        }
        let lower = key.to_lowercase();
        !PLACEHOLDER_MARKERS.iter().any(|marker| lower.contains(marker))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

impl std::fmt::Debug for ProviderCredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.keys.iter().map(|k| mask_key(k)))
            .finish()
    }
}

/// Short fingerprint of a credential for logs: first four and last four characters.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

/// When a spent quota becomes available again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum QuotaReset {
    /// Fixed daily boundary at the given UTC hour.
    DailyUtc {
        #[serde(default)]
        hour: u32,
    },
    /// Rolling window starting at the moment of exhaustion.
    Rolling { window_secs: u64 },
}

impl Default for QuotaReset {
    fn default() -> Self {
        QuotaReset::DailyUtc { hour: 0 }
    }
}

impl QuotaReset {
    /// First reset boundary strictly after `now`.
    pub fn next_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            QuotaReset::DailyUtc { hour } => {
                let today = now
                    .date_naive()
                    .and_hms_opt(hour.min(23), 0, 0)
                    .map(|naive| naive.and_utc());
                match today {
                    Some(boundary) if boundary > now => boundary,
                    Some(boundary) => boundary + ChronoDuration::days(1),
                    None => now + ChronoDuration::days(1),
                }
            }
            QuotaReset::Rolling { window_secs } => {
                now + ChronoDuration::seconds(window_secs.clamp(1, i64::MAX as u64) as i64)
            }
        }
    }
}

/// Exhaustion record for one credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyState {
    pub exhausted_until: Option<DateTime<Utc>>,
}

impl KeyState {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        match self.exhausted_until {
            None => true,
            Some(until) => until <= now,
        }
    }
}

/// Snapshot of a pool for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total_keys: usize,
    pub usable_keys: usize,
    pub next_available: Option<DateTime<Utc>>,
}

/// Rotating credential pool for one (provider, tier) pair.
///
/// All reads and writes go through one mutex so that concurrent requests
/// observe each other's exhaustion marks immediately.
#[derive(Debug)]
pub struct KeyRotationPool {
    label: String,
    credentials: ProviderCredentialSet,
    reset: QuotaReset,
    state: Arc<Mutex<PoolState>>,
}

#[derive(Debug)]
struct PoolState {
    cursor: usize,
    keys: Vec<KeyState>,
}

impl KeyRotationPool {
    pub fn new(
        label: impl Into<String>,
        credentials: ProviderCredentialSet,
        reset: QuotaReset,
    ) -> Self {
        let state = PoolState {
            cursor: 0,
            keys: vec![KeyState::default(); credentials.len()],
        };

        Self {
            label: label.into(),
            credentials,
            reset,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// The reset boundary that exhaustion marks made now should use.
    pub fn next_reset(&self) -> DateTime<Utc> {
        self.reset.next_boundary(Utc::now())
    }

    /// First usable credential at or after the cursor, wrapping around.
    /// Moves the cursor onto the credential it returns.
    pub async fn current_key(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let len = state.keys.len();

        for offset in 0..len {
            let index = (state.cursor + offset) % len;
            if state.keys[index].is_usable_at(now) {
                if offset > 0 {
                    debug!(
                        "Pool {} skipped {} exhausted key(s), now on key #{}",
                        self.label, offset, index
                    );
                }
                state.cursor = index;
                return self.credentials.keys.get(index).cloned();
            }
        }

        None
    }

    /// Mark the credential under the cursor exhausted and advance.
    pub async fn mark_current_exhausted(&self, until: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        let index = state.cursor;
        self.exhaust_locked(&mut state, index, until);
    }

    /// Mark a specific credential exhausted.
    ///
    /// Requests that raced on the same key mark that key, not whichever one
    /// the cursor moved to in the meantime. Returns `false` for unknown keys.
    pub async fn mark_exhausted(&self, key: &str, until: DateTime<Utc>) -> bool {
        let Some(index) = self.credentials.keys.iter().position(|k| k == key) else {
            return false;
        };
        let mut state = self.state.lock().await;
        self.exhaust_locked(&mut state, index, until);
        true
    }

    fn exhaust_locked(&self, state: &mut PoolState, index: usize, until: DateTime<Utc>) {
        let len = state.keys.len();
        if len == 0 {
            return;
        }
        state.keys[index].exhausted_until = Some(until);
        if state.cursor == index {
            state.cursor = (index + 1) % len;
        }
        info!(
            "Pool {} marked key {} exhausted until {}",
            self.label,
            mask_key(&self.credentials.keys[index]),
            until
        );
    }

    /// Clear every exhaustion mark and rewind the cursor.
    pub async fn reset_all(&self) {
        let mut state = self.state.lock().await;
        for key in state.keys.iter_mut() {
            key.exhausted_until = None;
        }
        state.cursor = 0;
        info!("Pool {} reset, {} key(s) usable", self.label, state.keys.len());
    }

    pub async fn all_exhausted(&self) -> bool {
        let state = self.state.lock().await;
        let now = Utc::now();
        !state.keys.iter().any(|k| k.is_usable_at(now))
    }

    pub async fn key_states(&self) -> Vec<KeyState> {
        self.state.lock().await.keys.clone()
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let now = Utc::now();
        let usable_keys = state.keys.iter().filter(|k| k.is_usable_at(now)).count();
        let next_available = if usable_keys > 0 {
            None
        } else {
            state.keys.iter().filter_map(|k| k.exhausted_until).min()
        };

        PoolStatus {
            total_keys: state.keys.len(),
            usable_keys,
            next_available,
        }
    }
}
