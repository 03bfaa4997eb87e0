use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use sha2::{Digest, Sha256};

use crate::auth::User;

/// How long a positive credential validation stays cached.
pub const CACHE_TTL: Duration = Duration::from_secs(300);

struct Entry {
    user: Arc<User>,
    expires_at: Instant,
}

/// Cache of positive credential validations.
///
/// The adaptive hash comparison costs on the order of 100 ms; an HTTP proxy
/// authenticates every request and needs this cache to stay upright. Keys
/// are `lower(username) + ":" + hex(sha256(password))` so no plaintext
/// password is ever held. Negative results are never cached.
#[derive(Default)]
pub struct CredentialCache {
    entries: Mutex<AHashMap<String, Entry>>,
}

impl CredentialCache {
    pub fn key(username_lower: &str, password: &str) -> String {
        let digest = Sha256::digest(password.as_bytes());
        let mut key = String::with_capacity(username_lower.len() + 1 + digest.len() * 2);
        key.push_str(username_lower);
        key.push(':');
        for byte in digest {
            key.push_str(&format!("{byte:02x}"));
        }
        key
    }

    /// Expired entries are pruned lazily on lookup.
    pub fn get(&self, key: &str) -> Option<Arc<User>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.user.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, user: Arc<User>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, Entry { user, expires_at: Instant::now() + CACHE_TTL });
    }

    /// Drop every cached validation for one username.
    pub fn invalidate_user(&self, username_lower: &str) {
        let prefix = format!("{username_lower}:");
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|k, _| !k.starts_with(&prefix));
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
