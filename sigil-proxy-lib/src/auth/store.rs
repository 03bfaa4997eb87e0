use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use crate::auth::cache::CredentialCache;
use crate::auth::{Catalog, User};
use crate::error::Result;

/// Authentication front-end shared by every engine.
///
/// The catalog handle swaps atomically on reload; readers only ever copy
/// the handle. The credential cache has its own lock and is emptied on
/// every swap so a password change invalidates outstanding validations.
pub struct IdentityStore {
    catalog: ArcSwap<Catalog>,
    cache: CredentialCache,
}

impl IdentityStore {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog: ArcSwap::from_pointee(catalog), cache: CredentialCache::default() }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(Catalog::load(path)?))
    }

    /// Replace the catalog whole-for-whole. Existing sessions keep their
    /// `Arc<User>` references; the credential cache starts empty.
    pub fn reload<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let catalog = Catalog::load(path)?;
        debug!(users = catalog.len(), "user catalog reloaded");
        self.catalog.store(Arc::new(catalog));
        self.cache.clear();
        Ok(())
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.load_full()
    }

    /// Validate presented credentials. Disabled users never authenticate;
    /// only positive results are cached.
    pub fn validate(&self, username: &str, password: &str) -> Option<Arc<User>> {
        let username = username.to_ascii_lowercase();
        let catalog = self.catalog.load_full();
        let user = catalog.user(&username)?.clone();
        if !user.enabled {
            return None;
        }

        let key = CredentialCache::key(&username, password);
        if let Some(hit) = self.cache.get(&key) {
            return Some(hit);
        }

        // bcrypt::verify compares in constant time and is deliberately slow.
        match bcrypt::verify(password, &user.password_hash) {
            Ok(true) => {
                self.cache.insert(key, user.clone());
                Some(user)
            }
            Ok(false) => None,
            Err(e) => {
                warn!(user = %username, error = %e, "unverifiable password hash");
                None
            }
        }
    }

    pub fn client_allowed(&self, ip: IpAddr) -> bool {
        self.catalog.load().client_allowed(ip)
    }

    /// The super_admin user, but only for clients inside a super-admin range.
    pub fn super_admin_for(&self, ip: IpAddr) -> Option<Arc<User>> {
        let catalog = self.catalog.load();
        if catalog.is_super_admin_ip(ip) {
            catalog.super_admin().cloned()
        } else {
            None
        }
    }

    pub fn invalidate(&self, username: &str) {
        self.cache.invalidate_user(&username.to_ascii_lowercase());
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    #[doc(hidden)]
    pub fn cached_validations(&self) -> usize {
        self.cache.len()
    }
}
