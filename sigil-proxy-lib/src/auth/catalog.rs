use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Deserialize;

use crate::error::{ProxyError, Result};

/// User role. At most one user in a catalog may hold `SuperAdmin`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
    SuperAdmin,
}

/// A single proxy account as stored in the user catalog file.
///
/// All limit fields treat 0 as "unlimited".
#[derive(Debug, Deserialize, Clone)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub role: Role,
    /// Adaptive (bcrypt) hash of the account password
    pub password_hash: String,
    #[serde(default)]
    pub rate_limit_rpm: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub bandwidth_limit_gb: u64,
    #[serde(default)]
    pub bandwidth_speed_mbps: u64,
    #[serde(default)]
    pub max_connections: u32,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_super_admin(&self) -> bool {
        self.role == Role::SuperAdmin
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    ip_whitelist: Vec<String>,
    #[serde(default)]
    super_admin_ips: Vec<String>,
}

/// Immutable snapshot of the user catalog. Replaced whole-for-whole on
/// reload; the data plane never mutates it.
#[derive(Debug, Default)]
pub struct Catalog {
    users: HashMap<String, Arc<User>>,
    client_allowlist: Vec<IpNet>,
    super_admin_nets: Vec<IpNet>,
    super_admin: Option<Arc<User>>,
}

impl Catalog {
    /// Load and validate a catalog from a JSON document.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let txt = fs::read_to_string(&path)
            .map_err(|e| ProxyError::Config(format!("Failed to read user catalog: {e}")))?;
        let file: CatalogFile = serde_json::from_str(&txt)
            .map_err(|e| ProxyError::Config(format!("Failed to parse user catalog: {e}")))?;

        let mut users = HashMap::with_capacity(file.users.len());
        let mut super_admin = None;
        for mut user in file.users {
            user.username = user.username.to_ascii_lowercase();
            let user = Arc::new(user);
            if user.is_super_admin() {
                if super_admin.is_some() {
                    return Err(ProxyError::Config(
                        "at most one user may have role super_admin".to_string(),
                    ));
                }
                super_admin = Some(user.clone());
            }
            if users.insert(user.username.clone(), user.clone()).is_some() {
                return Err(ProxyError::DuplicateUser(user.username.clone()));
            }
        }

        Ok(Self {
            users,
            client_allowlist: parse_cidrs(&file.ip_whitelist)?,
            super_admin_nets: parse_cidrs(&file.super_admin_ips)?,
            super_admin,
        })
    }

    pub fn user(&self, username: &str) -> Option<&Arc<User>> {
        self.users.get(&username.to_ascii_lowercase())
    }

    /// An empty allowlist admits every client.
    pub fn client_allowed(&self, ip: IpAddr) -> bool {
        self.client_allowlist.is_empty() || self.client_allowlist.iter().any(|n| n.contains(&ip))
    }

    pub fn is_super_admin_ip(&self, ip: IpAddr) -> bool {
        self.super_admin_nets.iter().any(|n| n.contains(&ip))
    }

    pub fn super_admin(&self) -> Option<&Arc<User>> {
        self.super_admin.as_ref()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Parse CIDR ranges; a bare IP implies /32 (v4) or /128 (v6).
fn parse_cidrs(ranges: &[String]) -> Result<Vec<IpNet>> {
    ranges
        .iter()
        .map(|s| {
            if let Ok(net) = s.parse::<IpNet>() {
                return Ok(net);
            }
            if let Ok(ip) = s.parse::<IpAddr>() {
                return Ok(IpNet::from(ip));
            }
            Err(ProxyError::InvalidCidr(s.clone()))
        })
        .collect()
}
