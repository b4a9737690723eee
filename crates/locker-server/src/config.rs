//! Server configuration for Locker.
//!
//! Loaded from `LOCKER_*` environment variables with development defaults.
//! Parsing goes through a lookup function so it can be tested without
//! touching the process environment.

use std::net::SocketAddr;

use locker_core::tenant::validate_alias;

/// Configuration errors. Reported once at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("{var} is required when a tenant uses persistent storage")]
    Missing { var: &'static str },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Tenant databases, in declaration order.
    pub tenants: Vec<TenantConfig>,
    /// Alias used when a request names no tenant.
    pub default_tenant: String,
    /// Hex-encoded 32-byte master key. Tenant keys are derived from it.
    pub secret_key: Option<String>,
    /// HMAC secret for access tokens. Derived from the master key if unset.
    pub jwt_secret: Option<String>,
    /// Log level filter (e.g., `info`, `debug`, `locker_core=trace`).
    pub log_level: String,
    /// Append activity events to this JSON-lines file as well.
    pub event_file: Option<String>,
    /// Seconds between scheduled job passes.
    pub job_interval_secs: u64,
    /// Domain of generated relay addresses.
    pub relay_domain: String,
    /// Shared secret the mail transport presents on inbound relay calls.
    /// Inbound routing is disabled without it.
    pub relay_secret: Option<String>,
    /// Token for the operator endpoints under `/api/admin`. Disabled if unset.
    pub admin_token: Option<String>,
    /// Maximum concurrent in-flight requests.
    pub max_concurrency: usize,
}

/// One tenant alias and where its records live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantConfig {
    pub alias: String,
    pub storage: StorageBackendType,
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development only, data lost on restart).
    Memory,
    /// `RocksDB` database directory.
    RocksDb { path: String },
    /// PostgreSQL connection string.
    Postgres { url: String },
}

impl StorageBackendType {
    /// Parse a tenant database URL: `memory://`, `postgres://…`,
    /// `postgresql://…` or `rocksdb:///path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown scheme or empty path.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            var: "LOCKER_DATABASES",
            reason: reason.to_owned(),
        };
        let url = url.trim();
        if url == "memory" || url.starts_with("memory://") {
            Ok(Self::Memory)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Self::Postgres { url: url.to_owned() })
        } else if let Some(path) = url.strip_prefix("rocksdb://") {
            if path.is_empty() {
                return Err(invalid("rocksdb url has no path"));
            }
            Ok(Self::RocksDb { path: path.to_owned() })
        } else {
            Err(invalid("unsupported database url scheme"))
        }
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        !matches!(self, Self::Memory)
    }
}

/// Parse `alias=url,alias=url`.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] for a malformed entry, alias or URL, or
/// a repeated alias.
pub fn parse_databases(value: &str) -> Result<Vec<TenantConfig>, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        var: "LOCKER_DATABASES",
        reason,
    };

    let mut tenants: Vec<TenantConfig> = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (alias, url) = entry
            .split_once('=')
            .ok_or_else(|| invalid(format!("expected alias=url, got '{entry}'")))?;
        let alias = alias.trim();
        validate_alias(alias).map_err(|e| invalid(e.to_string()))?;
        if tenants.iter().any(|t| t.alias == alias) {
            return Err(invalid(format!("alias '{alias}' listed twice")));
        }
        tenants.push(TenantConfig {
            alias: alias.to_owned(),
            storage: StorageBackendType::parse(url)?,
        });
    }

    if tenants.is_empty() {
        return Err(invalid("no tenants configured".to_owned()));
    }
    Ok(tenants)
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT`: port to bind on, all interfaces
    /// - `LOCKER_BIND_ADDR`: full bind address (overrides `PORT`, default: `127.0.0.1:8300`)
    /// - `LOCKER_DATABASES`: `alias=url,…` (default: `DATABASE_URL` as tenant `main`, else `main=memory://`)
    /// - `LOCKER_DEFAULT_TENANT`: default alias (default: the first tenant)
    /// - `LOCKER_SECRET_KEY`: hex master key, required for persistent tenants
    /// - `LOCKER_JWT_SECRET`: access token secret (default: derived from the master key)
    /// - `LOCKER_LOG_LEVEL`: log filter (default: `info`)
    /// - `LOCKER_EVENT_FILE`: JSON-lines event file (optional)
    /// - `LOCKER_JOB_INTERVAL`: seconds between job passes (default: `300`)
    /// - `LOCKER_RELAY_DOMAIN`: relay address domain (default: `relay.locker.local`)
    /// - `LOCKER_RELAY_SECRET`: inbound relay shared secret (optional)
    /// - `LOCKER_ADMIN_TOKEN`: operator token (optional)
    /// - `LOCKER_MAX_CONCURRENCY`: in-flight request limit (default: `1024`)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for malformed values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for malformed values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        // Priority: LOCKER_BIND_ADDR > PORT > default 127.0.0.1:8300
        let bind_addr = if let Some(addr) = var("LOCKER_BIND_ADDR") {
            addr.parse().map_err(|_| ConfigError::Invalid {
                var: "LOCKER_BIND_ADDR",
                reason: format!("'{addr}' is not a socket address"),
            })?
        } else if let Some(port) = var("PORT") {
            let port: u16 = port.parse().map_err(|_| ConfigError::Invalid {
                var: "PORT",
                reason: format!("'{port}' is not a port"),
            })?;
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8300))
        };

        let tenants = match (var("LOCKER_DATABASES"), var("DATABASE_URL")) {
            (Some(list), _) => parse_databases(&list)?,
            (None, Some(url)) => vec![TenantConfig {
                alias: "main".to_owned(),
                storage: StorageBackendType::parse(&url)?,
            }],
            (None, None) => vec![TenantConfig {
                alias: "main".to_owned(),
                storage: StorageBackendType::Memory,
            }],
        };

        let default_tenant = match var("LOCKER_DEFAULT_TENANT") {
            Some(alias) => {
                if !tenants.iter().any(|t| t.alias == alias) {
                    return Err(ConfigError::Invalid {
                        var: "LOCKER_DEFAULT_TENANT",
                        reason: format!("'{alias}' is not a configured tenant"),
                    });
                }
                alias
            }
            None => tenants
                .first()
                .map(|t| t.alias.clone())
                .unwrap_or_else(|| "main".to_owned()),
        };

        let secret_key = var("LOCKER_SECRET_KEY");
        if secret_key.is_none() && tenants.iter().any(|t| t.storage.is_persistent()) {
            return Err(ConfigError::Missing { var: "LOCKER_SECRET_KEY" });
        }

        let job_interval_secs = match var("LOCKER_JOB_INTERVAL") {
            Some(v) => v.parse().ok().filter(|s| *s > 0).ok_or_else(|| ConfigError::Invalid {
                var: "LOCKER_JOB_INTERVAL",
                reason: format!("'{v}' is not a positive number of seconds"),
            })?,
            None => 300,
        };

        let max_concurrency = var("LOCKER_MAX_CONCURRENCY")
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1024);

        Ok(Self {
            bind_addr,
            tenants,
            default_tenant,
            secret_key,
            jwt_secret: var("LOCKER_JWT_SECRET"),
            log_level: var("LOCKER_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            event_file: var("LOCKER_EVENT_FILE"),
            job_interval_secs,
            relay_domain: var("LOCKER_RELAY_DOMAIN").unwrap_or_else(|| "relay.locker.local".to_owned()),
            relay_secret: var("LOCKER_RELAY_SECRET"),
            admin_token: var("LOCKER_ADMIN_TOKEN"),
            max_concurrency,
        })
    }
}
