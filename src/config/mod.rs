//! Configuration: defaults, the `key = value` config file, environment
//! variables and CLI flags, resolved in that priority order.

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::app::args::Args;
use crate::errors::Error;
use crate::messages::check_session_var;

#[cfg(test)]
mod tests;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How upstream connections are managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Each client gets a fresh upstream connection; auth is relayed.
    None,
    /// Upstream connections are reused across client sessions; the proxy
    /// authenticates both sides itself.
    Session,
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Session => write!(f, "session"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub tenant_separator: String,
    pub value_separator: String,
    pub context_variables: Vec<String>,
    pub superuser_bypass: Vec<String>,
    pub tls_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub upstream_tls: bool,
    pub upstream_tls_verify: bool,
    pub upstream_tls_ca: Option<String>,
    pub handshake_timeout_secs: u64,
    pub pool_mode: PoolMode,
    pub pool_size: u32,
    pub pool_password: Option<String>,
    pub upstream_password: Option<String>,
    pub pool_idle_timeout: u64,
    pub pool_checkout_timeout: u64,
    pub resolvers: Option<String>,
    pub admin_port: Option<u16>,
    pub set_role: Option<String>,
    pub tenant_allow: Option<Vec<String>>,
    pub tenant_deny: Option<Vec<String>>,
    pub tenant_max_connections: Option<u32>,
    pub tenant_rate_limit: Option<u32>,
    pub tenant_query_timeout: Option<u64>,
    pub worker_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".into(),
            listen_port: 6432,
            upstream_host: "127.0.0.1".into(),
            upstream_port: 5432,
            tenant_separator: ".".into(),
            value_separator: ":".into(),
            context_variables: vec!["app.current_tenant_id".into()],
            superuser_bypass: vec!["postgres".into()],
            tls_port: None,
            tls_cert: None,
            tls_key: None,
            upstream_tls: false,
            upstream_tls_verify: true,
            upstream_tls_ca: None,
            handshake_timeout_secs: 30,
            pool_mode: PoolMode::None,
            pool_size: 20,
            pool_password: None,
            upstream_password: None,
            pool_idle_timeout: 300,
            pool_checkout_timeout: 5,
            resolvers: None,
            admin_port: None,
            set_role: None,
            tenant_allow: None,
            tenant_deny: None,
            tenant_max_connections: None,
            tenant_rate_limit: None,
            tenant_query_timeout: None,
            worker_threads: 4,
        }
    }
}

/// Globally available configuration.
static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Get a read-only snapshot of the configuration from anywhere in the app.
pub fn get_config() -> Arc<Config> {
    CONFIG.load_full()
}

pub fn store_config(config: Config) {
    CONFIG.store(Arc::new(config));
}

impl Config {
    /// Resolve configuration: defaults → config file → env → CLI flags.
    /// Environment variables arrive through clap's `env` attributes, so the
    /// env/CLI layering is handled by the `Args` overlay (CLI wins).
    pub fn load(args: &Args) -> Result<Config, Error> {
        let mut config = Config::default();

        let path = Path::new(&args.config_file);
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|err| {
                Error::BadConfig(format!("could not read '{}': {err}", args.config_file))
            })?;
            apply_config_file(&mut config, &content);
        }

        apply_args(&mut config, args);
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.tls_port.is_some() && (self.tls_cert.is_none() || self.tls_key.is_none()) {
            return Err(Error::BadConfig(
                "tls_port requires both tls_cert and tls_key".into(),
            ));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(Error::BadConfig("handshake_timeout must be > 0".into()));
        }
        if self.tenant_separator.is_empty() {
            return Err(Error::BadConfig("tenant_separator must not be empty".into()));
        }
        if self.value_separator.is_empty() {
            return Err(Error::BadConfig("value_separator must not be empty".into()));
        }
        if self.context_variables.is_empty() {
            return Err(Error::BadConfig(
                "at least one context variable must be configured".into(),
            ));
        }
        for name in &self.context_variables {
            check_session_var(name)?;
        }
        if self.pool_mode == PoolMode::Session {
            if self.pool_password.is_none() {
                return Err(Error::BadConfig(
                    "pool_mode = session requires pool_password".into(),
                ));
            }
            if self.upstream_password.is_none() {
                return Err(Error::BadConfig(
                    "pool_mode = session requires upstream_password".into(),
                ));
            }
            if self.pool_size == 0 {
                return Err(Error::BadConfig("pool_size must be > 0".into()));
            }
        }
        if let Some(ref path) = self.resolvers {
            if !Path::new(path).exists() {
                return Err(Error::BadConfig(format!("resolvers file not found: {path}")));
            }
        }
        if self.tenant_allow.is_some() && self.tenant_deny.is_some() {
            return Err(Error::BadConfig(
                "tenant_allow and tenant_deny cannot both be set".into(),
            ));
        }
        Ok(())
    }

    /// True when any tenant isolation feature is configured.
    pub fn has_tenant_limits(&self) -> bool {
        self.tenant_allow.is_some()
            || self.tenant_deny.is_some()
            || self.tenant_max_connections.is_some()
            || self.tenant_rate_limit.is_some()
    }

    /// Print current configuration.
    pub fn show(&self) {
        use log::info;
        info!(
            "Listening on {}:{} → upstream {}:{}",
            self.listen_host, self.listen_port, self.upstream_host, self.upstream_port
        );
        info!(
            "Tenant separator: '{}', value separator: '{}'",
            self.tenant_separator, self.value_separator
        );
        info!("Context variables: {}", self.context_variables.join(", "));
        if !self.superuser_bypass.is_empty() {
            info!("Superuser bypass: {}", self.superuser_bypass.join(", "));
        }
        info!("Pool mode: {}", self.pool_mode);
        if self.pool_mode == PoolMode::Session {
            info!(
                "Pool size: {}, idle timeout: {}s, checkout timeout: {}s",
                self.pool_size, self.pool_idle_timeout, self.pool_checkout_timeout
            );
        }
        match self.tls_port {
            Some(port) => info!("TLS termination on port {port}"),
            None => info!("TLS termination is disabled"),
        }
        if self.upstream_tls {
            info!(
                "Upstream TLS enabled (verify: {})",
                self.upstream_tls_verify
            );
        }
        if let Some(ref path) = self.resolvers {
            info!("Resolver file: {path}");
        }
        if let Some(ref role) = self.set_role {
            info!("SET ROLE override: {role}");
        }
        if let Some(port) = self.admin_port {
            info!("Admin API on port {port}");
        }
        info!("Handshake timeout: {}s", self.handshake_timeout_secs);
        info!("Worker threads: {}", self.worker_threads);
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "true" | "1" | "yes" | "on")
}

pub fn parse_pool_mode(value: &str) -> PoolMode {
    match value.trim().to_lowercase().as_str() {
        "session" => PoolMode::Session,
        _ => PoolMode::None,
    }
}

/// Apply a `key = value` config file: `#` comments, blank lines, optional
/// single or double quotes around values. Unknown keys and unparseable
/// numbers are ignored.
pub fn apply_config_file(config: &mut Config, content: &str) {
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(eq) = trimmed.find('=') else {
            continue;
        };
        let key = trimmed[..eq].trim();
        let mut value = trimmed[eq + 1..].trim().to_string();

        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = value[1..value.len() - 1].to_string();
        }

        match key {
            "port" | "listen_port" => {
                if let Ok(v) = value.parse() {
                    config.listen_port = v;
                }
            }
            "host" | "listen_host" => config.listen_host = value,
            "upstream_host" => config.upstream_host = value,
            "upstream_port" => {
                if let Ok(v) = value.parse() {
                    config.upstream_port = v;
                }
            }
            "separator" | "tenant_separator" => config.tenant_separator = value,
            "value_separator" => config.value_separator = value,
            "context" | "context_variables" => config.context_variables = split_csv(&value),
            "superuser" | "superuser_bypass" => config.superuser_bypass = split_csv(&value),
            "tls_port" => {
                if let Ok(v) = value.parse() {
                    config.tls_port = Some(v);
                }
            }
            "tls_cert" => config.tls_cert = Some(value),
            "tls_key" => config.tls_key = Some(value),
            "upstream_tls" => config.upstream_tls = parse_bool(&value),
            "upstream_tls_verify" => {
                config.upstream_tls_verify = !matches!(value.as_str(), "false" | "0" | "no")
            }
            "upstream_tls_ca" => config.upstream_tls_ca = Some(value),
            "handshake_timeout" | "handshake_timeout_secs" => {
                if let Ok(v) = value.parse() {
                    config.handshake_timeout_secs = v;
                }
            }
            "pool_mode" => config.pool_mode = parse_pool_mode(&value),
            "pool_size" => {
                if let Ok(v) = value.parse() {
                    config.pool_size = v;
                }
            }
            "pool_password" => config.pool_password = Some(value),
            "upstream_password" => config.upstream_password = Some(value),
            "pool_idle_timeout" => {
                if let Ok(v) = value.parse() {
                    config.pool_idle_timeout = v;
                }
            }
            "pool_checkout_timeout" => {
                if let Ok(v) = value.parse() {
                    config.pool_checkout_timeout = v;
                }
            }
            "resolvers" => config.resolvers = Some(value),
            "admin_port" => {
                if let Ok(v) = value.parse() {
                    config.admin_port = Some(v);
                }
            }
            "set_role" => config.set_role = Some(value),
            "tenant_allow" => config.tenant_allow = Some(split_csv(&value)),
            "tenant_deny" => config.tenant_deny = Some(split_csv(&value)),
            "tenant_max_connections" => {
                if let Ok(v) = value.parse() {
                    config.tenant_max_connections = Some(v);
                }
            }
            "tenant_rate_limit" => {
                if let Ok(v) = value.parse() {
                    config.tenant_rate_limit = Some(v);
                }
            }
            "tenant_query_timeout" => {
                if let Ok(v) = value.parse() {
                    config.tenant_query_timeout = Some(v);
                }
            }
            "worker_threads" => {
                if let Ok(v) = value.parse() {
                    config.worker_threads = v;
                }
            }
            _ => {}
        }
    }
}

/// Apply the env/CLI overlay. `Args` fields are `Option`s filled by clap
/// from either the environment or explicit flags.
fn apply_args(config: &mut Config, args: &Args) {
    if let Some(v) = args.port {
        config.listen_port = v;
    }
    if let Some(ref v) = args.listen_host {
        config.listen_host = v.clone();
    }
    if let Some(ref v) = args.upstream_host {
        config.upstream_host = v.clone();
    }
    if let Some(v) = args.upstream_port {
        config.upstream_port = v;
    }
    if let Some(ref v) = args.separator {
        config.tenant_separator = v.clone();
    }
    if let Some(ref v) = args.context {
        config.context_variables = split_csv(v);
    }
    if let Some(ref v) = args.value_separator {
        config.value_separator = v.clone();
    }
    if let Some(ref v) = args.superuser {
        config.superuser_bypass = split_csv(v);
    }
    if let Some(v) = args.tls_port {
        config.tls_port = Some(v);
    }
    if let Some(ref v) = args.tls_cert {
        config.tls_cert = Some(v.clone());
    }
    if let Some(ref v) = args.tls_key {
        config.tls_key = Some(v.clone());
    }
    if args.upstream_tls {
        config.upstream_tls = true;
    }
    if let Some(v) = args.upstream_tls_verify {
        config.upstream_tls_verify = v;
    }
    if let Some(ref v) = args.upstream_tls_ca {
        config.upstream_tls_ca = Some(v.clone());
    }
    if let Some(v) = args.handshake_timeout {
        config.handshake_timeout_secs = v;
    }
    if let Some(ref v) = args.pool_mode {
        config.pool_mode = parse_pool_mode(v);
    }
    if let Some(v) = args.pool_size {
        config.pool_size = v;
    }
    if let Some(ref v) = args.pool_password {
        config.pool_password = Some(v.clone());
    }
    if let Some(ref v) = args.upstream_password {
        config.upstream_password = Some(v.clone());
    }
    if let Some(v) = args.pool_idle_timeout {
        config.pool_idle_timeout = v;
    }
    if let Some(v) = args.pool_checkout_timeout {
        config.pool_checkout_timeout = v;
    }
    if let Some(ref v) = args.resolvers {
        config.resolvers = Some(v.clone());
    }
    if let Some(v) = args.admin_port {
        config.admin_port = Some(v);
    }
    if let Some(ref v) = args.set_role {
        config.set_role = Some(v.clone());
    }
    if let Some(ref v) = args.tenant_allow {
        config.tenant_allow = Some(split_csv(v));
    }
    if let Some(ref v) = args.tenant_deny {
        config.tenant_deny = Some(split_csv(v));
    }
    if let Some(v) = args.tenant_max_connections {
        config.tenant_max_connections = Some(v);
    }
    if let Some(v) = args.tenant_rate_limit {
        config.tenant_rate_limit = Some(v);
    }
    if let Some(v) = args.tenant_query_timeout {
        config.tenant_query_timeout = Some(v);
    }
    if let Some(v) = args.worker_threads {
        config.worker_threads = v;
    }
}
