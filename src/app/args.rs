use clap::{Parser, ValueEnum};
use tracing::Level;

/// Pgvpd: virtual private database proxy for PostgreSQL.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file path.
    #[arg(default_value_t = String::from("pgvpd.conf"), env = "PGVPD_CONFIG")]
    pub config_file: String,

    #[arg(long, default_value_t = Level::INFO, env = "PGVPD_LOG_LEVEL")]
    pub log_level: Level,

    #[clap(short = 'F', long, value_enum, default_value_t = LogFormat::Text, env = "PGVPD_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[arg(
        long,
        default_value_t = false,
        env = "PGVPD_NO_COLOR",
        help = "disable colors in the log output"
    )]
    pub no_color: bool,

    #[arg(
        short = 't',
        long = "test-config",
        default_value_t = false,
        help = "test configuration file and exit"
    )]
    pub test_config: bool,

    /// Listen port.
    #[arg(short = 'p', long, env = "PGVPD_PORT")]
    pub port: Option<u16>,

    /// Bind address.
    #[arg(long, env = "PGVPD_HOST")]
    pub listen_host: Option<String>,

    /// Upstream PostgreSQL host.
    #[arg(long, env = "PGVPD_UPSTREAM_HOST")]
    pub upstream_host: Option<String>,

    /// Upstream PostgreSQL port.
    #[arg(long, env = "PGVPD_UPSTREAM_PORT")]
    pub upstream_port: Option<u16>,

    /// Tenant separator in the username.
    #[arg(long, env = "PGVPD_TENANT_SEPARATOR")]
    pub separator: Option<String>,

    /// Comma-separated context variable names.
    #[arg(long, env = "PGVPD_CONTEXT_VARIABLES")]
    pub context: Option<String>,

    /// Separator between multiple values in the tenant payload.
    #[arg(long, env = "PGVPD_VALUE_SEPARATOR")]
    pub value_separator: Option<String>,

    /// Comma-separated superuser bypass usernames.
    #[arg(long, env = "PGVPD_SUPERUSER_BYPASS")]
    pub superuser: Option<String>,

    /// TLS listen port (enables TLS termination).
    #[arg(long, env = "PGVPD_TLS_PORT")]
    pub tls_port: Option<u16>,

    /// Path to the TLS certificate (PEM).
    #[arg(long, env = "PGVPD_TLS_CERT")]
    pub tls_cert: Option<String>,

    /// Path to the TLS private key (PEM).
    #[arg(long, env = "PGVPD_TLS_KEY")]
    pub tls_key: Option<String>,

    /// Enable TLS to the upstream server.
    #[arg(long, env = "PGVPD_UPSTREAM_TLS")]
    pub upstream_tls: bool,

    /// Verify the upstream TLS certificate.
    #[arg(long, env = "PGVPD_UPSTREAM_TLS_VERIFY")]
    pub upstream_tls_verify: Option<bool>,

    /// Path to a custom CA certificate for upstream TLS.
    #[arg(long, env = "PGVPD_UPSTREAM_TLS_CA")]
    pub upstream_tls_ca: Option<String>,

    /// Handshake timeout in seconds.
    #[arg(long, env = "PGVPD_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: Option<u64>,

    /// Pool mode: none or session.
    #[arg(long, env = "PGVPD_POOL_MODE")]
    pub pool_mode: Option<String>,

    /// Max upstream connections per (database, role) bucket.
    #[arg(long, env = "PGVPD_POOL_SIZE")]
    pub pool_size: Option<u32>,

    /// Password clients must present in pool mode.
    #[arg(long, env = "PGVPD_POOL_PASSWORD")]
    pub pool_password: Option<String>,

    /// Password pgvpd presents to the upstream in pool mode.
    #[arg(long, env = "PGVPD_UPSTREAM_PASSWORD")]
    pub upstream_password: Option<String>,

    /// Seconds idle before a pooled connection is closed.
    #[arg(long, env = "PGVPD_POOL_IDLE_TIMEOUT")]
    pub pool_idle_timeout: Option<u64>,

    /// Seconds to wait for a connection when the pool is full.
    #[arg(long, env = "PGVPD_POOL_CHECKOUT_TIMEOUT")]
    pub pool_checkout_timeout: Option<u64>,

    /// Path to the context resolver TOML file.
    #[arg(long, env = "PGVPD_RESOLVERS")]
    pub resolvers: Option<String>,

    /// HTTP port for the admin API (health, metrics, status).
    #[arg(long, env = "PGVPD_ADMIN_PORT")]
    pub admin_port: Option<u16>,

    /// Override the SET ROLE target (default: the rewritten username).
    #[arg(long, env = "PGVPD_SET_ROLE")]
    pub set_role: Option<String>,

    /// Comma-separated tenant allow list.
    #[arg(long, env = "PGVPD_TENANT_ALLOW")]
    pub tenant_allow: Option<String>,

    /// Comma-separated tenant deny list.
    #[arg(long, env = "PGVPD_TENANT_DENY")]
    pub tenant_deny: Option<String>,

    /// Max concurrent connections per tenant.
    #[arg(long, env = "PGVPD_TENANT_MAX_CONNECTIONS")]
    pub tenant_max_connections: Option<u32>,

    /// Max new connections per tenant per second.
    #[arg(long, env = "PGVPD_TENANT_RATE_LIMIT")]
    pub tenant_rate_limit: Option<u32>,

    /// Seconds of pipe inactivity before a tenant connection is torn down.
    #[arg(long, env = "PGVPD_TENANT_QUERY_TIMEOUT")]
    pub tenant_query_timeout: Option<u64>,

    /// Tokio worker threads.
    #[arg(long, env = "PGVPD_WORKER_THREADS")]
    pub worker_threads: Option<usize>,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Structured,
    Debug,
}

pub fn parse() -> Args {
    Args::parse()
}
