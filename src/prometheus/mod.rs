//! Prometheus metrics for pgvpd.
//!
//! All counters are process-global statics registered against one registry.
//! The counters themselves are lock-free 64-bit atomics; the admin HTTP
//! surface is a read-only view over them.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

mod server;

pub use server::{start_admin_server, AdminState};

pub(crate) static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
}

fn gauge(name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(Opts::new(name, help), labels).unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
}

pub static CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "pgvpd_connections_total",
        "Total client connections accepted.",
    )
});

pub static CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    gauge(
        "pgvpd_connections_active",
        "Client connections currently active.",
    )
});

pub static POOL_CHECKOUTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "pgvpd_pool_checkouts_total",
        "Total pool checkouts (reuses plus creates).",
    )
});

pub static POOL_REUSES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "pgvpd_pool_reuses_total",
        "Pool checkouts satisfied from the idle queue.",
    )
});

pub static POOL_CREATES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "pgvpd_pool_creates_total",
        "New upstream connections created by the pool.",
    )
});

pub static POOL_CHECKINS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "pgvpd_pool_checkins_total",
        "Connections returned to the idle queue after reset.",
    )
});

pub static POOL_DISCARDS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "pgvpd_pool_discards_total",
        "Connections discarded instead of returned (reset failed or session died).",
    )
});

pub static POOL_TIMEOUTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "pgvpd_pool_timeouts_total",
        "Pool checkouts that timed out waiting for a free connection.",
    )
});

pub static POOL_CONNECTIONS_TOTAL: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec(
        "pgvpd_pool_connections_total",
        "Connections (idle plus checked out) per pool bucket.",
        &["database", "role"],
    )
});

pub static POOL_CONNECTIONS_IDLE: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec(
        "pgvpd_pool_connections_idle",
        "Idle connections per pool bucket.",
        &["database", "role"],
    )
});

pub static RESOLVER_CACHE_HITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "pgvpd_resolver_cache_hits_total",
        "Resolver executions answered from the cache.",
    )
});

pub static RESOLVER_CACHE_MISSES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "pgvpd_resolver_cache_misses_total",
        "Resolver executions that had to query the database.",
    )
});

pub static RESOLVER_CACHE_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    gauge(
        "pgvpd_resolver_cache_size",
        "Resolver cache entries currently stored.",
    )
});

pub static RESOLVER_EXECUTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "pgvpd_resolver_executions_total",
        "Resolver query executions against the database.",
        &["resolver"],
    )
});

pub static RESOLVER_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "pgvpd_resolver_errors_total",
        "Resolver query failures.",
        &["resolver"],
    )
});

pub static TENANT_REJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "pgvpd_tenant_rejected_total",
        "Tenant connections rejected, by reason (deny, limit, rate).",
        &["reason"],
    )
});

pub static TENANT_TIMEOUTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "pgvpd_tenant_timeouts_total",
        "Tenant connections torn down by the inactivity watchdog.",
    )
});
