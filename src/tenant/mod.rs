//! Per-tenant isolation: allow/deny lists, concurrent connection limits and
//! new-connection rate limiting.
//!
//! The registry is shared by every connection task. Per-tenant state is
//! created lazily and checked under a per-tenant lock that is never held
//! across I/O. `TenantGuard` accounts one active connection and releases it
//! on drop, which covers every exit path including task cancellation.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::errors::{Error, TenantRejectKind};
use crate::prometheus::TENANT_REJECTED_TOTAL;

#[derive(Debug)]
struct TenantState {
    active_connections: AtomicU32,
    admitted_total: AtomicU64,
    /// Fixed 1-second rate window: (window start, admissions within it).
    rate_window: Mutex<(Instant, u32)>,
}

/// Registry of per-tenant runtime state.
pub struct TenantRegistry {
    tenants: Mutex<HashMap<String, Arc<TenantState>>>,
    allow: Option<HashSet<String>>,
    deny: Option<HashSet<String>>,
    max_connections: Option<u32>,
    rate_limit: Option<u32>,
}

/// Accounts one concurrent connection for a tenant; decrements on drop.
#[derive(Debug)]
pub struct TenantGuard {
    state: Arc<TenantState>,
}

impl Drop for TenantGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

impl TenantRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            tenants: Mutex::new(HashMap::new()),
            allow: config
                .tenant_allow
                .as_ref()
                .map(|v| v.iter().cloned().collect()),
            deny: config
                .tenant_deny
                .as_ref()
                .map(|v| v.iter().cloned().collect()),
            max_connections: config.tenant_max_connections,
            rate_limit: config.tenant_rate_limit,
        }
    }

    /// Admit a tenant connection, or explain why not.
    ///
    /// Checks run in order: deny/allow lists, rate window, concurrent limit.
    /// Success returns a guard; dropping it releases the slot.
    pub fn admit(&self, tenant: &str) -> Result<TenantGuard, Error> {
        self.admit_at(tenant, Instant::now())
    }

    fn admit_at(&self, tenant: &str, now: Instant) -> Result<TenantGuard, Error> {
        if let Some(ref deny) = self.deny {
            if deny.contains(tenant) {
                return Err(self.reject(tenant, TenantRejectKind::Deny, "tenant is denied"));
            }
        }
        if let Some(ref allow) = self.allow {
            if !allow.contains(tenant) {
                return Err(self.reject(
                    tenant,
                    TenantRejectKind::Deny,
                    "tenant is not in the allow list",
                ));
            }
        }

        let state = self.get_or_create(tenant);

        if let Some(limit) = self.rate_limit {
            let mut window = state.rate_window.lock();
            if now.duration_since(window.0).as_secs() >= 1 {
                *window = (now, 1);
            } else if window.1 >= limit {
                return Err(self.reject(
                    tenant,
                    TenantRejectKind::Rate,
                    &format!("rate limit exceeded ({limit}/s)"),
                ));
            } else {
                window.1 += 1;
            }
        }

        if let Some(max) = self.max_connections {
            let current = state.active_connections.load(Ordering::Relaxed);
            if current >= max {
                return Err(self.reject(
                    tenant,
                    TenantRejectKind::Limit,
                    &format!("connection limit exceeded ({current}/{max})"),
                ));
            }
        }

        state.active_connections.fetch_add(1, Ordering::Relaxed);
        state.admitted_total.fetch_add(1, Ordering::Relaxed);
        Ok(TenantGuard { state })
    }

    fn reject(&self, tenant: &str, kind: TenantRejectKind, message: &str) -> Error {
        TENANT_REJECTED_TOTAL
            .with_label_values(&[kind.as_label()])
            .inc();
        Error::TenantRejected {
            tenant: tenant.to_string(),
            kind,
            message: format!("tenant '{tenant}': {message}"),
        }
    }

    fn get_or_create(&self, tenant: &str) -> Arc<TenantState> {
        let mut tenants = self.tenants.lock();
        if let Some(state) = tenants.get(tenant) {
            Arc::clone(state)
        } else {
            let state = Arc::new(TenantState {
                active_connections: AtomicU32::new(0),
                admitted_total: AtomicU64::new(0),
                rate_window: Mutex::new((Instant::now(), 0)),
            });
            tenants.insert(tenant.to_string(), Arc::clone(&state));
            state
        }
    }

    /// Current active connection count for a tenant (0 if never seen).
    pub fn active(&self, tenant: &str) -> u32 {
        self.tenants
            .lock()
            .get(tenant)
            .map(|s| s.active_connections.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Total admissions for a tenant since startup.
    pub fn admitted_total(&self, tenant: &str) -> u64 {
        self.tenants
            .lock()
            .get(tenant)
            .map(|s| s.admitted_total.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry(
        allow: Option<Vec<&str>>,
        deny: Option<Vec<&str>>,
        max_conn: Option<u32>,
        rate: Option<u32>,
    ) -> TenantRegistry {
        let mut config = Config::default();
        config.tenant_allow = allow.map(|v| v.into_iter().map(String::from).collect());
        config.tenant_deny = deny.map(|v| v.into_iter().map(String::from).collect());
        config.tenant_max_connections = max_conn;
        config.tenant_rate_limit = rate;
        TenantRegistry::new(&config)
    }

    fn reject_kind(err: Error) -> TenantRejectKind {
        match err {
            Error::TenantRejected { kind, .. } => kind,
            other => panic!("expected TenantRejected, got {other:?}"),
        }
    }

    #[test]
    fn deny_list_blocks() {
        let reg = registry(None, Some(vec!["bad"]), None, None);
        assert_eq!(reject_kind(reg.admit("bad").unwrap_err()), TenantRejectKind::Deny);
        assert!(reg.admit("good").is_ok());
    }

    #[test]
    fn allow_list_blocks_unlisted() {
        let reg = registry(Some(vec!["alpha", "beta"]), None, None, None);
        assert!(reg.admit("alpha").is_ok());
        assert!(reg.admit("beta").is_ok());
        assert_eq!(
            reject_kind(reg.admit("gamma").unwrap_err()),
            TenantRejectKind::Deny
        );
    }

    #[test]
    fn no_lists_allow_everyone() {
        let reg = registry(None, None, None, None);
        assert!(reg.admit("anything").is_ok());
    }

    #[test]
    fn connection_limit_enforced_and_released_on_drop() {
        let reg = registry(None, None, Some(2), None);

        let g1 = reg.admit("t1").unwrap();
        let _g2 = reg.admit("t1").unwrap();
        assert_eq!(reg.active("t1"), 2);

        // Third concurrent connection is over the limit.
        assert_eq!(
            reject_kind(reg.admit("t1").unwrap_err()),
            TenantRejectKind::Limit
        );

        // Another tenant is unaffected.
        assert!(reg.admit("t2").is_ok());

        // Releasing a slot admits again.
        drop(g1);
        assert_eq!(reg.active("t1"), 1);
        assert!(reg.admit("t1").is_ok());
    }

    #[test]
    fn rate_limit_within_one_second() {
        let reg = registry(None, None, None, Some(3));
        let now = Instant::now();

        let _g1 = reg.admit_at("t1", now).unwrap();
        let _g2 = reg.admit_at("t1", now).unwrap();
        let _g3 = reg.admit_at("t1", now).unwrap();
        assert_eq!(
            reject_kind(reg.admit_at("t1", now).unwrap_err()),
            TenantRejectKind::Rate
        );

        // The next window admits again.
        let later = now + Duration::from_secs(1);
        assert!(reg.admit_at("t1", later).is_ok());
    }

    #[test]
    fn admitted_totals_accumulate() {
        let reg = registry(None, None, None, None);
        let _g1 = reg.admit("t1").unwrap();
        {
            let _g2 = reg.admit("t1").unwrap();
        }
        assert_eq!(reg.admitted_total("t1"), 2);
        assert_eq!(reg.admitted_total("unseen"), 0);
    }
}
