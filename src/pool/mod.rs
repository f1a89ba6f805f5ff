//! Session pool for upstream PostgreSQL connections.
//!
//! Buckets are keyed by (database, role). Each bucket holds an idle queue of
//! authenticated, reset connections plus a live count capped at `pool_size`.
//! Bucket locks are never held across I/O: connection creation, reset
//! queries and socket closes all happen outside the lock.

use bytes::BytesMut;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::errors::Error;
use crate::messages::{simple_query, try_read_message, write_all_flush, StartupMessage};
use crate::messages::constants::PROTOCOL_VERSION_NUMBER;
use crate::prometheus::{
    POOL_CHECKINS_TOTAL, POOL_CHECKOUTS_TOTAL, POOL_CREATES_TOTAL, POOL_DISCARDS_TOTAL,
    POOL_REUSES_TOTAL, POOL_TIMEOUTS_TOTAL,
};
use crate::server::authentication::authenticate_upstream;
use crate::server::connect::{connect_upstream, read_upstream};
use crate::server::stream::StreamInner;

/// How long a reset sequence may take before the connection is discarded.
const RESET_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a slot in a full bucket.
const CHECKOUT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Identifies a bucket of interchangeable upstream connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub database: String,
    pub role: String,
}

impl PoolKey {
    pub fn new(database: &str, role: &str) -> Self {
        Self {
            database: database.to_string(),
            role: role.to_string(),
        }
    }
}

impl Display for PoolKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.role, self.database)
    }
}

/// An idle connection parked in a bucket.
#[derive(Debug)]
struct IdleConn {
    stream: StreamInner,
    last_used: Instant,
    param_statuses: Vec<BytesMut>,
    backend_key_data: Option<BytesMut>,
}

#[derive(Default, Debug)]
struct Bucket {
    idle: VecDeque<IdleConn>,
    total: u32,
}

type BucketMap = Arc<Mutex<HashMap<PoolKey, Bucket>>>;

/// Accounts one live connection in its bucket. Dropping the slot without
/// releasing it (error paths, task cancellation mid-checkin) decrements the
/// live count, so capacity can never leak.
#[derive(Debug)]
struct LiveSlot {
    buckets: BucketMap,
    key: PoolKey,
    released: bool,
}

impl LiveSlot {
    fn release(mut self) {
        self.released = true;
    }
}

impl Drop for LiveSlot {
    fn drop(&mut self) {
        if !self.released {
            let mut buckets = self.buckets.lock();
            if let Some(bucket) = buckets.get_mut(&self.key) {
                bucket.total = bucket.total.saturating_sub(1);
            }
        }
    }
}

/// A checked-out upstream connection.
#[derive(Debug)]
pub struct PooledConn {
    pub stream: StreamInner,
    /// Leftover buffered server bytes; empty on a clean connection.
    pub server_buf: BytesMut,
    /// Raw ParameterStatus frames captured at authentication, replayed to
    /// every client that borrows this connection.
    pub param_statuses: Vec<BytesMut>,
    /// The server's BackendKeyData, kept for the life of the connection.
    /// Clients get a synthesized one instead.
    pub backend_key_data: Option<BytesMut>,
    slot: LiveSlot,
}

/// Per-bucket state visible to the admin surface.
#[derive(Debug, Clone)]
pub struct BucketSnapshot {
    pub database: String,
    pub role: String,
    pub total: u32,
    pub idle: u32,
}

/// The session pool.
pub struct Pool {
    buckets: BucketMap,
    config: Arc<Config>,
    tls_connector: Option<tokio_native_tls::TlsConnector>,
}

impl Pool {
    pub fn new(config: Arc<Config>, tls_connector: Option<tokio_native_tls::TlsConnector>) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            config,
            tls_connector,
        }
    }

    /// Check out a connection: reuse an idle one, create a new one when the
    /// bucket has headroom, otherwise wait up to `pool_checkout_timeout`.
    ///
    /// The returned flag is true when the connection was reused.
    pub async fn checkout(&self, key: &PoolKey, conn_id: u64) -> Result<(PooledConn, bool), Error> {
        let deadline = Instant::now() + Duration::from_secs(self.config.pool_checkout_timeout);

        loop {
            enum Claim {
                Reuse(IdleConn),
                Create,
                Full,
            }

            let claim = {
                let mut buckets = self.buckets.lock();
                let bucket = buckets.entry(key.clone()).or_default();
                if let Some(conn) = bucket.idle.pop_front() {
                    Claim::Reuse(conn)
                } else if bucket.total < self.config.pool_size {
                    bucket.total += 1;
                    Claim::Create
                } else {
                    Claim::Full
                }
            };

            match claim {
                Claim::Reuse(idle) => {
                    POOL_CHECKOUTS_TOTAL.inc();
                    POOL_REUSES_TOTAL.inc();
                    debug!("[conn: {conn_id}] pool {key}: reusing idle connection");
                    return Ok((
                        PooledConn {
                            stream: idle.stream,
                            server_buf: BytesMut::with_capacity(4096),
                            param_statuses: idle.param_statuses,
                            backend_key_data: idle.backend_key_data,
                            slot: LiveSlot {
                                buckets: Arc::clone(&self.buckets),
                                key: key.clone(),
                                released: false,
                            },
                        },
                        true,
                    ));
                }
                Claim::Create => {
                    // The slot guard is armed before the connect so a failed
                    // or cancelled creation releases the claimed capacity.
                    let slot = LiveSlot {
                        buckets: Arc::clone(&self.buckets),
                        key: key.clone(),
                        released: false,
                    };
                    debug!("[conn: {conn_id}] pool {key}: creating new connection");
                    let conn = self.create_connection(key, slot).await?;
                    POOL_CHECKOUTS_TOTAL.inc();
                    POOL_CREATES_TOTAL.inc();
                    return Ok((conn, false));
                }
                Claim::Full => {
                    if Instant::now() >= deadline {
                        POOL_TIMEOUTS_TOTAL.inc();
                        warn!("[conn: {conn_id}] pool {key}: checkout timed out");
                        return Err(Error::PoolCheckoutTimeout);
                    }
                    tokio::time::sleep(CHECKOUT_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Return a connection after use. The session is reset with `ROLLBACK;`
    /// then `DISCARD ALL;` as two separate queries (DISCARD ALL is illegal
    /// inside a transaction block); a connection that fails or times out
    /// during reset is discarded.
    pub async fn checkin(&self, key: &PoolKey, mut conn: PooledConn, conn_id: u64) {
        let reset = tokio::time::timeout(RESET_TIMEOUT, async {
            run_reset_query(&mut conn, "ROLLBACK;").await?;
            run_reset_query(&mut conn, "DISCARD ALL;").await
        })
        .await;

        match reset {
            Ok(Ok(())) => {
                POOL_CHECKINS_TOTAL.inc();
                let mut buckets = self.buckets.lock();
                let bucket = buckets.entry(key.clone()).or_default();
                bucket.idle.push_back(IdleConn {
                    stream: conn.stream,
                    last_used: Instant::now(),
                    param_statuses: conn.param_statuses,
                    backend_key_data: conn.backend_key_data,
                });
                conn.slot.release();
                debug!("[conn: {conn_id}] pool {key}: connection returned");
            }
            Ok(Err(err)) => {
                POOL_DISCARDS_TOTAL.inc();
                warn!("[conn: {conn_id}] pool {key}: reset failed, discarding: {err}");
                // conn drops here; the slot guard decrements the live count.
            }
            Err(_) => {
                POOL_DISCARDS_TOTAL.inc();
                warn!("[conn: {conn_id}] pool {key}: reset timed out, discarding");
            }
        }
    }

    /// Discard a connection that must not be reused.
    pub fn discard(&self, key: &PoolKey, conn: PooledConn, conn_id: u64) {
        POOL_DISCARDS_TOTAL.inc();
        debug!("[conn: {conn_id}] pool {key}: discarding connection");
        drop(conn);
    }

    async fn create_connection(&self, key: &PoolKey, slot: LiveSlot) -> Result<PooledConn, Error> {
        let mut stream = connect_upstream(&self.config, self.tls_connector.as_ref()).await?;

        let startup = StartupMessage {
            version: PROTOCOL_VERSION_NUMBER,
            params: vec![
                ("user".to_string(), key.role.clone()),
                ("database".to_string(), key.database.clone()),
                ("application_name".to_string(), "pgvpd".to_string()),
            ],
        };
        let frame = crate::messages::build_startup_message(&startup);
        write_all_flush(&mut stream, &frame).await?;

        let mut server_buf = BytesMut::with_capacity(4096);
        let password = self.config.upstream_password.as_deref().unwrap_or("");
        authenticate_upstream(&mut stream, &mut server_buf, &key.role, password).await?;

        // Collect ParameterStatus and BackendKeyData through ReadyForQuery.
        let mut param_statuses = Vec::new();
        let mut backend_key_data = None;
        'startup: loop {
            if server_buf.is_empty() {
                read_upstream(&mut stream, &mut server_buf).await?;
            }
            while let Some(message) = try_read_message(&mut server_buf)? {
                if message.is_parameter_status() {
                    param_statuses.push(message.raw);
                } else if message.is_backend_key_data() {
                    backend_key_data = Some(message.raw);
                } else if message.is_ready_for_query() {
                    break 'startup;
                } else if message.is_error_response() {
                    return Err(Error::ServerAuthError(format!(
                        "upstream error during connect: {}",
                        message.error_message()
                    )));
                }
            }
        }

        Ok(PooledConn {
            stream,
            server_buf,
            param_statuses,
            backend_key_data,
            slot,
        })
    }

    /// Per-bucket state for /metrics and /status.
    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        let buckets = self.buckets.lock();
        let mut snapshot: Vec<BucketSnapshot> = buckets
            .iter()
            .map(|(key, bucket)| BucketSnapshot {
                database: key.database.clone(),
                role: key.role.clone(),
                total: bucket.total,
                idle: bucket.idle.len() as u32,
            })
            .collect();
        snapshot.sort_by(|a, b| (&a.database, &a.role).cmp(&(&b.database, &b.role)));
        snapshot
    }

    /// Background task: close connections idle past `pool_idle_timeout`.
    /// The bucket lock is held only while collecting; sockets close outside.
    pub async fn run_idle_reaper(self: Arc<Self>) {
        let idle_timeout = Duration::from_secs(self.config.pool_idle_timeout);
        let interval = Duration::from_secs((self.config.pool_idle_timeout / 2).max(5));

        loop {
            tokio::time::sleep(interval).await;

            let mut reaped: Vec<IdleConn> = Vec::new();
            {
                let mut buckets = self.buckets.lock();
                for (key, bucket) in buckets.iter_mut() {
                    let before = reaped.len();
                    let mut kept = VecDeque::with_capacity(bucket.idle.len());
                    while let Some(conn) = bucket.idle.pop_front() {
                        if conn.last_used.elapsed() >= idle_timeout {
                            bucket.total = bucket.total.saturating_sub(1);
                            reaped.push(conn);
                        } else {
                            kept.push_back(conn);
                        }
                    }
                    bucket.idle = kept;
                    if reaped.len() > before {
                        debug!(
                            "pool {key}: reaped {} idle connection(s), {} remaining",
                            reaped.len() - before,
                            bucket.idle.len()
                        );
                    }
                }
                buckets.retain(|_, bucket| bucket.total > 0 || !bucket.idle.is_empty());
            }

            if !reaped.is_empty() {
                info!("Pool idle reaper closed {} connection(s)", reaped.len());
                drop(reaped);
            }
        }
    }

    /// Close every idle connection; used during graceful shutdown.
    pub fn drain_idle(&self) {
        let mut drained: Vec<IdleConn> = Vec::new();
        {
            let mut buckets = self.buckets.lock();
            for bucket in buckets.values_mut() {
                while let Some(conn) = bucket.idle.pop_front() {
                    bucket.total = bucket.total.saturating_sub(1);
                    drained.push(conn);
                }
            }
            buckets.retain(|_, bucket| bucket.total > 0);
        }
        if !drained.is_empty() {
            info!("Drained {} idle pool connection(s)", drained.len());
        }
    }
}

/// Run one reset query and consume its response through ReadyForQuery.
async fn run_reset_query(conn: &mut PooledConn, sql: &str) -> Result<(), Error> {
    let query = simple_query(sql);
    write_all_flush(&mut conn.stream, &query).await?;

    loop {
        if conn.server_buf.is_empty() {
            read_upstream(&mut conn.stream, &mut conn.server_buf).await?;
        }
        while let Some(message) = try_read_message(&mut conn.server_buf)? {
            if message.is_error_response() {
                return Err(Error::SocketError(format!(
                    "reset query '{sql}' failed: {}",
                    message.error_message()
                )));
            }
            if message.is_ready_for_query() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(pool_size: u32) -> Pool {
        let mut config = Config::default();
        config.pool_size = pool_size;
        Pool::new(Arc::new(config), None)
    }

    #[test]
    fn pool_key_display() {
        assert_eq!(PoolKey::new("db", "app_user").to_string(), "app_user@db");
    }

    #[test]
    fn snapshot_is_sorted_and_accurate() {
        let pool = test_pool(4);
        {
            let mut buckets = pool.buckets.lock();
            buckets.insert(PoolKey::new("db_b", "u"), Bucket { idle: VecDeque::new(), total: 2 });
            buckets.insert(PoolKey::new("db_a", "u"), Bucket { idle: VecDeque::new(), total: 1 });
        }
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].database, "db_a");
        assert_eq!(snapshot[0].total, 1);
        assert_eq!(snapshot[1].database, "db_b");
        assert_eq!(snapshot[1].idle, 0);
    }

    #[test]
    fn dropped_slot_releases_capacity() {
        let pool = test_pool(1);
        let key = PoolKey::new("db", "role");
        {
            let mut buckets = pool.buckets.lock();
            buckets.entry(key.clone()).or_default().total = 1;
        }
        let slot = LiveSlot {
            buckets: Arc::clone(&pool.buckets),
            key: key.clone(),
            released: false,
        };
        drop(slot);
        assert_eq!(pool.buckets.lock().get(&key).unwrap().total, 0);
    }

    #[test]
    fn released_slot_keeps_capacity() {
        let pool = test_pool(1);
        let key = PoolKey::new("db", "role");
        {
            let mut buckets = pool.buckets.lock();
            buckets.entry(key.clone()).or_default().total = 1;
        }
        let slot = LiveSlot {
            buckets: Arc::clone(&pool.buckets),
            key: key.clone(),
            released: false,
        };
        slot.release();
        assert_eq!(pool.buckets.lock().get(&key).unwrap().total, 1);
    }

    #[tokio::test]
    async fn checkout_times_out_when_bucket_is_full() {
        let mut config = Config::default();
        config.pool_size = 1;
        config.pool_checkout_timeout = 0; // deadline is immediately in the past
        let pool = Pool::new(Arc::new(config), None);
        let key = PoolKey::new("db", "role");
        {
            let mut buckets = pool.buckets.lock();
            buckets.entry(key.clone()).or_default().total = 1;
        }
        match pool.checkout(&key, 1).await {
            Err(Error::PoolCheckoutTimeout) => {}
            other => panic!("expected PoolCheckoutTimeout, got {other:?}"),
        }
    }
}
