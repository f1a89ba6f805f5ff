//! The per-connection state machine.
//!
//! One handler task owns a client connection end to end: startup parsing,
//! classification, tenant admission, upstream establishment, authentication,
//! resolver execution, context injection, and finally the transparent pipe.
//! The client never sees ReadyForQuery until injection has succeeded; that
//! single rule is what makes the security context connection-intrinsic.

use bytes::{BufMut, BytesMut};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

use crate::auth::authenticate_client;
use crate::client::context::{
    build_injection_sql, classify_user, initial_context, ClientIdentity, SessionContext, UserClass,
};
use crate::client::pipe::{pipe_pooled, pipe_transparent, PipeOutcome};
use crate::client::startup::{read_client_startup, ClientFirst};
use crate::config::{Config, PoolMode};
use crate::errors::Error;
use crate::messages::{
    backend_key_data, build_startup_message, error_response_terminal, ready_for_query,
    simple_query, try_read_message, write_all_flush, BackendMessage, StartupMessage,
};
use crate::pool::{Pool, PoolKey, PooledConn};
use crate::prometheus::TENANT_TIMEOUTS_TOTAL;
use crate::resolver::ResolverEngine;
use crate::server::connect::{connect_upstream, read_upstream};
use crate::server::stream::StreamInner;
use crate::tenant::{TenantGuard, TenantRegistry};

/// Everything a connection handler needs that outlives single connections.
pub struct ProxyContext {
    pub config: Arc<Config>,
    pub pool: Option<Arc<Pool>>,
    pub resolver: Option<Arc<ResolverEngine>>,
    pub tenants: Arc<TenantRegistry>,
    pub upstream_tls: Option<tokio_native_tls::TlsConnector>,
}

/// Per-connection id for log correlation.
static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-assigned BackendKeyData pids handed to pooled clients.
static NEXT_CLIENT_PID: AtomicI32 = AtomicI32::new(1);

pub fn next_conn_id() -> u64 {
    CONN_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// Handshake states. Transitions are returned, never jumped; side-channel
/// state (framers, buffered frames, the tenant guard) lives on the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    WaitStartup,
    ClassifyUser,
    BypassConnect,
    TenantConnect,
    UpstreamAuth,
    PostAuth,
    Resolving,
    Injecting,
    Transparent,
}

/// How the handshake left the connection.
enum Established {
    /// Fully handled (cancel request); nothing to pipe.
    Closed,
    /// Bypass session ready to splice.
    Bypass,
    /// Tenant session established, context injected.
    Tenant,
}

struct Handler {
    ctx: Arc<ProxyContext>,
    conn_id: u64,
    client: StreamInner,
    client_buf: BytesMut,
    startup: Option<StartupMessage>,
    raw_user: String,
    database: Option<String>,
    identity: Option<ClientIdentity>,
    context: SessionContext,
    /// Passthrough-mode upstream; pool mode keeps it inside `pooled`.
    server: Option<StreamInner>,
    server_buf: BytesMut,
    pooled: Option<PooledConn>,
    pool_key: Option<PoolKey>,
    tenant_guard: Option<TenantGuard>,
    /// The ReadyForQuery owed to the client once injection confirms.
    buffered_ready: Option<BytesMut>,
    /// Single-error gate: set once any ErrorResponse reached the client.
    error_sent: bool,
}

/// Handle a single client connection through its full lifecycle.
pub async fn handle_client(ctx: Arc<ProxyContext>, client: StreamInner, conn_id: u64) {
    let peer = client
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    debug!("[conn: {conn_id}] new connection from {peer}");

    let mut handler = Handler {
        ctx,
        conn_id,
        client,
        client_buf: BytesMut::with_capacity(4096),
        startup: None,
        raw_user: String::new(),
        database: None,
        identity: None,
        context: SessionContext::new(),
        server: None,
        server_buf: BytesMut::with_capacity(8192),
        pooled: None,
        pool_key: None,
        tenant_guard: None,
        buffered_ready: None,
        error_sent: false,
    };

    if let Err(err) = handler.run().await {
        if !handler.error_sent {
            if let Some((code, message)) = err.client_response() {
                warn!("[conn: {conn_id}] rejecting connection: {message}");
                let _ = error_response_terminal(&mut handler.client, &message, code).await;
                handler.error_sent = true;
            } else {
                debug!("[conn: {conn_id}] connection ended: {err}");
            }
        } else {
            debug!("[conn: {conn_id}] connection ended: {err}");
        }

        // An upstream that died mid-handshake must not be reused.
        if let (Some(conn), Some(key), Some(pool)) = (
            handler.pooled.take(),
            handler.pool_key.as_ref(),
            handler.ctx.pool.as_ref(),
        ) {
            pool.discard(key, conn, conn_id);
        }
    }
    // The TenantGuard drops here on every path, releasing the slot.
}

impl Handler {
    async fn run(&mut self) -> Result<(), Error> {
        let timeout = Duration::from_secs(self.ctx.config.handshake_timeout_secs);
        let established = match tokio::time::timeout(timeout, self.run_handshake()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("[conn: {}] handshake timeout", self.conn_id);
                return Err(Error::HandshakeTimeout);
            }
        };

        // The pipe runs without the handshake timeout so long queries work.
        match established {
            Established::Closed => Ok(()),
            Established::Bypass => self.run_bypass_pipe().await,
            Established::Tenant => self.run_tenant_pipe().await,
        }
    }

    /// Drive the handshake phases to the point where the client holds its
    /// ReadyForQuery and both streams are ready to splice.
    async fn run_handshake(&mut self) -> Result<Established, Error> {
        let mut phase = Phase::WaitStartup;
        loop {
            debug!("[conn: {}] phase {phase:?}", self.conn_id);
            phase = match phase {
                Phase::WaitStartup => {
                    match read_client_startup(&mut self.client, &mut self.client_buf, self.conn_id)
                        .await?
                    {
                        ClientFirst::CancelRequest => {
                            debug!("[conn: {}] cancel request, closing", self.conn_id);
                            return Ok(Established::Closed);
                        }
                        ClientFirst::Startup(startup) => {
                            self.raw_user = startup.get("user").unwrap_or_default().to_string();
                            self.database = startup.get("database").map(str::to_string);
                            self.startup = Some(startup);
                            Phase::ClassifyUser
                        }
                    }
                }

                Phase::ClassifyUser => {
                    let config = Arc::clone(&self.ctx.config);
                    match classify_user(&config, &self.raw_user)? {
                        UserClass::Bypass => {
                            info!(
                                "[conn: {}] superuser bypass for {}",
                                self.conn_id, self.raw_user
                            );
                            Phase::BypassConnect
                        }
                        UserClass::Tenant(identity) => {
                            self.context = initial_context(&config, &identity)?;
                            info!(
                                "[conn: {}] tenant connection: role={} tenant={} database={}",
                                self.conn_id,
                                identity.login_role,
                                identity.tenant_id(),
                                self.database.as_deref().unwrap_or("-"),
                            );
                            self.identity = Some(identity);
                            Phase::TenantConnect
                        }
                    }
                }

                Phase::BypassConnect => {
                    let mut server = connect_upstream(
                        &self.ctx.config,
                        self.ctx.upstream_tls.as_ref(),
                    )
                    .await?;
                    let startup = self.startup.as_ref().ok_or_else(|| {
                        Error::ProtocolSyncError("bypass without a startup message".to_string())
                    })?;
                    let frame = build_startup_message(startup);
                    write_all_flush(&mut server, &frame).await?;
                    if !self.client_buf.is_empty() {
                        write_all_flush(&mut server, &self.client_buf).await?;
                        self.client_buf.clear();
                    }
                    self.server = Some(server);
                    return Ok(Established::Bypass);
                }

                Phase::TenantConnect => {
                    let identity = self.identity.clone().ok_or_else(|| {
                        Error::ProtocolSyncError("tenant connect without identity".to_string())
                    })?;
                    let guard = self.ctx.tenants.admit(identity.tenant_id())?;
                    self.tenant_guard = Some(guard);
                    Phase::UpstreamAuth
                }

                Phase::UpstreamAuth => {
                    if self.ctx.config.pool_mode == PoolMode::Session {
                        self.pool_mode_auth().await?;
                    } else {
                        self.passthrough_auth().await?;
                    }
                    Phase::PostAuth
                }

                Phase::PostAuth => {
                    if self.pooled.is_some() {
                        self.pooled_post_auth().await?;
                    } else {
                        self.passthrough_post_auth().await?;
                    }
                    Phase::Resolving
                }

                Phase::Resolving => {
                    self.run_resolvers().await?;
                    Phase::Injecting
                }

                Phase::Injecting => {
                    self.inject_context().await?;
                    Phase::Transparent
                }

                Phase::Transparent => {
                    let ready = self.buffered_ready.take().ok_or_else(|| {
                        Error::ProtocolSyncError(
                            "no buffered ReadyForQuery at pipe entry".to_string(),
                        )
                    })?;
                    write_all_flush(&mut self.client, &ready).await?;

                    // Flush any server frames pipelined behind the
                    // injection confirmation.
                    let leftover = match self.pooled.as_mut() {
                        Some(conn) => &mut conn.server_buf,
                        None => &mut self.server_buf,
                    };
                    if !leftover.is_empty() {
                        let bytes = leftover.split();
                        write_all_flush(&mut self.client, &bytes).await?;
                    }
                    return Ok(Established::Tenant);
                }
            };
        }
    }

    /// Passthrough: open the upstream, rewrite the username, relay the
    /// authentication exchange byte-for-byte.
    async fn passthrough_auth(&mut self) -> Result<(), Error> {
        let identity = self.identity.clone().ok_or_else(|| {
            Error::ProtocolSyncError("upstream auth without identity".to_string())
        })?;

        let mut server =
            connect_upstream(&self.ctx.config, self.ctx.upstream_tls.as_ref()).await?;
        debug!(
            "[conn: {}] connected to upstream {}:{}",
            self.conn_id, self.ctx.config.upstream_host, self.ctx.config.upstream_port
        );

        let mut startup = self.startup.clone().ok_or_else(|| {
            Error::ProtocolSyncError("upstream auth without a startup message".to_string())
        })?;
        startup.set_user(&identity.login_role);
        let frame = build_startup_message(&startup);
        write_all_flush(&mut server, &frame).await?;

        // The client may have pipelined bytes behind its startup frame.
        if !self.client_buf.is_empty() {
            let bytes = self.client_buf.split();
            write_all_flush(&mut server, &bytes).await?;
        }

        self.relay_auth(&mut server).await?;
        self.server = Some(server);
        Ok(())
    }

    /// Relay server auth frames to the client and client responses back,
    /// until AuthenticationOk or a server error.
    async fn relay_auth(&mut self, server: &mut StreamInner) -> Result<(), Error> {
        loop {
            if self.server_buf.is_empty() {
                read_upstream(server, &mut self.server_buf).await?;
            }
            while let Some(message) = try_read_message(&mut self.server_buf)? {
                if message.is_auth_ok() {
                    debug!("[conn: {}] authentication ok", self.conn_id);
                    write_all_flush(&mut self.client, &message.raw).await?;
                    return Ok(());
                }
                if message.is_error_response() {
                    let text = message.error_message();
                    warn!("[conn: {}] auth error from server: {text}", self.conn_id);
                    write_all_flush(&mut self.client, &message.raw).await?;
                    self.error_sent = true;
                    return Err(Error::ServerAuthError(text));
                }

                let challenge = message.is_auth_challenge();
                write_all_flush(&mut self.client, &message.raw).await?;

                if challenge {
                    let response = self.read_client_frame().await?;
                    write_all_flush(server, &response.raw).await?;
                }
            }
        }
    }

    async fn read_client_frame(&mut self) -> Result<BackendMessage, Error> {
        loop {
            if let Some(message) = try_read_message(&mut self.client_buf)? {
                return Ok(message);
            }
            let n = self.client.read_buf(&mut self.client_buf).await.map_err(|err| {
                Error::SocketError(format!("failed to read from client: {err}"))
            })?;
            if n == 0 {
                return Err(Error::SocketError(
                    "client disconnected during authentication".to_string(),
                ));
            }
        }
    }

    /// Pool mode: authenticate the client against the pool password, then
    /// borrow an upstream connection (checkout authenticates upstream when
    /// it has to create one).
    async fn pool_mode_auth(&mut self) -> Result<(), Error> {
        let config = Arc::clone(&self.ctx.config);
        let identity = self.identity.clone().ok_or_else(|| {
            Error::ProtocolSyncError("pool auth without identity".to_string())
        })?;
        let pool = self.ctx.pool.clone().ok_or_else(|| {
            Error::BadConfig("pool mode is enabled but no pool was built".to_string())
        })?;
        let pool_password = config.pool_password.as_deref().ok_or_else(|| {
            Error::BadConfig("pool mode requires pool_password".to_string())
        })?;

        authenticate_client(
            &mut self.client,
            &mut self.client_buf,
            pool_password,
            &self.raw_user,
        )
        .await?;

        let database = self
            .database
            .clone()
            .unwrap_or_else(|| identity.login_role.clone());
        let key = PoolKey::new(&database, &identity.login_role);
        let (conn, reused) = pool.checkout(&key, self.conn_id).await?;
        debug!(
            "[conn: {}] pool {key}: {}",
            self.conn_id,
            if reused { "reused" } else { "created" }
        );
        self.pool_key = Some(key);
        self.pooled = Some(conn);
        Ok(())
    }

    /// Pool mode post-auth: replay the captured ParameterStatus set and a
    /// synthesized BackendKeyData, preserving the illusion of a direct
    /// connection. ReadyForQuery is owed only after injection.
    async fn pooled_post_auth(&mut self) -> Result<(), Error> {
        let conn = self.pooled.as_mut().ok_or_else(|| {
            Error::ProtocolSyncError("pooled post-auth without a connection".to_string())
        })?;

        let mut intro = BytesMut::new();
        for frame in &conn.param_statuses {
            intro.extend_from_slice(frame);
        }
        let pid = NEXT_CLIENT_PID.fetch_add(1, Ordering::Relaxed);
        let secret: i32 = rand::random();
        intro.put(backend_key_data(pid, secret));
        write_all_flush(&mut self.client, &intro).await?;

        self.buffered_ready = Some(ready_for_query(false));
        Ok(())
    }

    /// Passthrough post-auth: forward the server's session preamble but hold
    /// back the first ReadyForQuery.
    async fn passthrough_post_auth(&mut self) -> Result<(), Error> {
        let server = self.server.as_mut().ok_or_else(|| {
            Error::ProtocolSyncError("post-auth without an upstream".to_string())
        })?;

        loop {
            if self.server_buf.is_empty() {
                read_upstream(server, &mut self.server_buf).await?;
            }
            while let Some(message) = try_read_message(&mut self.server_buf)? {
                if message.is_ready_for_query() {
                    debug!(
                        "[conn: {}] ReadyForQuery buffered, injecting context",
                        self.conn_id
                    );
                    self.buffered_ready = Some(message.raw);
                    return Ok(());
                }
                if message.is_error_response() {
                    let text = message.error_message();
                    warn!("[conn: {}] post-auth error: {text}", self.conn_id);
                    write_all_flush(&mut self.client, &message.raw).await?;
                    self.error_sent = true;
                    return Err(Error::ServerAuthError(text));
                }
                // ParameterStatus, BackendKeyData, NoticeResponse.
                write_all_flush(&mut self.client, &message.raw).await?;
            }
        }
    }

    async fn run_resolvers(&mut self) -> Result<(), Error> {
        let Some(engine) = self.ctx.resolver.clone() else {
            return Ok(());
        };

        let conn_id = self.conn_id;
        let context = &mut self.context;
        let (server, server_buf) = match self.pooled.as_mut() {
            Some(conn) => (&mut conn.stream, &mut conn.server_buf),
            None => (
                self.server.as_mut().ok_or_else(|| {
                    Error::ProtocolSyncError("resolving without an upstream".to_string())
                })?,
                &mut self.server_buf,
            ),
        };

        match engine.resolve_context(server, server_buf, context, conn_id).await {
            Ok(()) => Ok(()),
            Err(failure) => {
                if let Some(raw) = failure.server_error {
                    // The server already said why; the client gets it verbatim.
                    let _ = write_all_flush(&mut self.client, &raw).await;
                    self.error_sent = true;
                }
                Err(failure.error)
            }
        }
    }

    /// Send the injection batch as one simple query and consume its
    /// responses through the confirming ReadyForQuery.
    async fn inject_context(&mut self) -> Result<(), Error> {
        let identity = self.identity.clone().ok_or_else(|| {
            Error::ProtocolSyncError("injection without identity".to_string())
        })?;
        let sql = build_injection_sql(&self.ctx.config, &self.context, &identity.login_role)?;
        debug!("[conn: {}] injecting: {sql}", self.conn_id);

        let conn_id = self.conn_id;
        let (server, server_buf) = match self.pooled.as_mut() {
            Some(conn) => (&mut conn.stream, &mut conn.server_buf),
            None => (
                self.server.as_mut().ok_or_else(|| {
                    Error::ProtocolSyncError("injection without an upstream".to_string())
                })?,
                &mut self.server_buf,
            ),
        };

        let query = simple_query(&sql);
        write_all_flush(server, &query).await?;

        loop {
            if server_buf.is_empty() {
                read_upstream(server, server_buf).await?;
            }
            while let Some(message) = try_read_message(server_buf)? {
                if message.is_error_response() {
                    let text = message.error_message();
                    error!("[conn: {conn_id}] context injection failed: {text}");
                    write_all_flush(&mut self.client, &message.raw).await?;
                    self.error_sent = true;
                    return Err(Error::InjectionFailed(text));
                }
                if message.is_ready_for_query() {
                    info!(
                        "[conn: {conn_id}] context set, role={}",
                        self.ctx.config.set_role.as_deref().unwrap_or(&identity.login_role)
                    );
                    return Ok(());
                }
                if message.is_parameter_status() || message.is_notice() {
                    // A SET that touches a reported GUC produces
                    // ParameterStatus; the client's view must match reality.
                    write_all_flush(&mut self.client, &message.raw).await?;
                }
                // CommandComplete and EmptyQueryResponse are swallowed.
            }
        }
    }

    async fn run_bypass_pipe(&mut self) -> Result<(), Error> {
        let mut server = self.server.take().ok_or_else(|| {
            Error::ProtocolSyncError("bypass pipe without an upstream".to_string())
        })?;
        debug!("[conn: {}] transparent pipe (bypass)", self.conn_id);
        let outcome = pipe_transparent(&mut self.client, &mut server, None).await;
        debug!("[conn: {}] bypass pipe ended: {outcome:?}", self.conn_id);
        Ok(())
    }

    async fn run_tenant_pipe(&mut self) -> Result<(), Error> {
        let idle_timeout = self.ctx.config.tenant_query_timeout.map(Duration::from_secs);

        if let Some(mut conn) = self.pooled.take() {
            debug!("[conn: {}] pooled pipe", self.conn_id);
            let outcome = pipe_pooled(
                &mut self.client,
                &mut conn.stream,
                &mut self.client_buf,
                idle_timeout,
            )
            .await;
            debug!("[conn: {}] pooled pipe ended: {outcome:?}", self.conn_id);

            let key = self.pool_key.clone().ok_or_else(|| {
                Error::ProtocolSyncError("pooled pipe without a pool key".to_string())
            })?;
            let pool = self.ctx.pool.clone().ok_or_else(|| {
                Error::ProtocolSyncError("pooled pipe without a pool".to_string())
            })?;

            match outcome {
                PipeOutcome::ClientTerminated => pool.checkin(&key, conn, self.conn_id).await,
                PipeOutcome::Inactive => {
                    TENANT_TIMEOUTS_TOTAL.inc();
                    warn!(
                        "[conn: {}] inactivity timeout, tearing down",
                        self.conn_id
                    );
                    pool.checkin(&key, conn, self.conn_id).await;
                }
                PipeOutcome::ClientClosed
                | PipeOutcome::UpstreamClosed
                | PipeOutcome::ProtocolDesync => pool.discard(&key, conn, self.conn_id),
            }
        } else {
            let mut server = self.server.take().ok_or_else(|| {
                Error::ProtocolSyncError("tenant pipe without an upstream".to_string())
            })?;
            debug!("[conn: {}] transparent pipe", self.conn_id);
            let outcome = pipe_transparent(&mut self.client, &mut server, idle_timeout).await;
            if outcome == PipeOutcome::Inactive {
                TENANT_TIMEOUTS_TOTAL.inc();
                warn!("[conn: {}] inactivity timeout, tearing down", self.conn_id);
            }
            debug!("[conn: {}] pipe ended: {outcome:?}", self.conn_id);
        }

        Ok(())
    }
}
