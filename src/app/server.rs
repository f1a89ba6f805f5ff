//! Runtime construction, listeners, dispatch and graceful shutdown.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, error, info, warn};
use socket2::SockRef;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Builder;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use crate::app::args::Args;
use crate::app::tls::{init_tls, TlsState};
use crate::client::{handle_client, next_conn_id, ProxyContext};
use crate::config::{Config, PoolMode};
use crate::errors::Error;
use crate::messages::{configure_tcp_socket, try_read_startup, write_all_flush, StartupPacket};
use crate::pool::Pool;
use crate::prometheus::{start_admin_server, AdminState, CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL};
use crate::resolver::load_resolvers;
use crate::server::stream::StreamInner;
use crate::tenant::TenantRegistry;

/// How often expired resolver cache entries are swept out.
const CACHE_EVICT_INTERVAL: Duration = Duration::from_secs(60);

pub fn run_server(_args: &Args, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let tls_state = init_tls(&config)?;
    let config = Arc::new(config);

    let resolver = match &config.resolvers {
        Some(path) => Some(Arc::new(load_resolvers(path)?)),
        None => None,
    };

    let runtime = Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .thread_name("worker-pgvpd")
        .build()?;

    runtime.block_on(serve(config, tls_state, resolver))?;
    Ok(())
}

async fn serve(
    config: Arc<Config>,
    tls_state: TlsState,
    resolver: Option<Arc<crate::resolver::ResolverEngine>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let pool = if config.pool_mode == PoolMode::Session {
        Some(Arc::new(Pool::new(
            Arc::clone(&config),
            tls_state.connector.clone(),
        )))
    } else {
        None
    };

    let tenants = Arc::new(TenantRegistry::new(&config));

    let ctx = Arc::new(ProxyContext {
        config: Arc::clone(&config),
        pool: pool.clone(),
        resolver: resolver.clone(),
        tenants,
        upstream_tls: tls_state.connector.clone(),
    });

    // Background tasks.
    if let Some(pool) = pool.clone() {
        tokio::spawn(pool.run_idle_reaper());
    }
    if let Some(engine) = resolver.clone() {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CACHE_EVICT_INTERVAL).await;
                engine.evict_expired();
            }
        });
    }
    if let Some(admin_port) = config.admin_port {
        let state = AdminState {
            pool: pool.clone(),
            resolver: resolver.clone(),
        };
        let host = format!("0.0.0.0:{admin_port}");
        tokio::spawn(async move {
            start_admin_server(&host, state).await;
        });
    }

    // Listeners.
    let listener = bind_listener(&config.listen_host, config.listen_port)?;
    info!(
        "Listening on {}:{}",
        config.listen_host, config.listen_port
    );

    let tls_listener = match (config.tls_port, tls_state.acceptor.clone()) {
        (Some(port), Some(_)) => {
            let listener = bind_listener(&config.listen_host, port)?;
            info!("TLS listener on {}:{port}", config.listen_host);
            Some(listener)
        }
        _ => None,
    };

    config.show();

    let mut term_signal = unix_signal(SignalKind::terminate())?;
    let mut interrupt_signal = unix_signal(SignalKind::interrupt())?;
    let mut hangup_signal = unix_signal(SignalKind::hangup())?;

    info!("Waiting for clients");
    loop {
        let tls_accept = async {
            match &tls_listener {
                Some(listener) => listener.accept().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = hangup_signal.recv() => {
                // Configuration is bound to live pool identities; a restart
                // is the supported reload path.
                info!("Got SIGHUP; pgvpd does not hot-reload configuration");
            }

            _ = interrupt_signal.recv() => {
                info!("Got SIGINT, shutting down");
                break;
            }

            _ = term_signal.recv() => {
                info!("Got SIGTERM, shutting down");
                break;
            }

            accepted = listener.accept() => {
                let (socket, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!("accept error: {err:?}");
                        continue;
                    }
                };
                configure_tcp_socket(&socket);
                let ctx = Arc::clone(&ctx);
                let conn_id = next_conn_id();
                tokio::spawn(async move {
                    CONNECTIONS_TOTAL.inc();
                    CONNECTIONS_ACTIVE.inc();
                    debug!("[conn: {conn_id}] accepted {addr}");
                    handle_client(ctx, StreamInner::plain(socket), conn_id).await;
                    CONNECTIONS_ACTIVE.dec();
                });
            }

            accepted = tls_accept => {
                let (socket, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!("TLS accept error: {err:?}");
                        continue;
                    }
                };
                configure_tcp_socket(&socket);
                let ctx = Arc::clone(&ctx);
                let acceptor = tls_state.acceptor.clone();
                let conn_id = next_conn_id();
                tokio::spawn(async move {
                    CONNECTIONS_TOTAL.inc();
                    CONNECTIONS_ACTIVE.inc();
                    debug!("[conn: {conn_id}] accepted {addr} (tls)");
                    if let Some(acceptor) = acceptor {
                        match tls_entrypoint(socket, acceptor, conn_id).await {
                            Ok(stream) => handle_client(ctx, stream, conn_id).await,
                            Err(err) => debug!("[conn: {conn_id}] TLS setup failed: {err}"),
                        }
                    }
                    CONNECTIONS_ACTIVE.dec();
                });
            }
        }
    }

    if let Some(pool) = pool {
        pool.drain_idle();
    }
    info!("Shutdown complete");
    Ok(())
}

/// Negotiate TLS on the dedicated TLS port: the client opens with an
/// SSLRequest, gets 'S', and the real startup follows on the TLS stream.
async fn tls_entrypoint(
    mut socket: TcpStream,
    acceptor: tokio_native_tls::TlsAcceptor,
    conn_id: u64,
) -> Result<StreamInner, Error> {
    let mut buf = BytesMut::with_capacity(16);
    loop {
        match try_read_startup(&mut buf)? {
            Some(StartupPacket::SslRequest) => break,
            Some(other) => {
                warn!("[conn: {conn_id}] expected SSLRequest on TLS port, got {other:?}");
                return Err(Error::ProtocolSyncError(
                    "expected SSLRequest on the TLS port".to_string(),
                ));
            }
            None => {
                let n = socket
                    .read_buf(&mut buf)
                    .await
                    .map_err(|err| Error::SocketError(format!("TLS startup read: {err}")))?;
                if n == 0 {
                    return Err(Error::SocketError(
                        "client closed before SSLRequest".to_string(),
                    ));
                }
            }
        }
    }

    write_all_flush(&mut socket, b"S").await?;

    let tls_stream = acceptor
        .accept(socket)
        .await
        .map_err(|err| Error::TlsError(format!("TLS negotiation failed: {err}")))?;

    Ok(StreamInner::tls(tls_stream))
}

fn bind_listener(host: &str, port: u16) -> Result<TcpListener, Error> {
    let addr = format!("{host}:{port}")
        .to_socket_addrs()
        .map_err(|err| Error::BadConfig(format!("cannot resolve {host}:{port}: {err}")))?
        .next()
        .ok_or_else(|| Error::BadConfig(format!("no address for {host}:{port}")))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|err| Error::SocketError(format!("cannot create listener socket: {err}")))?;

    socket
        .set_reuseaddr(true)
        .map_err(|err| Error::SocketError(format!("cannot set reuseaddr: {err}")))?;
    socket
        .set_nodelay(true)
        .map_err(|err| Error::SocketError(format!("cannot set nodelay: {err}")))?;
    {
        let sock_ref = SockRef::from(&socket);
        sock_ref
            .set_linger(Some(Duration::from_secs(0)))
            .map_err(|err| Error::SocketError(format!("cannot set linger: {err}")))?;
    }

    socket
        .bind(addr)
        .map_err(|err| Error::BadConfig(format!("cannot bind {addr}: {err}")))?;
    socket
        .listen(1024)
        .map_err(|err| Error::BadConfig(format!("cannot listen on {addr}: {err}")))
}
