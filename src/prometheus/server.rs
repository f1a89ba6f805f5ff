//! Admin HTTP listener: health checks, Prometheus metrics, status snapshot.
//!
//! Plain HTTP/1.1 with three routes and no authentication; bind it to
//! localhost or a private interface.

use log::{error, info};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

use crate::pool::Pool;
use crate::prometheus::{
    POOL_CONNECTIONS_IDLE, POOL_CONNECTIONS_TOTAL, REGISTRY, RESOLVER_CACHE_SIZE,
};
use crate::resolver::ResolverEngine;

/// Shared read-model handed to the admin endpoints.
#[derive(Clone, Default)]
pub struct AdminState {
    pub pool: Option<Arc<Pool>>,
    pub resolver: Option<Arc<ResolverEngine>>,
}

/// Refresh the gauges derived from shared state before serving a scrape.
fn update_gauges(state: &AdminState) {
    if let Some(pool) = &state.pool {
        POOL_CONNECTIONS_TOTAL.reset();
        POOL_CONNECTIONS_IDLE.reset();
        for bucket in pool.snapshot() {
            POOL_CONNECTIONS_TOTAL
                .with_label_values(&[bucket.database.as_str(), bucket.role.as_str()])
                .set(bucket.total as i64);
            POOL_CONNECTIONS_IDLE
                .with_label_values(&[bucket.database.as_str(), bucket.role.as_str()])
                .set(bucket.idle as i64);
        }
    }
    if let Some(resolver) = &state.resolver {
        RESOLVER_CACHE_SIZE.set(resolver.cache_size() as i64);
    }
}

async fn handle_request(mut stream: TcpStream, state: AdminState) {
    let mut headers = [0u8; 1024];
    let n = match stream.read(&mut headers).await {
        Ok(n) => n,
        Err(err) => {
            error!("Failed to read HTTP request: {err}");
            return;
        }
    };

    let request = String::from_utf8_lossy(&headers[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let (status, content_type, body) = match path {
        "/health" => (
            "200 OK",
            "application/json",
            br#"{"status":"ok"}"#.to_vec(),
        ),
        "/metrics" => {
            update_gauges(&state);
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
                error!("Failed to encode metrics: {err}");
                return;
            }
            ("200 OK", "text/plain; version=0.0.4; charset=utf-8", buffer)
        }
        "/status" => {
            update_gauges(&state);
            ("200 OK", "application/json", status_json(&state))
        }
        _ => ("404 Not Found", "text/plain", b"not found".to_vec()),
    };

    let header = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        body.len()
    );

    if let Err(err) = stream.write_all(header.as_bytes()).await {
        error!("Failed to write HTTP response header: {err}");
        return;
    }
    if let Err(err) = stream.write_all(&body).await {
        error!("Failed to write HTTP response body: {err}");
        return;
    }
    let _ = stream.flush().await;
}

fn status_json(state: &AdminState) -> Vec<u8> {
    use crate::prometheus::*;

    let buckets: Vec<serde_json::Value> = state
        .pool
        .as_ref()
        .map(|pool| {
            pool.snapshot()
                .into_iter()
                .map(|b| {
                    serde_json::json!({
                        "database": b.database,
                        "role": b.role,
                        "total": b.total,
                        "idle": b.idle,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let resolvers: Vec<serde_json::Value> = state
        .resolver
        .as_ref()
        .map(|engine| {
            engine
                .resolver_names()
                .iter()
                .map(|name| {
                    serde_json::json!({
                        "name": name,
                        "executions": RESOLVER_EXECUTIONS_TOTAL
                            .with_label_values(&[name.as_str()])
                            .get(),
                        "errors": RESOLVER_ERRORS_TOTAL
                            .with_label_values(&[name.as_str()])
                            .get(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let status = serde_json::json!({
        "connections_total": CONNECTIONS_TOTAL.get(),
        "connections_active": CONNECTIONS_ACTIVE.get(),
        "pool": {
            "checkouts": POOL_CHECKOUTS_TOTAL.get(),
            "reuses": POOL_REUSES_TOTAL.get(),
            "creates": POOL_CREATES_TOTAL.get(),
            "checkins": POOL_CHECKINS_TOTAL.get(),
            "discards": POOL_DISCARDS_TOTAL.get(),
            "timeouts": POOL_TIMEOUTS_TOTAL.get(),
            "buckets": buckets,
        },
        "resolvers": {
            "cache_hits": RESOLVER_CACHE_HITS_TOTAL.get(),
            "cache_misses": RESOLVER_CACHE_MISSES_TOTAL.get(),
            "cache_size": state.resolver.as_ref().map(|r| r.cache_size()).unwrap_or(0),
            "resolvers": resolvers,
        },
    });

    serde_json::to_vec_pretty(&status).unwrap_or_else(|_| b"{}".to_vec())
}

/// Start the admin HTTP server. Runs until the process exits.
pub async fn start_admin_server(host: &str, state: AdminState) {
    let addr: SocketAddr = match host.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!("Failed to parse admin address '{host}': {err}");
            return;
        }
    };

    let socket = match if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    } {
        Ok(socket) => socket,
        Err(err) => {
            error!("Failed to create admin socket: {err}");
            return;
        }
    };
    if let Err(err) = socket.set_reuseaddr(true) {
        error!("Failed to set SO_REUSEADDR on admin socket: {err}");
        return;
    }
    if let Err(err) = socket.bind(addr) {
        error!("Failed to bind admin API to {addr}: {err}");
        return;
    }

    match socket.listen(128) {
        Ok(listener) => {
            info!("Admin API listening on {addr}");
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            handle_request(stream, state).await;
                        });
                    }
                    Err(err) => {
                        error!("Admin accept error: {err}");
                    }
                }
            }
        }
        Err(err) => {
            error!("Failed to listen on admin socket {addr}: {err}");
        }
    }
}
