//! The transparent pipe: byte shoveling after the handshake.
//!
//! Passthrough mode splices both directions as raw bytes. Pool mode frames
//! the client→upstream direction so a `Terminate` ('X') can be intercepted
//! while the upstream connection survives for reuse; the upstream→client
//! direction stays a raw copy. The client may close at any time; the
//! upstream must outlive it.

use bytes::{Buf, BytesMut};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::messages::constants::MESSAGE_TERMINATE;
use crate::server::stream::StreamInner;

const WATCHDOG_TICK: Duration = Duration::from_secs(1);

/// How a pipe ended. Decides whether the upstream is reusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOutcome {
    /// The client sent Terminate; the upstream is healthy and reusable.
    ClientTerminated,
    /// The client vanished without Terminate. The upstream may be
    /// mid-conversation and must not be reused.
    ClientClosed,
    /// The upstream closed or failed.
    UpstreamClosed,
    /// The inactivity watchdog fired.
    Inactive,
    /// The client stopped speaking the protocol.
    ProtocolDesync,
}

/// Raw bidirectional copy until either side closes.
pub async fn pipe_transparent(
    client: &mut StreamInner,
    server: &mut StreamInner,
    idle_timeout: Option<Duration>,
) -> PipeOutcome {
    let mut client_buf = BytesMut::with_capacity(16 * 1024);
    let mut server_buf = BytesMut::with_capacity(16 * 1024);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            read = client.read_buf(&mut client_buf) => {
                match read {
                    Ok(0) | Err(_) => return PipeOutcome::ClientClosed,
                    Ok(_) => {
                        last_activity = Instant::now();
                        if server.write_all(&client_buf).await.is_err()
                            || server.flush().await.is_err()
                        {
                            return PipeOutcome::UpstreamClosed;
                        }
                        client_buf.clear();
                    }
                }
            }
            read = server.read_buf(&mut server_buf) => {
                match read {
                    Ok(0) | Err(_) => return PipeOutcome::UpstreamClosed,
                    Ok(_) => {
                        last_activity = Instant::now();
                        if client.write_all(&server_buf).await.is_err()
                            || client.flush().await.is_err()
                        {
                            return PipeOutcome::ClientClosed;
                        }
                        server_buf.clear();
                    }
                }
            }
            _ = tokio::time::sleep(WATCHDOG_TICK), if idle_timeout.is_some() => {
                if last_activity.elapsed() >= idle_timeout.unwrap() {
                    return PipeOutcome::Inactive;
                }
            }
        }
    }
}

/// Pool-mode pipe: client→upstream is message-framed so Terminate can be
/// intercepted; only complete frames are ever forwarded, so the upstream
/// never observes a half-written message.
///
/// `client_buf` carries any bytes the client pipelined before the pipe
/// started; its unconsumed remainder stays framed across reads.
pub async fn pipe_pooled(
    client: &mut StreamInner,
    server: &mut StreamInner,
    client_buf: &mut BytesMut,
    idle_timeout: Option<Duration>,
) -> PipeOutcome {
    let mut server_buf = BytesMut::with_capacity(16 * 1024);
    let mut last_activity = Instant::now();

    // The client may have pipelined queries right behind the handshake.
    match forward_client_frames(client_buf, server).await {
        Ok(Some(outcome)) => return outcome,
        Ok(None) => {}
        Err(outcome) => return outcome,
    }

    loop {
        tokio::select! {
            read = client.read_buf(client_buf) => {
                match read {
                    Ok(0) | Err(_) => return PipeOutcome::ClientClosed,
                    Ok(_) => {
                        last_activity = Instant::now();
                        match forward_client_frames(client_buf, server).await {
                            Ok(Some(outcome)) => return outcome,
                            Ok(None) => {}
                            Err(outcome) => return outcome,
                        }
                    }
                }
            }
            read = server.read_buf(&mut server_buf) => {
                match read {
                    Ok(0) | Err(_) => return PipeOutcome::UpstreamClosed,
                    Ok(_) => {
                        last_activity = Instant::now();
                        if client.write_all(&server_buf).await.is_err()
                            || client.flush().await.is_err()
                        {
                            return PipeOutcome::ClientClosed;
                        }
                        server_buf.clear();
                    }
                }
            }
            _ = tokio::time::sleep(WATCHDOG_TICK), if idle_timeout.is_some() => {
                if last_activity.elapsed() >= idle_timeout.unwrap() {
                    return PipeOutcome::Inactive;
                }
            }
        }
    }
}

/// Forward every complete frame in `buf` to the server, stopping at
/// Terminate. Partial frames stay in `buf` for the next read.
///
/// `Ok(Some(_))` is a normal stop (Terminate), `Err(_)` a failure stop.
async fn forward_client_frames(
    buf: &mut BytesMut,
    server: &mut StreamInner,
) -> Result<Option<PipeOutcome>, PipeOutcome> {
    let mut out = BytesMut::new();
    let mut terminated = false;

    loop {
        if buf.len() < 5 {
            break;
        }
        let tag = buf[0];
        let length = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if length < 4 {
            return Err(PipeOutcome::ProtocolDesync);
        }
        let total = 1 + length as usize;
        if buf.len() < total {
            break;
        }

        if tag == MESSAGE_TERMINATE {
            terminated = true;
            buf.advance(total);
            break;
        }

        out.extend_from_slice(&buf[..total]);
        buf.advance(total);
    }

    if !out.is_empty()
        && (server.write_all(&out).await.is_err() || server.flush().await.is_err())
    {
        return Err(PipeOutcome::UpstreamClosed);
    }

    if terminated {
        Ok(Some(PipeOutcome::ClientTerminated))
    } else {
        Ok(None)
    }
}
