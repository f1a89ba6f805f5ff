//! Handling of the first frames a client sends.

use bytes::BytesMut;
use log::debug;
use tokio::io::AsyncReadExt;

use crate::errors::Error;
use crate::messages::{try_read_startup, write_all_flush, StartupMessage, StartupPacket};
use crate::server::stream::StreamInner;

/// Classified result of the startup phase.
pub enum ClientFirst {
    Startup(StartupMessage),
    CancelRequest,
}

/// Read frames until the client produces a real StartupMessage or a
/// CancelRequest.
///
/// SSLRequest and GSSENCRequest are answered with 'N' and the framer stays
/// in the initial state, so a client may retry with a plain startup on the
/// same connection. Bytes that arrive behind the startup frame remain in
/// `buf` for the caller to forward.
pub async fn read_client_startup(
    client: &mut StreamInner,
    buf: &mut BytesMut,
    conn_id: u64,
) -> Result<ClientFirst, Error> {
    loop {
        match try_read_startup(buf)? {
            Some(StartupPacket::SslRequest) => {
                debug!("[conn: {conn_id}] SSL request denied on plain listener");
                write_all_flush(client, b"N").await?;
            }
            Some(StartupPacket::GssEncRequest) => {
                debug!("[conn: {conn_id}] GSSAPI encryption request denied");
                write_all_flush(client, b"N").await?;
            }
            Some(StartupPacket::CancelRequest) => {
                return Ok(ClientFirst::CancelRequest);
            }
            Some(StartupPacket::Startup(startup)) => {
                return Ok(ClientFirst::Startup(startup));
            }
            None => {
                let n = client
                    .read_buf(buf)
                    .await
                    .map_err(|err| Error::SocketError(format!("startup read failed: {err}")))?;
                if n == 0 {
                    return Err(Error::ClientBadStartup(
                        "client disconnected before sending a startup message".to_string(),
                    ));
                }
            }
        }
    }
}
