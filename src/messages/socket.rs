//! Helper functions to write wire frames and configure TCP sockets.

use socket2::SockRef;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::errors::Error;

/// Write all bytes to the socket and flush.
pub async fn write_all_flush<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match stream.write_all(buf).await {
        Ok(_) => match stream.flush().await {
            Ok(_) => Ok(()),
            Err(err) => Err(Error::SocketError(format!("Failed to flush socket: {err}"))),
        },
        Err(err) => Err(Error::SocketError(format!(
            "Failed to write to socket: {err}"
        ))),
    }
}

/// Configure a TCP socket the way a latency-sensitive proxy wants it.
pub fn configure_tcp_socket(stream: &TcpStream) {
    let sock_ref = SockRef::from(stream);
    if let Err(err) = sock_ref.set_nodelay(true) {
        log::warn!("Failed to set TCP_NODELAY: {err}");
    }
    if let Err(err) = sock_ref.set_keepalive(true) {
        log::warn!("Failed to set SO_KEEPALIVE: {err}");
    }
}
