//! Upstream connection establishment.

use bytes::BytesMut;
use log::{debug, error};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::config::Config;
use crate::errors::Error;
use crate::messages::{configure_tcp_socket, ssl_request};
use crate::server::stream::StreamInner;

/// Open a TCP connection to the upstream server, negotiating TLS through
/// the startup-time SSLRequest handshake when `upstream_tls` is enabled.
pub async fn connect_upstream(
    config: &Config,
    tls_connector: Option<&tokio_native_tls::TlsConnector>,
) -> Result<StreamInner, Error> {
    let address = format!("{}:{}", config.upstream_host, config.upstream_port);
    let mut stream = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(err) => {
            error!("Could not connect to server {address}: {err}");
            return Err(Error::SocketError(format!(
                "Could not connect to server {address}: {err}"
            )));
        }
    };

    configure_tcp_socket(&stream);

    let Some(connector) = tls_connector else {
        return Ok(StreamInner::plain(stream));
    };

    // Request a TLS connection.
    ssl_request(&mut stream).await?;

    let response = match stream.read_u8().await {
        Ok(response) => response as char,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Failed to read TLS response from server: {err}"
            )));
        }
    };

    match response {
        'S' => {
            debug!("Upstream {address} accepted TLS");
            let tls_stream = connector
                .connect(&config.upstream_host, stream)
                .await
                .map_err(|err| Error::TlsError(format!("upstream TLS handshake: {err}")))?;
            Ok(StreamInner::tls(tls_stream))
        }
        'N' => Err(Error::TlsError(format!(
            "upstream {address} does not support TLS but upstream_tls is enabled"
        ))),
        m => Err(Error::SocketError(format!(
            "Received unexpected response '{m}' during TLS negotiation. Expected 'S' or 'N'."
        ))),
    }
}

/// Read one more chunk from the upstream into the buffer, failing on EOF.
pub async fn read_upstream(server: &mut StreamInner, buf: &mut BytesMut) -> Result<(), Error> {
    let n = server
        .read_buf(buf)
        .await
        .map_err(|err| Error::SocketError(format!("Failed to read from server: {err}")))?;
    if n == 0 {
        return Err(Error::SocketError(
            "server closed the connection unexpectedly".to_string(),
        ));
    }
    Ok(())
}
