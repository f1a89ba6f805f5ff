//! Client-facing authentication.
//!
//! Only used in pool mode: the proxy terminates the client's credential
//! exchange itself (cleartext against the configured pool password) because
//! the upstream credentials never leave the proxy. In passthrough mode the
//! exchange is relayed byte-for-byte and this module is not involved.

pub mod scram_client;

use bytes::BytesMut;
use log::{debug, warn};
use tokio::io::AsyncReadExt;

use crate::errors::Error;
use crate::messages::constants::MESSAGE_PASSWORD;
use crate::messages::{auth_ok, plain_password_challenge, try_read_message, write_all_flush};
use crate::server::stream::StreamInner;

/// Authenticate the client with a cleartext password challenge.
///
/// The password frame is read through `client_buf` so bytes the client
/// pipelined behind its startup message are not lost. On success the client
/// has seen AuthenticationOk. On failure nothing has been written: the
/// connection handler owns the single ErrorResponse sent to a rejected
/// client.
pub async fn authenticate_client(
    client: &mut StreamInner,
    client_buf: &mut BytesMut,
    expected_password: &str,
    username: &str,
) -> Result<(), Error> {
    let challenge = plain_password_challenge();
    write_all_flush(client, &challenge).await?;

    let message = loop {
        if let Some(message) = try_read_message(client_buf)? {
            break message;
        }
        let n = client
            .read_buf(client_buf)
            .await
            .map_err(|err| Error::SocketError(format!("failed to read password: {err}")))?;
        if n == 0 {
            return Err(Error::SocketError(
                "client disconnected during authentication".to_string(),
            ));
        }
    };

    if message.tag != MESSAGE_PASSWORD {
        return Err(Error::ProtocolSyncError(format!(
            "expected password message (p), received '{}'",
            message.tag as char
        )));
    }

    // Strip the trailing null terminator.
    let mut password = message.payload;
    if password.last() == Some(&0) {
        password.truncate(password.len() - 1);
    }

    if !constant_time_eq(&password, expected_password.as_bytes()) {
        warn!("Password authentication failed for user \"{username}\"");
        return Err(Error::AuthError(format!(
            "password authentication failed for user \"{username}\""
        )));
    }

    debug!("Client password verified for {username}");
    let ok = auth_ok();
    write_all_flush(client, &ok).await?;
    Ok(())
}

/// Length-leaking comparisons are fine; content timing is not.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::constant_time_eq;

    #[test]
    fn compares_equal_and_unequal() {
        assert!(constant_time_eq(b"swordfish", b"swordfish"));
        assert!(!constant_time_eq(b"swordfish", b"sw0rdfish"));
        assert!(!constant_time_eq(b"short", b"longer-password"));
        assert!(constant_time_eq(b"", b""));
    }
}
