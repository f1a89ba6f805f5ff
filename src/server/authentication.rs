//! Authentication against the upstream PostgreSQL server.
//!
//! Used in pool mode, where the proxy itself owns the upstream credentials.
//! Handles cleartext, MD5 and SCRAM-SHA-256, driven by whatever the server
//! asks for.

use bytes::BytesMut;
use log::{debug, error};

use crate::auth::scram_client::ScramSha256;
use crate::errors::Error;
use crate::messages::constants::*;
use crate::messages::{
    md5_hash_password, password_message, sasl_initial_response, sasl_response, try_read_message,
    write_all_flush,
};
use crate::server::connect::read_upstream;
use crate::server::stream::StreamInner;

/// Drive the server's authentication exchange to completion.
///
/// Consumes frames from `server_buf` (refilling from the stream as needed)
/// until AuthenticationOk. Leftover frames after AuthenticationOk stay in
/// `server_buf` for the caller; the server usually pipelines
/// ParameterStatus right behind it.
pub async fn authenticate_upstream(
    server: &mut StreamInner,
    server_buf: &mut BytesMut,
    username: &str,
    password: &str,
) -> Result<(), Error> {
    let mut scram: Option<ScramSha256> = None;

    loop {
        if server_buf.is_empty() {
            read_upstream(server, server_buf).await?;
        }

        while let Some(message) = try_read_message(server_buf)? {
            if message.is_error_response() {
                let text = message.error_message();
                error!("Upstream authentication failed for {username}: {text}");
                return Err(Error::ServerAuthError(text));
            }

            let Some(subtype) = message.auth_subtype() else {
                // Not an 'R' frame during auth means the server lost sync.
                return Err(Error::ProtocolSyncError(format!(
                    "unexpected message '{}' during server authentication",
                    message.tag as char
                )));
            };

            match subtype {
                AUTHENTICATION_SUCCESSFUL => {
                    debug!("Upstream authentication ok for {username}");
                    return Ok(());
                }

                AUTHENTICATION_CLEAR_PASSWORD => {
                    let response = password_message(password.as_bytes());
                    write_all_flush(server, &response).await?;
                }

                MD5_ENCRYPTED_PASSWORD => {
                    if message.payload.len() < 8 {
                        return Err(Error::ServerAuthError(
                            "MD5 challenge is missing its salt".to_string(),
                        ));
                    }
                    let salt = &message.payload[4..8];
                    let hash = md5_hash_password(username, password, salt);
                    let response = password_message(&hash);
                    write_all_flush(server, &response).await?;
                }

                SASL => {
                    let mechanisms = String::from_utf8_lossy(&message.payload[4..]);
                    if !mechanisms.contains(SCRAM_SHA_256) {
                        error!("Unsupported SASL mechanisms offered: {mechanisms}");
                        return Err(Error::ServerAuthError(format!(
                            "server offers no supported SASL mechanism: {mechanisms}"
                        )));
                    }
                    let client = ScramSha256::new(password);
                    let initial = sasl_initial_response(SCRAM_SHA_256, &client.message());
                    write_all_flush(server, &initial).await?;
                    scram = Some(client);
                }

                SASL_CONTINUE => {
                    let client = scram.as_mut().ok_or_else(|| {
                        Error::ProtocolSyncError(
                            "SASLContinue before SASL mechanism negotiation".to_string(),
                        )
                    })?;
                    let client_final = client.update(&message.payload[4..])?;
                    let response = sasl_response(&client_final);
                    write_all_flush(server, &response).await?;
                }

                SASL_FINAL => {
                    // No client reply expected; AuthenticationOk may arrive in
                    // the same chunk or a later one. Keep looping either way.
                    let client = scram.as_mut().ok_or_else(|| {
                        Error::ProtocolSyncError(
                            "SASLFinal before SASL mechanism negotiation".to_string(),
                        )
                    })?;
                    client.finish(&message.payload[4..])?;
                    debug!("SCRAM server signature verified for {username}");
                }

                other => {
                    error!("Unsupported server authentication method: {other}");
                    return Err(Error::ServerAuthError(format!(
                        "authentication method {other} requested by the server is not supported"
                    )));
                }
            }
        }
    }
}
