//! PostgreSQL v3 wire protocol: framing, parsing and message builders.
//!
//! Only the subset the proxy inspects is modeled here. Everything after the
//! handshake is opaque bytes to the rest of the crate.

use bytes::{Buf, BufMut, BytesMut};
use md5::{Digest, Md5};
use tokio::io::AsyncWriteExt;

use crate::errors::Error;
use crate::messages::constants::*;

/// What the client sent as a startup-phase frame.
#[derive(Debug)]
pub enum StartupPacket {
    SslRequest,
    GssEncRequest,
    CancelRequest,
    Startup(StartupMessage),
}

/// Parsed StartupMessage.
///
/// Parameters keep their wire order so that reconstruction is byte-faithful:
/// `build_startup_message(&parse(x)) == x` for any legal startup frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub version: i32,
    pub params: Vec<(String, String)>,
}

impl StartupMessage {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Rewrite the `user` parameter in place, preserving parameter order.
    pub fn set_user(&mut self, user: &str) {
        for (k, v) in self.params.iter_mut() {
            if k == "user" {
                *v = user.to_string();
                return;
            }
        }
        self.params.push(("user".to_string(), user.to_string()));
    }
}

/// A complete typed frame from either peer: tag, i32 length, payload.
#[derive(Debug)]
pub struct BackendMessage {
    pub tag: u8,
    /// Raw bytes including tag and length, ready for forwarding.
    pub raw: BytesMut,
    /// Payload after the length field.
    pub payload: BytesMut,
}

impl BackendMessage {
    pub fn is_auth_ok(&self) -> bool {
        self.auth_subtype() == Some(AUTHENTICATION_SUCCESSFUL)
    }

    /// Authentication subtype, or `None` if this is not an 'R' frame.
    pub fn auth_subtype(&self) -> Option<i32> {
        if self.tag != MESSAGE_AUTHENTICATION || self.payload.len() < 4 {
            return None;
        }
        Some(i32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]))
    }

    /// Does this auth frame expect a client response?
    /// AuthenticationOk and SASLFinal do not.
    pub fn is_auth_challenge(&self) -> bool {
        matches!(self.auth_subtype(),
            Some(subtype) if subtype != AUTHENTICATION_SUCCESSFUL && subtype != SASL_FINAL)
    }

    pub fn is_ready_for_query(&self) -> bool {
        self.tag == MESSAGE_READY_FOR_QUERY
    }

    pub fn is_error_response(&self) -> bool {
        self.tag == MESSAGE_ERROR_RESPONSE
    }

    pub fn is_parameter_status(&self) -> bool {
        self.tag == MESSAGE_PARAMETER_STATUS
    }

    pub fn is_backend_key_data(&self) -> bool {
        self.tag == MESSAGE_BACKEND_KEY_DATA
    }

    pub fn is_notice(&self) -> bool {
        self.tag == MESSAGE_NOTICE_RESPONSE
    }

    /// Human-readable message extracted from an ErrorResponse
    /// (M field first, D appended).
    pub fn error_message(&self) -> String {
        if !self.is_error_response() {
            return "not an error".to_string();
        }
        let mut message = None;
        let mut detail = None;
        let data = &self.payload;
        let mut offset = 0;
        while offset < data.len() {
            let field = data[offset];
            if field == 0 {
                break;
            }
            offset += 1;
            let end = data[offset..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| offset + p)
                .unwrap_or(data.len());
            let value = String::from_utf8_lossy(&data[offset..end]).to_string();
            offset = end + 1;
            match field {
                b'M' => message = Some(value),
                b'D' => detail = Some(value),
                _ => {}
            }
        }
        match (message, detail) {
            (Some(m), Some(d)) => format!("{m}: {d}"),
            (Some(m), None) => m,
            (None, Some(d)) => d,
            (None, None) => "unknown error".to_string(),
        }
    }
}

/// Try to read one startup-phase frame from the buffer.
///
/// Startup frames have no tag byte; the first int32 is the total length
/// including itself. Returns `Ok(None)` until a whole frame has arrived;
/// a length outside [8, 10240] means the stream is not speaking the
/// protocol and the connection must be aborted.
pub fn try_read_startup(buf: &mut BytesMut) -> Result<Option<StartupPacket>, Error> {
    if buf.len() < 8 {
        return Ok(None);
    }

    let length = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if length < 8 || length as usize > MAX_STARTUP_PACKET_SIZE {
        return Err(Error::ProtocolSyncError(format!(
            "startup packet length out of range: {length}"
        )));
    }
    let length = length as usize;
    if buf.len() < length {
        return Ok(None);
    }

    let frame = buf.split_to(length);
    let version = i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);

    match version {
        SSL_REQUEST_CODE => Ok(Some(StartupPacket::SslRequest)),
        REQUEST_GSSENCMODE_CODE => Ok(Some(StartupPacket::GssEncRequest)),
        CANCEL_REQUEST_CODE => Ok(Some(StartupPacket::CancelRequest)),
        _ => {
            let mut params = Vec::new();
            let mut offset = 8;
            while offset < length.saturating_sub(1) {
                let Some(key_end) = frame[offset..].iter().position(|&b| b == 0) else {
                    break;
                };
                let key = String::from_utf8_lossy(&frame[offset..offset + key_end]).to_string();
                offset += key_end + 1;

                let Some(val_end) = frame[offset..].iter().position(|&b| b == 0) else {
                    break;
                };
                let value = String::from_utf8_lossy(&frame[offset..offset + val_end]).to_string();
                offset += val_end + 1;

                if key.is_empty() {
                    break;
                }
                params.push((key, value));
            }
            Ok(Some(StartupPacket::Startup(StartupMessage {
                version,
                params,
            })))
        }
    }
}

/// Try to read one typed frame from the buffer.
///
/// Frame layout: tag (1 byte) + length (int32, includes itself but not the
/// tag) + payload. Returns `Ok(None)` until the whole frame has arrived.
pub fn try_read_message(buf: &mut BytesMut) -> Result<Option<BackendMessage>, Error> {
    if buf.len() < 5 {
        return Ok(None);
    }

    let tag = buf[0];
    let length = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if length < 4 {
        return Err(Error::ProtocolSyncError(format!(
            "invalid message length {length} for tag '{}'",
            tag as char
        )));
    }
    let total = 1 + length as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let raw = BytesMut::from(&buf[..total]);
    let payload = BytesMut::from(&buf[5..total]);
    buf.advance(total);

    Ok(Some(BackendMessage { tag, raw, payload }))
}

/// Build a StartupMessage frame from parsed form, preserving parameter order.
pub fn build_startup_message(startup: &StartupMessage) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32(startup.version);
    for (key, value) in &startup.params {
        body.put_slice(key.as_bytes());
        body.put_u8(0);
        body.put_slice(value.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);

    let mut frame = BytesMut::with_capacity(body.len() + 4);
    frame.put_i32(body.len() as i32 + 4);
    frame.put(body);
    frame
}

/// Create a simple query message.
pub fn simple_query(query: &str) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'Q');
    bytes.put_i32(4 + query.len() as i32 + 1);
    bytes.put_slice(query.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Create an ErrorResponse frame with S/V/C/M fields and an optional D field.
pub fn error_message(message: &str, code: &str) -> BytesMut {
    error_message_detail(message, code, None)
}

pub fn error_message_detail(message: &str, code: &str, detail: Option<&str>) -> BytesMut {
    let mut error = BytesMut::new();
    // Error level
    error.put_u8(b'S');
    error.put_slice(&b"FATAL\0"[..]);
    // Error level (non-translatable)
    error.put_u8(b'V');
    error.put_slice(&b"FATAL\0"[..]);
    // SQLSTATE
    error.put_u8(b'C');
    error.put_slice(format!("{code}\0").as_bytes());
    // The short error message.
    error.put_u8(b'M');
    error.put_slice(format!("{message}\0").as_bytes());
    if let Some(detail) = detail {
        error.put_u8(b'D');
        error.put_slice(format!("{detail}\0").as_bytes());
    }
    // No more fields follow.
    error.put_u8(0);

    let mut res = BytesMut::with_capacity(error.len() + 5);
    res.put_u8(b'E');
    res.put_i32(error.len() as i32 + 4);
    res.put(error);
    res
}

/// Send a terminal ErrorResponse (no ReadyForQuery follows).
pub async fn error_response_terminal<S>(stream: &mut S, message: &str, code: &str) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let res = error_message(message, code);
    crate::messages::write_all_flush(stream, &res).await
}

/// Create a ReadyForQuery message.
pub fn ready_for_query(in_transaction: bool) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'Z');
    bytes.put_i32(5);
    bytes.put_u8(if in_transaction { b'T' } else { b'I' });
    bytes
}

/// Create an AuthenticationOk message.
pub fn auth_ok() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(9);
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(AUTHENTICATION_SUCCESSFUL);
    bytes
}

/// Generate a plain password challenge.
pub fn plain_password_challenge() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(9);
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(AUTHENTICATION_CLEAR_PASSWORD);
    bytes
}

/// Create a BackendKeyData message.
pub fn backend_key_data(process_id: i32, secret_key: i32) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(13);
    bytes.put_u8(b'K');
    bytes.put_i32(12);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);
    bytes
}

/// Create a PasswordMessage for the server.
pub fn password_message(password: &[u8]) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(password.len() + 6);
    bytes.put_u8(b'p');
    bytes.put_i32(4 + password.len() as i32 + 1);
    bytes.put_slice(password);
    bytes.put_u8(0);
    bytes
}

/// Create a SASLInitialResponse with mechanism name and initial data.
pub fn sasl_initial_response(mechanism: &str, data: &[u8]) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'p');
    bytes.put_i32(4 + mechanism.len() as i32 + 1 + 4 + data.len() as i32);
    bytes.put_slice(mechanism.as_bytes());
    bytes.put_u8(0);
    bytes.put_i32(data.len() as i32);
    bytes.put_slice(data);
    bytes
}

/// Create a SASLResponse with response data.
pub fn sasl_response(data: &[u8]) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'p');
    bytes.put_i32(4 + data.len() as i32);
    bytes.put_slice(data);
    bytes
}

/// Send an SSLRequest to the server.
pub async fn ssl_request(stream: &mut tokio::net::TcpStream) -> Result<(), Error> {
    let mut bytes = BytesMut::with_capacity(8);
    bytes.put_i32(8);
    bytes.put_i32(SSL_REQUEST_CODE);
    match stream.write_all(&bytes).await {
        Ok(_) => Ok(()),
        Err(err) => Err(Error::SocketError(format!(
            "Failed to write SSL request to server socket: {err}"
        ))),
    }
}

/// Create md5 password hash given a salt: "md5" || hex(md5(hex(md5(password || user)) || salt)).
pub fn md5_hash_password(user: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();
    // First pass
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let output = md5.finalize_reset();

    // Second pass
    md5.update(format!("{output:x}"));
    md5.update(salt);

    format!("md5{:x}", md5.finalize()).into_bytes()
}

/// Escape an identity-derived value as a single-quoted SQL literal.
///
/// The charset is the trust boundary: identity values arrive from the
/// network and anything outside `[A-Za-z0-9_.-]` is refused outright.
pub fn escape_literal(value: &str) -> Result<String, Error> {
    if value.is_empty()
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(Error::BadIdentity(format!(
            "disallowed characters in context value '{value}'"
        )));
    }
    Ok(format!("'{}'", value.replace('\'', "''")))
}

/// Escape a database-sourced value as a single-quoted SQL literal.
///
/// Resolver results may legitimately contain array literals, spaces and
/// commas; quote-doubling is the only transformation applied.
pub fn escape_set_value(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote an identifier (double-quoted). Restricted to `[A-Za-z0-9_]`.
pub fn quote_ident(value: &str) -> Result<String, Error> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::BadIdentity(format!("invalid identifier: '{value}'")));
    }
    Ok(format!("\"{value}\""))
}

/// Validate a session variable name for bare use in a SET statement.
/// Dotted names like `app.current_tenant_id` are legal SET targets.
pub fn check_session_var(name: &str) -> Result<(), Error> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(Error::BadConfig(format!(
            "invalid session variable name: '{name}'"
        )));
    }
    Ok(())
}

/// Parse column names from a RowDescription payload.
pub fn parse_row_description(payload: &[u8]) -> Vec<String> {
    if payload.len() < 2 {
        return Vec::new();
    }
    let field_count = i16::from_be_bytes([payload[0], payload[1]]) as usize;
    let mut names = Vec::with_capacity(field_count);
    let mut offset = 2;

    for _ in 0..field_count {
        if offset >= payload.len() {
            break;
        }
        let end = payload[offset..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| offset + p)
            .unwrap_or(payload.len());
        names.push(String::from_utf8_lossy(&payload[offset..end]).to_string());
        // table oid (4) + column (2) + type oid (4) + type size (2)
        // + type modifier (4) + format code (2)
        offset = end + 1 + 18;
    }

    names
}

/// Parse a DataRow payload into column name → value. NULL columns (length
/// -1) map to `None`.
pub fn parse_data_row(payload: &[u8], columns: &[String]) -> Vec<(String, Option<String>)> {
    let mut row = Vec::new();
    if payload.len() < 2 {
        return row;
    }
    let field_count = i16::from_be_bytes([payload[0], payload[1]]) as usize;
    let mut offset = 2;

    for i in 0..field_count {
        if offset + 4 > payload.len() {
            break;
        }
        let len = i32::from_be_bytes([
            payload[offset],
            payload[offset + 1],
            payload[offset + 2],
            payload[offset + 3],
        ]);
        offset += 4;

        let value = if len < 0 {
            None
        } else {
            let len = len as usize;
            if offset + len > payload.len() {
                break;
            }
            let v = String::from_utf8_lossy(&payload[offset..offset + len]).to_string();
            offset += len;
            Some(v)
        };

        if let Some(name) = columns.get(i) {
            row.push((name.clone(), value));
        }
    }

    row
}
