//! Tests for protocol message handling.

use bytes::{BufMut, BytesMut};

use super::constants::*;
use super::protocol::*;

// Helper to build a raw startup frame from key/value pairs.
fn startup_frame(params: &[(&str, &str)]) -> BytesMut {
    let msg = StartupMessage {
        version: PROTOCOL_VERSION_NUMBER,
        params: params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    };
    build_startup_message(&msg)
}

fn magic_frame(code: i32) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_i32(8);
    buf.put_i32(code);
    buf
}

#[test]
fn test_startup_roundtrip_preserves_order_and_bytes() {
    let original = startup_frame(&[
        ("user", "app_user.acme"),
        ("database", "db"),
        ("application_name", "psql"),
        ("client_encoding", "UTF8"),
    ]);

    let mut buf = original.clone();
    let parsed = match try_read_startup(&mut buf).unwrap().unwrap() {
        StartupPacket::Startup(msg) => msg,
        other => panic!("expected startup, got {other:?}"),
    };
    assert!(buf.is_empty());
    assert_eq!(parsed.get("user"), Some("app_user.acme"));
    assert_eq!(parsed.get("application_name"), Some("psql"));

    let rebuilt = build_startup_message(&parsed);
    assert_eq!(rebuilt.as_ref(), original.as_ref());
}

#[test]
fn test_startup_user_rewrite_preserves_other_params() {
    let original = startup_frame(&[("user", "app_user.acme"), ("database", "db")]);
    let mut buf = original;
    let mut parsed = match try_read_startup(&mut buf).unwrap().unwrap() {
        StartupPacket::Startup(msg) => msg,
        other => panic!("expected startup, got {other:?}"),
    };

    parsed.set_user("app_user");

    let mut rebuilt = build_startup_message(&parsed);
    let reparsed = match try_read_startup(&mut rebuilt).unwrap().unwrap() {
        StartupPacket::Startup(msg) => msg,
        other => panic!("expected startup, got {other:?}"),
    };
    assert_eq!(reparsed.get("user"), Some("app_user"));
    assert_eq!(reparsed.get("database"), Some("db"));
    assert_eq!(reparsed.params.len(), 2);
}

#[test]
fn test_startup_partial_frame_yields_none() {
    let frame = startup_frame(&[("user", "u"), ("database", "d")]);
    let mut buf = BytesMut::from(&frame[..frame.len() - 3]);
    assert!(try_read_startup(&mut buf).unwrap().is_none());
    // Remainder arrives.
    buf.extend_from_slice(&frame[frame.len() - 3..]);
    assert!(try_read_startup(&mut buf).unwrap().is_some());
}

#[test]
fn test_startup_magic_numbers() {
    let mut buf = magic_frame(SSL_REQUEST_CODE);
    assert!(matches!(
        try_read_startup(&mut buf).unwrap(),
        Some(StartupPacket::SslRequest)
    ));

    let mut buf = magic_frame(CANCEL_REQUEST_CODE);
    assert!(matches!(
        try_read_startup(&mut buf).unwrap(),
        Some(StartupPacket::CancelRequest)
    ));

    let mut buf = magic_frame(REQUEST_GSSENCMODE_CODE);
    assert!(matches!(
        try_read_startup(&mut buf).unwrap(),
        Some(StartupPacket::GssEncRequest)
    ));
}

#[test]
fn test_startup_garbage_length_is_fatal() {
    let mut buf = BytesMut::new();
    buf.put_i32(4); // below minimum
    buf.put_i32(PROTOCOL_VERSION_NUMBER);
    assert!(try_read_startup(&mut buf).is_err());

    let mut buf = BytesMut::new();
    buf.put_i32(1024 * 1024); // above sanity cap
    buf.put_i32(PROTOCOL_VERSION_NUMBER);
    assert!(try_read_startup(&mut buf).is_err());
}

#[test]
fn test_message_framer() {
    let mut buf = BytesMut::new();
    buf.put(ready_for_query(false));
    buf.put(simple_query("SELECT 1"));

    let first = try_read_message(&mut buf).unwrap().unwrap();
    assert!(first.is_ready_for_query());
    assert_eq!(first.payload[0], b'I');

    let second = try_read_message(&mut buf).unwrap().unwrap();
    assert_eq!(second.tag, b'Q');
    assert!(buf.is_empty());
}

#[test]
fn test_message_framer_partial() {
    let frame = simple_query("SELECT current_user");
    let mut buf = BytesMut::from(&frame[..4]);
    assert!(try_read_message(&mut buf).unwrap().is_none());
    buf.extend_from_slice(&frame[4..]);
    let msg = try_read_message(&mut buf).unwrap().unwrap();
    assert_eq!(msg.raw.as_ref(), frame.as_ref());
}

#[test]
fn test_message_framer_bad_length() {
    let mut buf = BytesMut::new();
    buf.put_u8(b'Q');
    buf.put_i32(2); // below minimum of 4
    assert!(try_read_message(&mut buf).is_err());
}

#[test]
fn test_auth_subtype_recognition() {
    let mut buf = auth_ok();
    let msg = try_read_message(&mut buf).unwrap().unwrap();
    assert!(msg.is_auth_ok());
    assert!(!msg.is_auth_challenge());
    assert_eq!(msg.auth_subtype(), Some(AUTHENTICATION_SUCCESSFUL));

    let mut buf = plain_password_challenge();
    let msg = try_read_message(&mut buf).unwrap().unwrap();
    assert!(msg.is_auth_challenge());
    assert_eq!(msg.auth_subtype(), Some(AUTHENTICATION_CLEAR_PASSWORD));

    // SASLFinal requires no client reply.
    let mut buf = BytesMut::new();
    buf.put_u8(b'R');
    buf.put_i32(8);
    buf.put_i32(SASL_FINAL);
    let msg = try_read_message(&mut buf).unwrap().unwrap();
    assert!(!msg.is_auth_challenge());
    assert!(!msg.is_auth_ok());
}

#[test]
fn test_error_message_fields() {
    let mut buf = error_message("something broke", "28000");
    let msg = try_read_message(&mut buf).unwrap().unwrap();
    assert!(msg.is_error_response());
    assert_eq!(msg.error_message(), "something broke");

    let payload = msg.payload.as_ref();
    // Field order: S, V, C, M, terminator.
    assert_eq!(payload[0], b'S');
    assert!(payload.windows(6).any(|w| w == b"FATAL\0"));
    assert!(payload.windows(7).any(|w| w == b"C28000\0"));
    assert_eq!(*payload.last().unwrap(), 0);
}

#[test]
fn test_error_message_with_detail() {
    let mut buf = error_message_detail("resolver failed", "28000", Some("no such account"));
    let msg = try_read_message(&mut buf).unwrap().unwrap();
    assert_eq!(msg.error_message(), "resolver failed: no such account");
}

#[test]
fn test_simple_query_layout() {
    let q = simple_query("SET ROLE \"app_user\";");
    assert_eq!(q[0], b'Q');
    let len = i32::from_be_bytes([q[1], q[2], q[3], q[4]]);
    assert_eq!(len as usize, q.len() - 1);
    assert_eq!(*q.last().unwrap(), 0);
}

#[test]
fn test_backend_key_data_layout() {
    let mut buf = backend_key_data(1234, 5678);
    let msg = try_read_message(&mut buf).unwrap().unwrap();
    assert!(msg.is_backend_key_data());
    assert_eq!(msg.payload.len(), 8);
    assert_eq!(
        i32::from_be_bytes([msg.payload[0], msg.payload[1], msg.payload[2], msg.payload[3]]),
        1234
    );
}

#[test]
fn test_escape_literal_accepts_identity_charset() {
    assert_eq!(escape_literal("acme").unwrap(), "'acme'");
    assert_eq!(
        escape_literal("00000000-0000-0000-0000-000000000000").unwrap(),
        "'00000000-0000-0000-0000-000000000000'"
    );
    assert_eq!(escape_literal("a.b_c-d").unwrap(), "'a.b_c-d'");
}

#[test]
fn test_escape_literal_rejects_injection_attempts() {
    assert!(escape_literal("acme'; DROP TABLE users; --").is_err());
    assert!(escape_literal("a b").is_err());
    assert!(escape_literal("").is_err());
    assert!(escape_literal("x;y").is_err());
}

#[test]
fn test_escape_set_value_doubles_quotes() {
    assert_eq!(escape_set_value("it's"), "'it''s'");
    assert_eq!(escape_set_value("{a,b,c}"), "'{a,b,c}'");
}

#[test]
fn test_quote_ident() {
    assert_eq!(quote_ident("app_user").unwrap(), "\"app_user\"");
    assert!(quote_ident("app.user").is_err());
    assert!(quote_ident("bad\"role").is_err());
    assert!(quote_ident("").is_err());
}

#[test]
fn test_check_session_var() {
    assert!(check_session_var("app.current_tenant_id").is_ok());
    assert!(check_session_var("work_mem").is_ok());
    assert!(check_session_var("app.a; DROP").is_err());
    assert!(check_session_var("").is_err());
}

#[test]
fn test_md5_hash_password_shape() {
    let hash = md5_hash_password("app_user", "secret", &[1, 2, 3, 4]);
    assert!(hash.starts_with(b"md5"));
    assert_eq!(hash.len(), 35);

    let again = md5_hash_password("app_user", "secret", &[1, 2, 3, 4]);
    assert_eq!(hash, again);

    let other_salt = md5_hash_password("app_user", "secret", &[5, 6, 7, 8]);
    assert_ne!(hash, other_salt);
}

#[test]
fn test_parse_row_description() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&2i16.to_be_bytes());
    payload.extend_from_slice(b"org_id\0");
    payload.extend_from_slice(&[0u8; 18]);
    payload.extend_from_slice(b"role\0");
    payload.extend_from_slice(&[0u8; 18]);
    assert_eq!(parse_row_description(&payload), vec!["org_id", "role"]);
}

#[test]
fn test_parse_data_row_with_null() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&2i16.to_be_bytes());
    payload.extend_from_slice(&5i32.to_be_bytes());
    payload.extend_from_slice(b"org-1");
    payload.extend_from_slice(&(-1i32).to_be_bytes());
    let columns = vec!["org_id".to_string(), "role".to_string()];
    let row = parse_data_row(&payload, &columns);
    assert_eq!(row[0], ("org_id".to_string(), Some("org-1".to_string())));
    assert_eq!(row[1], ("role".to_string(), None));
}
