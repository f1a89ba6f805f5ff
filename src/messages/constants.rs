//! Protocol constants for the PostgreSQL v3 wire protocol.

/// Protocol version 3.0.
pub const PROTOCOL_VERSION_NUMBER: i32 = 196608; // 0x00030000

/// SSLRequest magic number.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// CancelRequest magic number.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// GSSENCRequest magic number.
pub const REQUEST_GSSENCMODE_CODE: i32 = 80877104;

/// Startup-phase frames have no type byte, so a corrupt stream cannot be
/// re-synchronized. Anything claiming to be larger than this is garbage.
pub const MAX_STARTUP_PACKET_SIZE: usize = 10240;

// Authentication message subtype codes ('R' payload first int32).
pub const AUTHENTICATION_SUCCESSFUL: i32 = 0;
pub const AUTHENTICATION_KERBEROS_V5: i32 = 2;
pub const AUTHENTICATION_CLEAR_PASSWORD: i32 = 3;
pub const MD5_ENCRYPTED_PASSWORD: i32 = 5;
pub const AUTHENTICATION_GSS: i32 = 7;
pub const SASL: i32 = 10;
pub const SASL_CONTINUE: i32 = 11;
pub const SASL_FINAL: i32 = 12;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

// Backend message tags.
pub const MESSAGE_AUTHENTICATION: u8 = b'R';
pub const MESSAGE_PARAMETER_STATUS: u8 = b'S';
pub const MESSAGE_BACKEND_KEY_DATA: u8 = b'K';
pub const MESSAGE_READY_FOR_QUERY: u8 = b'Z';
pub const MESSAGE_COMMAND_COMPLETE: u8 = b'C';
pub const MESSAGE_ERROR_RESPONSE: u8 = b'E';
pub const MESSAGE_NOTICE_RESPONSE: u8 = b'N';
pub const MESSAGE_ROW_DESCRIPTION: u8 = b'T';
pub const MESSAGE_DATA_ROW: u8 = b'D';
pub const MESSAGE_EMPTY_QUERY_RESPONSE: u8 = b'I';

// Frontend message tags.
pub const MESSAGE_TERMINATE: u8 = b'X';
pub const MESSAGE_PASSWORD: u8 = b'p';
