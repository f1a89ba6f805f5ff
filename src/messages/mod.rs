// Wire protocol framing, message builders and socket helpers.

pub mod constants;
pub mod protocol;
pub mod socket;

pub use constants::*;
pub use protocol::{
    auth_ok, backend_key_data, build_startup_message, check_session_var, error_message,
    error_message_detail, error_response_terminal, escape_literal, escape_set_value,
    md5_hash_password, parse_data_row, parse_row_description, password_message,
    plain_password_challenge, quote_ident, ready_for_query, sasl_initial_response,
    sasl_response, simple_query, ssl_request, try_read_message, try_read_startup, BackendMessage,
    StartupMessage, StartupPacket,
};
pub use socket::{configure_tcp_socket, write_all_flush};

#[cfg(test)]
mod protocol_tests;
