// Upstream-facing side: stream type, connection establishment, authentication.

pub mod authentication;
pub mod connect;
pub mod stream;

pub use authentication::authenticate_upstream;
pub use connect::{connect_upstream, read_upstream};
pub use stream::StreamInner;
