pub mod args;
pub mod logger;
pub mod server;
pub mod tls;

pub use args::{parse, Args, LogFormat};
pub use logger::init_logging;
pub use server::run_server;
