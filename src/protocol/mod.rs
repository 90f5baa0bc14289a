//! JSON-lines request service over stdin/stdout.

pub mod handler;
pub mod server;
pub mod transport;
pub mod types;

pub use handler::Dispatcher;
pub use server::GatewayService;
pub use transport::{LineTransport, StdioTransport, Transport};
pub use types::*;
