//! TCP over WebSocket tunneling.
//!
//! A [`LocalProxy`] accepts plain TCP connections on mapped ports and
//! multiplexes them over one encrypted WebSocket session. A [`RemoteServer`]
//! accepts those sessions and relays every client stream to its TCP target.

pub mod config;
pub mod error;
pub mod handshake;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod status;
pub mod transport;

pub use config::{BufferConfig, ConfigError, LocalConfig, PortMapping, RemoteConfig};
pub use error::{Error, Result};
pub use relay::local::LocalProxy;
pub use relay::remote::RemoteSession;
pub use server::RemoteServer;
pub use status::{StatusEvent, StatusReporter, TracingReporter};
