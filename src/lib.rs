//! RPC and object-messaging middleware.
//!
//! Processes expose services discovered through a central service directory
//! and reached over TCP message sockets. This crate implements the connection
//! and routing plane: framed messages, message sockets, the transport socket
//! cache (a concurrent connection multiplexer) and the gateway router.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod gateway;
pub mod json;
pub mod message;
pub mod object;
pub mod promise;
pub mod service;
pub mod signal;
pub mod socket;
pub mod url;

pub use cache::{SharedSocket, SocketFuture, TransportSocketCache};
pub use config::{GatewayConfig, SessionConfig, DEFAULT_SERVICE_DIRECTORY};
pub use error::{BusError, Result};
pub use gateway::Gateway;
pub use message::{
    Message, MessageKind, DIRECTORY_FUNCTION_SERVICE, OBJECT_MAIN, SERVICE_DIRECTORY,
};
pub use service::{local_machine_id, ServiceInfo};
pub use signal::{Signal, SignalLink};
pub use socket::{
    MessageSocket, SocketFactory, SocketId, SocketState, TcpMessageSocket, TcpSocketFactory,
    TransportServer,
};
pub use url::Url;
