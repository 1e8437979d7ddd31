//! A bidirectional implementation of the `foxglove.websocket.v1` protocol:
//! a server session manager for streaming topic data to Foxglove-style
//! visualization clients, and a client engine for consuming such a
//! server. Implements <https://github.com/foxglove/ws-protocol>.
//!
//! # Example
//!
//! A server publishing a single topic:
//!
//! ```no_run
//! use foxglove_ws_protocol::capability::Capability;
//! use foxglove_ws_protocol::events::NullHandler;
//! use foxglove_ws_protocol::protocol::json::NewChannel;
//! use foxglove_ws_protocol::server::{FoxgloveServer, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = ServerOptions::new("example-server")
//!         .with_capabilities([Capability::Time]);
//!     let server = FoxgloveServer::new(options, NullHandler);
//!
//!     let channel = server
//!         .add_channel(NewChannel {
//!             topic: "/data".to_string(),
//!             encoding: "json".to_string(),
//!             schema_name: "Example".to_string(),
//!             schema: "{}".to_string(),
//!             schema_encoding: Some("jsonschema".to_string()),
//!         })
//!         .await;
//!
//!     tokio::spawn({
//!         let server = server.clone();
//!         async move { server.serve(([127, 0, 0, 1], 8765)).await }
//!     });
//!
//!     server
//!         .broadcast_message(channel.id, 0, br#"{"hello":"world"}"#)
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod capability;
pub mod client;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod subscriptions;

pub use capability::{Capability, CapabilitySet};
pub use client::ClientEngine;
pub use error::{ProtocolError, Result};
pub use events::{ClientEvent, NullHandler, ServerHandler};
pub use protocol::SUBPROTOCOL;
pub use server::{FoxgloveServer, ServerOptions};
pub use session::{SessionHandle, SessionId};
