//! revdial: reverse-dial tunneling over a single outbound connection.
//!
//! A process behind NAT dials out once; the public side wraps that hijacked
//! connection in a [`Dialer`] which can then open arbitrarily many logical
//! connections back through it. Each [`Dialer::dial`] sends a `conn-ready`
//! line over the control connection; the NAT'd side's [`Listener`] reacts by
//! dialing a fresh pickup connection to the public side, where the
//! [`PickupHandler`] matches it back to the waiting caller.
//!
//! No payload bytes ever travel on the control connection and no multiplexing
//! is performed: every logical connection is its own picked-up stream.

pub mod conn;
pub mod dialer;
pub mod error;
pub mod http;
pub mod listener;
pub mod pickup;
pub mod proto;
pub mod registry;
pub mod ws;

// Re-export commonly used items at crate root.
pub use conn::{ByteStream, Conn};
pub use dialer::{Dialer, DialerConfig};
pub use error::{DialError, ListenerError, PickupError, ProtoError};
pub use listener::{Listener, ListenerConfig, PickupDial};
pub use pickup::{pickup_via, tcp_pickup_dial, PickupHandler};
pub use proto::ControlMessage;
pub use registry::DialerRegistry;
pub use ws::{ws_accept, ws_accept_with_target, ws_connect, ws_pickup_dial, WsStream};
