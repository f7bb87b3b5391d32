//! Weft — a private overlay network stack.
//!
//! Addressable devices exchange typed packets across a software-defined
//! topology of switches and point-to-point links, multiplex many logical
//! conversations over ports, and establish mutually-authenticated encrypted
//! sessions over unreliable text-frame transports (e.g. WebSocket).
//!
//! # Architecture
//!
//! - **Bus**: bidirectional named event channel; symmetric *connect* links
//!   peers, directional *passthrough* splices layers.
//! - **Switch**: learns source addresses per link, answers liveness/info
//!   probes, floods unknown/broadcast destinations with signature-trail loop
//!   suppression.
//! - **Interface**: port table over one uplink; explicit and anonymous port
//!   allocation.
//! - **Messenger**: fire-and-forget sends, request/response with multi-reply
//!   collection, auto-replying listeners.
//! - **SecureSocket**: challenge/response handshake (via a generic state
//!   machine and handshake framework) deriving a session key, then
//!   padded AEAD/CTR-HMAC framing with keepalive supervision.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use weft_net::packet::{PacketFlags, ports};
//! use weft_net::proto::echo_service;
//! use weft_net::{Iface, Messenger, Switch, SwitchConfig};
//!
//! # async fn example() {
//! let switch = Switch::new("sw", SwitchConfig::default());
//! let a = Iface::new("node-a");
//! let b = Iface::new("node-b");
//! a.uplink().connect(&switch.add_link());
//! b.uplink().connect(&switch.add_link());
//!
//! let ma = Messenger::new(a).unwrap();
//! let mb = Messenger::new(b).unwrap();
//! let _echo = mb.listen(ports::MESSAGE, echo_service()).unwrap();
//!
//! let reply = ma
//!     .request(json!("hello"), mb.iface().addr(), ports::MESSAGE, PacketFlags::none())
//!     .await
//!     .unwrap();
//! assert_eq!(reply.data, json!("hello"));
//! # }
//! ```

pub mod bus;
pub mod cipher;
pub mod config;
pub mod error;
pub mod fsm;
pub mod handshake;
pub mod iface;
pub mod link;
pub mod logging;
pub mod packet;
pub mod proto;
pub mod socket;
pub mod switch;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use bus::{Bus, BusMessage, BusPayload, ControlMsg};
pub use cipher::CipherMode;
pub use config::{SocketConfig, SwitchConfig};
pub use error::NetError;
pub use fsm::{Flow, FsmError, FsmEvent, StateMachine};
pub use handshake::{Handshake, HandshakeStatus};
pub use iface::{Iface, Port};
pub use packet::{Address, DeviceInfo, DeviceKind, Packet, PacketFlags, Signature};
pub use proto::Messenger;
pub use socket::{DisconnectReason, SecureSocket, SocketEvent};
pub use switch::Switch;
