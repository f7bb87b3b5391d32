//! Packet model — addresses, flags, provenance signatures, and the wire codec.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{BusMessage, BusPayload};
use crate::error::NetError;

/// Default hop budget for a freshly built packet.
pub const DEFAULT_TTL: u8 = 16;

/// Well-known port numbers. Anonymous ports are allocated above
/// [`ports::ANON_BASE`].
pub mod ports {
    /// Packets sent here are dropped without a reply.
    pub const DISCARD: u16 = 1;
    /// Liveness probes.
    pub const PING: u16 = 2;
    /// Plain one-way messages.
    pub const MESSAGE: u16 = 3;
    /// Device descriptor queries.
    pub const INFO: u16 = 4;
    /// Remote shell sessions.
    pub const SHELL: u16 = 5;
    /// Remote standard I/O streams.
    pub const STDIO: u16 = 6;
    /// Encrypted remote login.
    pub const SSH: u16 = 7;
    /// Secure socket rendezvous.
    pub const SOCKET: u16 = 8;
    /// Shared fire-and-forget outbound port.
    pub const SEND: u16 = 9;
    /// Terminal attachment.
    pub const TERMINAL: u16 = 10;
    /// Application manager control.
    pub const APP_MANAGER: u16 = 11;

    /// First anonymous port number.
    pub const ANON_BASE: u16 = 1024;
}

// ── Addresses ───────────────────────────────────────────────────────────

const BROADCAST: &str = "broadcast";
const LOCAL: &str = "local";

/// A globally-unique overlay address for a device (switch or node).
///
/// Two reserved addresses exist: [`Address::broadcast`] (deliver to all
/// reachable devices) and [`Address::local`] (loopback to self). An address
/// is immutable for the lifetime of its owning device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    /// Generate a new random address (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The reserved broadcast address.
    pub fn broadcast() -> Self {
        Self(BROADCAST.to_string())
    }

    /// The reserved loopback address.
    pub fn local() -> Self {
        Self(LOCAL.to_string())
    }

    /// An empty address, used on packets before the interface stamps them.
    pub fn unset() -> Self {
        Self(String::new())
    }

    /// Create an Address from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the reserved broadcast address.
    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST
    }

    /// Whether this is the reserved loopback address.
    pub fn is_local(&self) -> bool {
        self.0 == LOCAL
    }

    /// Whether the address has not been assigned yet.
    pub fn is_unset(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Device descriptors ──────────────────────────────────────────────────

/// What kind of device owns an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// A datalink-layer switch.
    Switch,
    /// An addressable end node.
    Node,
}

/// Descriptor for a device, answered on the info port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// The device's overlay address.
    pub addr: Address,
    /// Human-readable name.
    pub name: String,
    /// Device kind.
    pub kind: DeviceKind,
    /// Software version string.
    pub version: String,
}

impl DeviceInfo {
    /// Create a descriptor with a fresh address.
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            addr: Address::generate(),
            name: name.into(),
            kind,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// ── Flags ───────────────────────────────────────────────────────────────

/// Boolean flag set carried by every packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketFlags {
    /// Liveness probe; switches and nodes answer with a timestamp.
    pub ping: bool,
    /// Request logging along the path.
    pub log: bool,
    /// The packet reports a delivery failure.
    pub error: bool,
    /// The packet crossed an address translation boundary.
    pub nat: bool,
    /// End of conversation; final packet in a multi-reply exchange.
    pub eoc: bool,
}

impl PacketFlags {
    /// No flags set.
    pub fn none() -> Self {
        Self::default()
    }

    /// Only the ping flag set.
    pub fn ping() -> Self {
        Self {
            ping: true,
            ..Self::default()
        }
    }

    /// Only the error flag set.
    pub fn error() -> Self {
        Self {
            error: true,
            ..Self::default()
        }
    }

    /// Only the end-of-conversation flag set.
    pub fn eoc() -> Self {
        Self {
            eoc: true,
            ..Self::default()
        }
    }
}

// ── Packets ─────────────────────────────────────────────────────────────

fn default_ttl() -> u8 {
    DEFAULT_TTL
}

/// The addressed, typed, flagged unit of transmission.
///
/// Packets are value objects: no component mutates a packet after handing
/// it to an outgoing link, except the per-hop ttl decrement and the
/// src/dest swap when synthesizing a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Payload, interpreted by the destination port's owner.
    pub data: Value,
    /// Source address; stamped by the sending interface.
    #[serde(default = "Address::unset")]
    pub src: Address,
    /// Destination address.
    pub dest: Address,
    /// Source port; stamped by the sending interface.
    #[serde(default)]
    pub sport: u16,
    /// Destination port.
    pub dport: u16,
    /// Hop budget, decremented once per switch traversal.
    #[serde(default = "default_ttl")]
    pub ttl: u8,
    /// Flag set.
    #[serde(default)]
    pub flags: PacketFlags,
}

impl Packet {
    /// Build a packet toward `dest:dport`. Source fields are left unset;
    /// the interface stamps them on the way out.
    pub fn new(data: Value, dest: Address, dport: u16) -> Self {
        Self {
            data,
            src: Address::unset(),
            dest,
            sport: 0,
            dport,
            ttl: DEFAULT_TTL,
            flags: PacketFlags::none(),
        }
    }

    /// Same as [`Packet::new`] with an explicit flag set.
    pub fn with_flags(data: Value, dest: Address, dport: u16, flags: PacketFlags) -> Self {
        Self {
            flags,
            ..Self::new(data, dest, dport)
        }
    }

    /// Synthesize a reply: src/dest and sport/dport swapped, fresh ttl.
    pub fn reply(&self, data: Value) -> Self {
        Self {
            data,
            src: self.dest.clone(),
            dest: self.src.clone(),
            sport: self.dport,
            dport: self.sport,
            ttl: DEFAULT_TTL,
            flags: PacketFlags::none(),
        }
    }

    /// Synthesize a delivery-failure reply carrying a reason string.
    pub fn error_reply(&self, reason: &str) -> Self {
        Self {
            flags: PacketFlags::error(),
            ..self.reply(Value::String(reason.to_string()))
        }
    }

    /// Whether this packet reports a delivery failure (ttl timeout,
    /// unreachable destination). Failures arrive as ordinary packets;
    /// this is the single discrimination point for callers.
    pub fn is_delivery_error(&self) -> bool {
        self.flags.error
    }
}

// ── Provenance signatures ───────────────────────────────────────────────

/// Which bus event a signature was recorded on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailEvent {
    /// The component consumed the message.
    Input,
    /// The component emitted the message.
    Output,
    /// A switch passed the message along.
    Forwarded,
}

/// One entry in a message's provenance trail.
///
/// Switches scan the trail of broadcast packets and refuse to re-flood a
/// broadcast already carrying their own address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    /// Name of the emitting component.
    pub by: String,
    /// Address of the emitting component.
    pub addr: Address,
    /// Free-form label (usually the link or port the message crossed).
    pub label: String,
    /// When the signature was recorded.
    pub at: DateTime<Utc>,
    /// The event the signature was recorded on.
    pub event: TrailEvent,
}

impl Signature {
    /// Record a signature for a device.
    pub fn new(info: &DeviceInfo, label: impl Into<String>, event: TrailEvent) -> Self {
        Self {
            by: info.name.clone(),
            addr: info.addr.clone(),
            label: label.into(),
            at: Utc::now(),
            event,
        }
    }
}

// ── Wire codec ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct WireFrameRef<'a> {
    data: &'a BusPayload,
    signatures: &'a [Signature],
}

#[derive(Deserialize)]
struct WireFrame {
    data: BusPayload,
    signatures: Vec<Signature>,
}

/// Serialize a bus message for transmission over a link.
///
/// Packet and control payloads are wrapped as JSON `{data, signatures}`.
/// Raw text payloads (secure-socket frames) pass through verbatim.
pub fn encode_wire(msg: &BusMessage) -> Result<String, NetError> {
    match &msg.payload {
        BusPayload::Text(s) => Ok(s.clone()),
        _ => Ok(serde_json::to_string(&WireFrameRef {
            data: &msg.payload,
            signatures: &msg.trail,
        })?),
    }
}

/// Parse a received link frame back into a bus message.
///
/// Text that does not parse as a wire frame is passed through as a raw
/// [`BusPayload::Text`] payload.
pub fn decode_wire(text: &str) -> BusMessage {
    match serde_json::from_str::<WireFrame>(text) {
        Ok(frame) => BusMessage {
            payload: frame.data,
            trail: frame.signatures,
        },
        Err(_) => BusMessage::text(text.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_reserved() {
        assert!(Address::broadcast().is_broadcast());
        assert!(Address::local().is_local());
        assert!(Address::unset().is_unset());
        assert!(!Address::generate().is_broadcast());
    }

    #[test]
    fn test_address_uniqueness() {
        let a = Address::generate();
        let b = Address::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_packet_defaults() {
        let p = Packet::new(
            serde_json::json!("hi"),
            Address::from_string("dest-addr"),
            ports::MESSAGE,
        );
        assert_eq!(p.ttl, DEFAULT_TTL);
        assert!(p.src.is_unset());
        assert_eq!(p.sport, 0);
        assert_eq!(p.flags, PacketFlags::none());
    }

    #[test]
    fn test_reply_swaps_endpoints() {
        let mut p = Packet::new(
            serde_json::json!(1),
            Address::from_string("there"),
            ports::PING,
        );
        p.src = Address::from_string("here");
        p.sport = 4242;

        let r = p.reply(serde_json::json!(2));
        assert_eq!(r.src, Address::from_string("there"));
        assert_eq!(r.dest, Address::from_string("here"));
        assert_eq!(r.sport, ports::PING);
        assert_eq!(r.dport, 4242);
        assert_eq!(r.ttl, DEFAULT_TTL);
    }

    #[test]
    fn test_error_reply_flags_and_reason() {
        let p = Packet::new(serde_json::json!({}), Address::from_string("x"), 3);
        let r = p.error_reply("ttl timeout");
        assert!(r.is_delivery_error());
        assert_eq!(r.data, serde_json::json!("ttl timeout"));
    }

    #[test]
    fn test_flag_constructors() {
        assert!(PacketFlags::ping().ping);
        assert!(!PacketFlags::ping().eoc);
        assert!(PacketFlags::eoc().eoc);
        assert!(PacketFlags::error().error);
    }

    #[test]
    fn test_packet_json_defaults_on_missing_fields() {
        // A minimal wire packet omits stamped/defaulted fields.
        let p: Packet =
            serde_json::from_str(r#"{"data": "x", "dest": "some-addr", "dport": 3}"#).unwrap();
        assert_eq!(p.ttl, DEFAULT_TTL);
        assert!(p.src.is_unset());
        assert!(!p.flags.ping);
    }

    #[test]
    fn test_wire_roundtrip_packet() {
        let info = DeviceInfo::new("sw-test", DeviceKind::Switch);
        let mut p = Packet::new(
            serde_json::json!({"k": [1, 2, 3]}),
            Address::from_string("dst"),
            ports::INFO,
        );
        p.src = Address::from_string("src");
        p.sport = 2048;
        p.ttl = 9;
        p.flags.eoc = true;

        let msg = BusMessage::packet(p.clone())
            .signed(&info, "link0", TrailEvent::Forwarded);

        let wire = encode_wire(&msg).unwrap();
        let parsed = decode_wire(&wire);

        match parsed.payload {
            BusPayload::Packet(q) => assert_eq!(q, p),
            other => panic!("Expected packet payload, got {other:?}"),
        }
        assert_eq!(parsed.trail.len(), 1);
        assert_eq!(parsed.trail[0].by, "sw-test");
        assert_eq!(parsed.trail[0].addr, info.addr);
        assert_eq!(parsed.trail[0].event, TrailEvent::Forwarded);
    }

    #[test]
    fn test_wire_text_passthrough() {
        let msg = BusMessage::text("handshake aGVsbG8=".to_string());
        let wire = encode_wire(&msg).unwrap();
        assert_eq!(wire, "handshake aGVsbG8=");

        let parsed = decode_wire(&wire);
        match parsed.payload {
            BusPayload::Text(s) => assert_eq!(s, "handshake aGVsbG8="),
            other => panic!("Expected text payload, got {other:?}"),
        }
    }

    #[test]
    fn test_device_info_roundtrip() {
        let info = DeviceInfo::new("node-1", DeviceKind::Node);
        let json = serde_json::to_string(&info).unwrap();
        let parsed: DeviceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
    }
}
