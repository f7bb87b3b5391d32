//! Network interface — multiplexes logical ports over one uplink.
//!
//! An [`Iface`] owns a table of numbered ports and one uplink bus, normally
//! connected to a [`Switch`](crate::switch::Switch) link. Inbound uplink
//! traffic is dispatched to the matching port; outbound port traffic is
//! stamped with the interface's identity and either looped back internally
//! (self/local destinations) or forwarded up to the switch.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::bus::{Bus, BusMessage, BusPayload, TapId};
use crate::error::NetError;
use crate::packet::{Address, DeviceInfo, DeviceKind, Packet, TrailEvent, ports};

struct IfaceInner {
    info: DeviceInfo,
    uplink: Bus,
    ports: Mutex<HashMap<u16, Bus>>,
    last_seen: Mutex<HashMap<Address, DateTime<Utc>>>,
    next_anon: Mutex<u16>,
}

/// A network interface owning a port table and an uplink.
#[derive(Clone)]
pub struct Iface {
    inner: Arc<IfaceInner>,
}

/// Handle to an open port. Cheap to clone; all clones refer to the same
/// logical port. The port stays open until [`Port::close`] (or
/// [`Iface::close`]) destroys its bus.
#[derive(Clone)]
pub struct Port {
    number: u16,
    bus: Bus,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port").field("number", &self.number).finish()
    }
}

impl Port {
    /// The port number.
    pub fn number(&self) -> u16 {
        self.number
    }

    /// The port's bus, for custom wiring.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Send a packet out through this port.
    pub fn send(&self, packet: Packet) {
        self.bus.output(BusMessage::packet(packet));
    }

    /// Subscribe to packets delivered to this port.
    pub fn on_packet(&self, handler: impl Fn(&Packet) + Send + Sync + 'static) -> TapId {
        self.bus.on_input(move |msg| {
            if let BusPayload::Packet(p) = &msg.payload {
                handler(p);
            }
        })
    }

    /// Close the port. The interface observes the destroy and releases the
    /// number; it is never handed out again by the anonymous allocator.
    pub fn close(&self) {
        self.bus.destroy();
    }
}

impl Iface {
    /// Create an interface with a fresh address.
    pub fn new(name: impl Into<String>) -> Self {
        let info = DeviceInfo::new(name, DeviceKind::Node);
        let uplink = Bus::new(format!("{}:uplink", info.name));
        let iface = Self {
            inner: Arc::new(IfaceInner {
                info,
                uplink: uplink.clone(),
                ports: Mutex::new(HashMap::new()),
                last_seen: Mutex::new(HashMap::new()),
                next_anon: Mutex::new(ports::ANON_BASE),
            }),
        };

        let weak = Arc::downgrade(&iface.inner);
        uplink.on_input(move |msg| {
            if let Some(inner) = weak.upgrade() {
                demux(&inner, msg);
            }
        });

        iface
    }

    /// The interface's overlay address.
    pub fn addr(&self) -> Address {
        self.inner.info.addr.clone()
    }

    /// The interface's device descriptor.
    pub fn info(&self) -> DeviceInfo {
        self.inner.info.clone()
    }

    /// The uplink bus, to be connected to a switch link.
    pub fn uplink(&self) -> Bus {
        self.inner.uplink.clone()
    }

    /// Number of currently open ports.
    pub fn open_count(&self) -> usize {
        self.inner.ports.lock().len()
    }

    /// When a packet from `addr` was last dispatched, if ever.
    pub fn last_seen(&self, addr: &Address) -> Option<DateTime<Utc>> {
        self.inner.last_seen.lock().get(addr).copied()
    }

    /// Open a port with a fixed number.
    pub fn open(&self, number: u16) -> Result<Port, NetError> {
        let mut table = self.inner.ports.lock();
        if table.contains_key(&number) {
            return Err(NetError::PortInUse(number));
        }

        let bus = Bus::new(format!("{}:port{number}", self.inner.info.name));
        table.insert(number, bus.clone());
        drop(table);

        let weak = Arc::downgrade(&self.inner);
        bus.on_output(move |msg| {
            if let Some(inner) = weak.upgrade() {
                mux(&inner, number, msg);
            }
        });

        // The port bus's destroy event is the single source of truth for
        // port lifecycle: closing the handle and closing via the interface
        // both funnel through here.
        let weak = Arc::downgrade(&self.inner);
        bus.on_disconnect(move || {
            if let Some(inner) = weak.upgrade() {
                if inner.ports.lock().remove(&number).is_some() {
                    trace!("{}: port {number} released", inner.info.name);
                }
            }
        });

        Ok(Port { number, bus })
    }

    /// Allocate the next anonymous port number. Numbers increase
    /// monotonically and are never reused, so a collision with a bound port
    /// or counter exhaustion is an error.
    pub fn anon_port_number(&self) -> Result<u16, NetError> {
        let mut counter = self.inner.next_anon.lock();
        let number = *counter;
        if number == u16::MAX {
            return Err(NetError::PortsExhausted);
        }
        *counter = number + 1;
        if self.inner.ports.lock().contains_key(&number) {
            return Err(NetError::PortCollision(number));
        }
        Ok(number)
    }

    /// Open a fresh anonymous port.
    pub fn open_anon(&self) -> Result<Port, NetError> {
        let number = self.anon_port_number()?;
        self.open(number)
    }

    /// Close a port by number.
    pub fn close(&self, number: u16) -> Result<(), NetError> {
        let bus = self
            .inner
            .ports
            .lock()
            .get(&number)
            .cloned()
            .ok_or(NetError::UnknownPort(number))?;
        bus.destroy();
        Ok(())
    }
}

/// Uplink input: dispatch to the destination port, or drop.
fn demux(inner: &Arc<IfaceInner>, msg: &BusMessage) {
    let Some(packet) = msg.as_packet() else {
        trace!("{}: ignoring non-packet uplink frame", inner.info.name);
        return;
    };

    let ours = packet.dest == inner.info.addr
        || packet.dest.is_local()
        || packet.dest.is_broadcast();
    if !ours {
        debug!(
            "{}: dropping packet for wrong destination {}",
            inner.info.name, packet.dest
        );
        return;
    }

    if !packet.src.is_unset() {
        inner
            .last_seen
            .lock()
            .insert(packet.src.clone(), Utc::now());
    }

    let Some(port_bus) = inner.ports.lock().get(&packet.dport).cloned() else {
        trace!("{}: no port {} open, dropping", inner.info.name, packet.dport);
        return;
    };

    let delivered = msg
        .clone()
        .signed(&inner.info, format!("port{}", packet.dport), TrailEvent::Input);
    port_bus.input(delivered);
}

/// Port output: stamp our identity, then loop back or forward upward.
fn mux(inner: &Arc<IfaceInner>, number: u16, msg: &BusMessage) {
    let mut out = msg.clone();
    let BusPayload::Packet(packet) = &mut out.payload else {
        trace!("{}: ignoring non-packet frame on port {number}", inner.info.name);
        return;
    };

    packet.src = inner.info.addr.clone();
    if packet.sport == 0 {
        packet.sport = number;
    }
    let internal = packet.dest == inner.info.addr || packet.dest.is_local();

    out.sign(&inner.info, format!("port{number}"), TrailEvent::Output);

    if internal {
        demux(inner, &out);
    } else {
        inner.uplink.output(out);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
