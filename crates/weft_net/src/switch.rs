//! Learning switch — the datalink layer of the overlay.
//!
//! A switch owns one bus per attached link. It learns which link reaches
//! which source address, answers liveness and info probes addressed to
//! itself, polices the ttl budget, and floods unknown or broadcast
//! destinations with loop suppression: a broadcast whose provenance trail
//! already carries this switch's address is never re-flooded. There is no
//! spanning tree; the trail scan and the ttl are the only backstops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use crate::bus::{Bus, BusMessage};
use crate::config::SwitchConfig;
use crate::packet::{Address, DeviceInfo, DeviceKind, Packet, TrailEvent, ports};

struct TableEntry {
    link: usize,
    last_seen: Instant,
}

struct SwitchInner {
    info: DeviceInfo,
    cfg: SwitchConfig,
    links: Mutex<Vec<Bus>>,
    table: Mutex<HashMap<Address, TableEntry>>,
}

/// A learning switch with a configurable number of attached links.
#[derive(Clone)]
pub struct Switch {
    inner: Arc<SwitchInner>,
}

impl Switch {
    /// Create a switch with a fresh address.
    pub fn new(name: impl Into<String>, cfg: SwitchConfig) -> Self {
        Self {
            inner: Arc::new(SwitchInner {
                info: DeviceInfo::new(name, DeviceKind::Switch),
                cfg,
                links: Mutex::new(Vec::new()),
                table: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The switch's overlay address.
    pub fn addr(&self) -> Address {
        self.inner.info.addr.clone()
    }

    /// The switch's device descriptor.
    pub fn info(&self) -> DeviceInfo {
        self.inner.info.clone()
    }

    /// Number of attached links.
    pub fn link_count(&self) -> usize {
        self.inner.links.lock().len()
    }

    /// Number of learned forwarding-table entries.
    pub fn learned_count(&self) -> usize {
        self.inner.table.lock().len()
    }

    /// Attach a new link and return its bus. The caller connects the peer's
    /// bus to the returned one (`peer_bus.connect(&link)`).
    pub fn add_link(&self) -> Bus {
        let mut links = self.inner.links.lock();
        let idx = links.len();
        let bus = Bus::new(format!("{}:link{idx}", self.inner.info.name));
        links.push(bus.clone());
        drop(links);

        let weak = Arc::downgrade(&self.inner);
        bus.on_input(move |msg| {
            if let Some(inner) = weak.upgrade() {
                receive(&inner, idx, msg);
            }
        });
        bus
    }
}

/// Per-packet forwarding, run synchronously on arrival at link `arrival`.
fn receive(inner: &Arc<SwitchInner>, arrival: usize, msg: &BusMessage) {
    let Some(packet) = msg.as_packet() else {
        debug!("{}: dropping non-packet frame on link{arrival}", inner.info.name);
        return;
    };

    // Self-origin guard.
    if packet.src == inner.info.addr {
        trace!("{}: dropping self-originated packet", inner.info.name);
        return;
    }

    // Learn: the packet's source is reachable via the arrival link.
    if !packet.src.is_unset() && !packet.src.is_broadcast() {
        inner.table.lock().insert(
            packet.src.clone(),
            TableEntry {
                link: arrival,
                last_seen: Instant::now(),
            },
        );
    }

    // Local consumption: addressed to this switch, unaddressed, or broadcast.
    let for_me =
        packet.dest == inner.info.addr || packet.dest.is_unset() || packet.dest.is_broadcast();
    if for_me {
        if packet.flags.ping {
            let ts = chrono::Utc::now().timestamp_millis();
            send_reply(inner, arrival, packet, Value::from(ts), false);
        }
        if packet.dport == ports::INFO {
            match serde_json::to_value(&inner.info) {
                Ok(descriptor) => send_reply(inner, arrival, packet, descriptor, false),
                Err(e) => debug!("{}: info descriptor serialization failed: {e}", inner.info.name),
            }
        }
        if !packet.dest.is_broadcast() {
            return;
        }
    }

    // TTL policing: one decrement per hop, timeout reply toward the source.
    let ttl = packet.ttl.saturating_sub(1);
    if ttl == 0 {
        if !packet.flags.error && !packet.dest.is_broadcast() {
            send_reply(inner, arrival, packet, Value::from("ttl timeout"), true);
        }
        trace!("{}: ttl exhausted for packet to {}", inner.info.name, packet.dest);
        return;
    }

    // Broadcast loop suppression: refuse to re-flood our own mark.
    if packet.dest.is_broadcast() && msg.trail.iter().any(|s| s.addr == inner.info.addr) {
        trace!("{}: suppressing broadcast loop", inner.info.name);
        return;
    }

    let mut forwarded = msg.clone();
    if let crate::bus::BusPayload::Packet(p) = &mut forwarded.payload {
        p.ttl = ttl;
    }
    forwarded.sign(&inner.info, format!("link{arrival}"), TrailEvent::Forwarded);

    let links = inner.links.lock().clone();

    // Unicast when a fresh table entry exists; otherwise flood.
    if !packet.dest.is_broadcast() {
        if let Some(out) = fresh_route(inner, &packet.dest) {
            links[out].output(forwarded);
            return;
        }
    }
    for (i, link) in links.iter().enumerate() {
        if i != arrival {
            link.output(forwarded.clone());
        }
    }
}

/// Look up a forwarding-table entry, treating stale entries as absent.
/// Expiry is soft: nothing sweeps the table.
fn fresh_route(inner: &Arc<SwitchInner>, dest: &Address) -> Option<usize> {
    let table = inner.table.lock();
    let entry = table.get(dest)?;
    if entry.last_seen.elapsed() > inner.cfg.entry_ttl {
        return None;
    }
    Some(entry.link)
}

/// Synthesize a reply toward the arrival link, sourced from this switch.
fn send_reply(inner: &Arc<SwitchInner>, arrival: usize, orig: &Packet, data: Value, error: bool) {
    let mut reply = if error {
        orig.error_reply(data.as_str().unwrap_or("delivery failure"))
    } else {
        orig.reply(data)
    };
    reply.src = inner.info.addr.clone();

    let msg = BusMessage::packet(reply).signed(
        &inner.info,
        format!("link{arrival}"),
        TrailEvent::Output,
    );
    let links = inner.links.lock().clone();
    if let Some(link) = links.get(arrival) {
        link.output(msg);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
