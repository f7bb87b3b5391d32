//! Data bus — bidirectional, named event channel wiring overlay components.
//!
//! A [`Bus`] carries two directed events, *input* and *output*, plus a
//! *disconnect* notification. Components subscribe typed taps and wire
//! buses together with two primitives:
//!
//! - [`Bus::connect`] — symmetric peer linkage: what one side outputs, the
//!   other receives as input, and vice versa. Used to link peers.
//! - [`Bus::passthrough`] — directional splice: an outer-facing bus delegates
//!   incoming traffic into an inner bus and relays the inner bus's outgoing
//!   traffic back outward. Used to layer encode/decode or protocol
//!   translation between a component and the rest of the graph.
//!
//! Delivery runs through a thread-local FIFO work queue drained at the
//! outermost emission, so a pathological fan-out grows the queue instead of
//! the stack while preserving per-message processing order.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::packet::{DeviceInfo, Packet, Signature, TrailEvent};

/// Non-data control messages carried by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMsg {
    /// The underlying transport link went down.
    LinkDown {
        /// Human-readable reason.
        reason: String,
    },
}

/// Closed set of payloads a bus can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum BusPayload {
    /// An overlay packet.
    Packet(Packet),
    /// A control message.
    Control(ControlMsg),
    /// A raw text frame (secure-socket traffic).
    Text(String),
}

/// A payload plus its provenance trail.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// The carried payload.
    pub payload: BusPayload,
    /// Ordered provenance signatures appended along the way.
    pub trail: Vec<Signature>,
}

impl BusMessage {
    /// Wrap a packet with an empty trail.
    pub fn packet(packet: Packet) -> Self {
        Self {
            payload: BusPayload::Packet(packet),
            trail: Vec::new(),
        }
    }

    /// Wrap a raw text frame with an empty trail.
    pub fn text(text: String) -> Self {
        Self {
            payload: BusPayload::Text(text),
            trail: Vec::new(),
        }
    }

    /// Wrap a control message with an empty trail.
    pub fn control(msg: ControlMsg) -> Self {
        Self {
            payload: BusPayload::Control(msg),
            trail: Vec::new(),
        }
    }

    /// Borrow the payload as a packet, if it is one.
    pub fn as_packet(&self) -> Option<&Packet> {
        match &self.payload {
            BusPayload::Packet(p) => Some(p),
            _ => None,
        }
    }

    /// Append a provenance signature in place.
    pub fn sign(&mut self, info: &DeviceInfo, label: impl Into<String>, event: TrailEvent) {
        self.trail.push(Signature::new(info, label, event));
    }

    /// Append a provenance signature, builder style.
    pub fn signed(mut self, info: &DeviceInfo, label: impl Into<String>, event: TrailEvent) -> Self {
        self.sign(info, label, event);
        self
    }
}

/// Identifier for a registered tap, used to remove it later.
pub type TapId = u64;

/// Subscriber invoked for each input or output message.
pub type MsgHandler = Arc<dyn Fn(&BusMessage) + Send + Sync>;

/// Subscriber invoked when the bus is unwired or destroyed.
pub type DropHandler = Arc<dyn Fn() + Send + Sync>;

/// Mapping function for [`Bus::transformer`]. Returning `None` is the
/// stop-propagation sentinel: the message is swallowed.
pub type MapFn = Arc<dyn Fn(BusMessage) -> Option<BusMessage> + Send + Sync>;

// ── Dispatch queue ──────────────────────────────────────────────────────

thread_local! {
    static QUEUE: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

/// Enqueue a delivery job. The outermost caller drains the queue to empty,
/// so nested emissions run in FIFO order on a bounded stack.
fn dispatch(job: Box<dyn FnOnce()>) {
    QUEUE.with(|q| q.borrow_mut().push_back(job));
    if DRAINING.with(Cell::get) {
        return;
    }
    DRAINING.with(|d| d.set(true));
    loop {
        let next = QUEUE.with(|q| q.borrow_mut().pop_front());
        match next {
            Some(job) => job(),
            None => break,
        }
    }
    DRAINING.with(|d| d.set(false));
}

// ── Bus ─────────────────────────────────────────────────────────────────

struct BusState {
    destroyed: bool,
    next_tap: TapId,
    input_taps: Vec<(TapId, MsgHandler)>,
    output_taps: Vec<(TapId, MsgHandler)>,
    disconnect_taps: Vec<(TapId, DropHandler)>,
    /// Symmetric peers (connect): my output becomes their input.
    peers: Vec<Weak<BusInner>>,
    /// Splice inners (passthrough): my input is delegated to them.
    inners: Vec<Weak<BusInner>>,
    /// Splice outers: my output is relayed out through them.
    outers: Vec<Weak<BusInner>>,
}

struct BusInner {
    name: String,
    state: Mutex<BusState>,
}

/// A bidirectional, named event channel. Cheap to clone; clones share the
/// same wiring.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Create a fresh, unwired bus.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                name: name.into(),
                state: Mutex::new(BusState {
                    destroyed: false,
                    next_tap: 1,
                    input_taps: Vec::new(),
                    output_taps: Vec::new(),
                    disconnect_taps: Vec::new(),
                    peers: Vec::new(),
                    inners: Vec::new(),
                    outers: Vec::new(),
                }),
            }),
        }
    }

    /// The bus name, used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the bus has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    fn from_inner(inner: Arc<BusInner>) -> Self {
        Self { inner }
    }

    // ── Taps ────────────────────────────────────────────────────────────

    /// Subscribe to incoming messages.
    pub fn on_input(&self, handler: impl Fn(&BusMessage) + Send + Sync + 'static) -> TapId {
        let mut st = self.inner.state.lock();
        let id = st.next_tap;
        st.next_tap += 1;
        st.input_taps.push((id, Arc::new(handler)));
        id
    }

    /// Subscribe to outgoing messages.
    pub fn on_output(&self, handler: impl Fn(&BusMessage) + Send + Sync + 'static) -> TapId {
        let mut st = self.inner.state.lock();
        let id = st.next_tap;
        st.next_tap += 1;
        st.output_taps.push((id, Arc::new(handler)));
        id
    }

    /// Subscribe to disconnect notifications (unwire or destroy).
    pub fn on_disconnect(&self, handler: impl Fn() + Send + Sync + 'static) -> TapId {
        let mut st = self.inner.state.lock();
        let id = st.next_tap;
        st.next_tap += 1;
        st.disconnect_taps.push((id, Arc::new(handler)));
        id
    }

    /// Remove a previously registered tap.
    pub fn remove_tap(&self, id: TapId) {
        let mut st = self.inner.state.lock();
        st.input_taps.retain(|(t, _)| *t != id);
        st.output_taps.retain(|(t, _)| *t != id);
        st.disconnect_taps.retain(|(t, _)| *t != id);
    }

    // ── Emission ────────────────────────────────────────────────────────

    /// Feed a message into the bus. Input taps run, then the message is
    /// delegated to spliced inner buses. Ignored after destroy.
    pub fn input(&self, msg: BusMessage) {
        let inner = Arc::clone(&self.inner);
        dispatch(Box::new(move || deliver_input(&inner, &msg)));
    }

    /// Emit a message from the bus. Output taps run, connected peers receive
    /// the message as input, and splice outers relay it outward. Ignored
    /// after destroy.
    pub fn output(&self, msg: BusMessage) {
        let inner = Arc::clone(&self.inner);
        dispatch(Box::new(move || deliver_output(&inner, &msg)));
    }

    // ── Wiring ──────────────────────────────────────────────────────────

    /// Symmetrically link two buses: each side's output becomes the other's
    /// input. Idempotent; linking a bus to itself is a no-op.
    pub fn connect(&self, other: &Bus) {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return;
        }
        if self.is_destroyed() || other.is_destroyed() {
            return;
        }
        add_weak(&self.inner, &other.inner, ListKind::Peers);
        add_weak(&other.inner, &self.inner, ListKind::Peers);
        trace!("bus connect: {} <-> {}", self.name(), other.name());
    }

    /// Remove a peer linkage. Both halves are unwired and both sides get a
    /// disconnect notification.
    pub fn disconnect(&self, other: &Bus) {
        let a = remove_weak(&self.inner, &other.inner, ListKind::Peers);
        let b = remove_weak(&other.inner, &self.inner, ListKind::Peers);
        if a || b {
            fire_disconnect(&self.inner);
            fire_disconnect(&other.inner);
        }
    }

    /// Splice an inner bus behind this one: this bus's input is delegated to
    /// the inner bus, and the inner bus's output is relayed back out through
    /// this one. Idempotent.
    pub fn passthrough(&self, inner: &Bus) {
        if Arc::ptr_eq(&self.inner, &inner.inner) {
            return;
        }
        if self.is_destroyed() || inner.is_destroyed() {
            return;
        }
        add_weak(&self.inner, &inner.inner, ListKind::Inners);
        add_weak(&inner.inner, &self.inner, ListKind::Outers);
        trace!("bus passthrough: {} -> {}", self.name(), inner.name());
    }

    /// Remove a passthrough splice. Both halves are unwired and both sides
    /// get a disconnect notification.
    pub fn un_passthrough(&self, inner: &Bus) {
        let a = remove_weak(&self.inner, &inner.inner, ListKind::Inners);
        let b = remove_weak(&inner.inner, &self.inner, ListKind::Outers);
        if a || b {
            fire_disconnect(&self.inner);
            fire_disconnect(&inner.inner);
        }
    }

    /// Tear down all wiring and mark the bus inert. Every linked or spliced
    /// bus gets a disconnect notification, as does this one; subsequent
    /// input/output calls are silently ignored.
    pub fn destroy(&self) {
        let (peers, inners, outers) = {
            let mut st = self.inner.state.lock();
            if st.destroyed {
                return;
            }
            st.destroyed = true;
            (
                std::mem::take(&mut st.peers),
                std::mem::take(&mut st.inners),
                std::mem::take(&mut st.outers),
            )
        };

        for w in peers {
            if let Some(p) = w.upgrade() {
                remove_weak(&p, &self.inner, ListKind::Peers);
                fire_disconnect(&p);
            }
        }
        for w in inners {
            if let Some(i) = w.upgrade() {
                remove_weak(&i, &self.inner, ListKind::Outers);
                fire_disconnect(&i);
            }
        }
        for w in outers {
            if let Some(o) = w.upgrade() {
                remove_weak(&o, &self.inner, ListKind::Inners);
                fire_disconnect(&o);
            }
        }

        fire_disconnect(&self.inner);

        let mut st = self.inner.state.lock();
        st.input_taps.clear();
        st.output_taps.clear();
        st.disconnect_taps.clear();
        trace!("bus destroyed: {}", self.name());
    }

    /// Compose an inner bus with override-able input/output mapping. The
    /// returned outer bus forwards its input through `map_in` into the inner
    /// bus and relays the inner bus's output through `map_out`; either map
    /// returning `None` suppresses forwarding.
    pub fn transformer(name: impl Into<String>, inner: &Bus, map_in: MapFn, map_out: MapFn) -> Bus {
        let outer = Bus::new(name);

        let inner_side = inner.clone();
        outer.on_input(move |msg| {
            if let Some(mapped) = map_in(msg.clone()) {
                inner_side.input(mapped);
            }
        });

        let outer_weak = Arc::downgrade(&outer.inner);
        inner.on_output(move |msg| {
            if let Some(mapped) = map_out(msg.clone()) {
                if let Some(o) = outer_weak.upgrade() {
                    Bus::from_inner(o).output(mapped);
                }
            }
        });

        outer
    }
}

// ── Delivery ────────────────────────────────────────────────────────────

fn deliver_input(inner: &Arc<BusInner>, msg: &BusMessage) {
    let (taps, inners) = {
        let st = inner.state.lock();
        if st.destroyed {
            return;
        }
        (
            st.input_taps.iter().map(|(_, h)| Arc::clone(h)).collect::<Vec<_>>(),
            st.inners.clone(),
        )
    };
    for tap in taps {
        tap(msg);
    }
    for w in inners {
        if let Some(i) = w.upgrade() {
            Bus::from_inner(i).input(msg.clone());
        }
    }
}

fn deliver_output(inner: &Arc<BusInner>, msg: &BusMessage) {
    let (taps, peers, outers) = {
        let st = inner.state.lock();
        if st.destroyed {
            return;
        }
        (
            st.output_taps.iter().map(|(_, h)| Arc::clone(h)).collect::<Vec<_>>(),
            st.peers.clone(),
            st.outers.clone(),
        )
    };
    for tap in taps {
        tap(msg);
    }
    for w in peers {
        if let Some(p) = w.upgrade() {
            Bus::from_inner(p).input(msg.clone());
        }
    }
    for w in outers {
        if let Some(o) = w.upgrade() {
            Bus::from_inner(o).output(msg.clone());
        }
    }
}

// ── Wiring bookkeeping ──────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum ListKind {
    Peers,
    Inners,
    Outers,
}

fn list_of<'a>(st: &'a mut BusState, kind: ListKind) -> &'a mut Vec<Weak<BusInner>> {
    match kind {
        ListKind::Peers => &mut st.peers,
        ListKind::Inners => &mut st.inners,
        ListKind::Outers => &mut st.outers,
    }
}

fn add_weak(on: &Arc<BusInner>, target: &Arc<BusInner>, kind: ListKind) {
    let mut st = on.state.lock();
    let list = list_of(&mut st, kind);
    let already = list
        .iter()
        .any(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(target)));
    if !already {
        list.push(Arc::downgrade(target));
    }
}

fn remove_weak(on: &Arc<BusInner>, target: &Arc<BusInner>, kind: ListKind) -> bool {
    let mut st = on.state.lock();
    let list = list_of(&mut st, kind);
    let before = list.len();
    list.retain(|w| !std::ptr::eq(w.as_ptr(), Arc::as_ptr(target)));
    before != list.len()
}

fn fire_disconnect(inner: &Arc<BusInner>) {
    let taps = inner
        .state
        .lock()
        .disconnect_taps
        .iter()
        .map(|(_, h)| Arc::clone(h))
        .collect::<Vec<_>>();
    for tap in taps {
        dispatch(Box::new(move || tap()));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (Arc<Mutex<Vec<String>>>, impl Fn(&BusMessage) + Send + Sync + Clone) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tap = move |msg: &BusMessage| {
            if let BusPayload::Text(s) = &msg.payload {
                sink.lock().push(s.clone());
            }
        };
        (seen, tap)
    }

    #[test]
    fn test_connect_is_symmetric() {
        let a = Bus::new("a");
        let b = Bus::new("b");
        let (seen_a, tap_a) = collector();
        let (seen_b, tap_b) = collector();
        a.on_input(tap_a);
        b.on_input(tap_b);

        a.connect(&b);
        a.output(BusMessage::text("from-a".into()));
        b.output(BusMessage::text("from-b".into()));

        assert_eq!(seen_b.lock().as_slice(), ["from-a"]);
        assert_eq!(seen_a.lock().as_slice(), ["from-b"]);
    }

    #[test]
    fn test_connect_is_idempotent() {
        let a = Bus::new("a");
        let b = Bus::new("b");
        let (seen_b, tap_b) = collector();
        b.on_input(tap_b);

        a.connect(&b);
        a.connect(&b);
        b.connect(&a);
        a.output(BusMessage::text("once".into()));

        assert_eq!(seen_b.lock().len(), 1);
    }

    #[test]
    fn test_self_connect_is_noop() {
        let a = Bus::new("a");
        let (seen, tap) = collector();
        a.on_input(tap);

        a.connect(&a);
        a.output(BusMessage::text("loop".into()));

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_disconnect_unwires_and_notifies_both_sides() {
        let a = Bus::new("a");
        let b = Bus::new("b");
        let (seen_b, tap_b) = collector();
        b.on_input(tap_b);

        let notified = Arc::new(Mutex::new(0u32));
        for bus in [&a, &b] {
            let n = Arc::clone(&notified);
            bus.on_disconnect(move || *n.lock() += 1);
        }

        a.connect(&b);
        a.disconnect(&b);
        a.output(BusMessage::text("after".into()));

        assert!(seen_b.lock().is_empty());
        assert_eq!(*notified.lock(), 2);
    }

    #[test]
    fn test_passthrough_splices_layers() {
        // outer delegates its input into inner; inner's output goes back
        // out through outer to outer's peer.
        let outer = Bus::new("outer");
        let inner = Bus::new("inner");
        let peer = Bus::new("peer");

        outer.passthrough(&inner);
        peer.connect(&outer);

        let (inner_seen, inner_tap) = collector();
        inner.on_input(inner_tap);
        let (peer_seen, peer_tap) = collector();
        peer.on_input(peer_tap);

        peer.output(BusMessage::text("down".into()));
        assert_eq!(inner_seen.lock().as_slice(), ["down"]);

        inner.output(BusMessage::text("up".into()));
        assert_eq!(peer_seen.lock().as_slice(), ["up"]);
    }

    #[test]
    fn test_transformer_maps_and_suppresses() {
        let inner = Bus::new("inner");
        let outer = Bus::transformer(
            "xform",
            &inner,
            Arc::new(|msg| match &msg.payload {
                BusPayload::Text(s) if s == "drop-me" => None,
                BusPayload::Text(s) => Some(BusMessage::text(format!("in:{s}"))),
                _ => Some(msg),
            }),
            Arc::new(|msg| match &msg.payload {
                BusPayload::Text(s) => Some(BusMessage::text(format!("out:{s}"))),
                _ => Some(msg),
            }),
        );

        let (inner_seen, inner_tap) = collector();
        inner.on_input(inner_tap);

        let peer = Bus::new("peer");
        peer.connect(&outer);
        let (peer_seen, peer_tap) = collector();
        peer.on_input(peer_tap);

        peer.output(BusMessage::text("hello".into()));
        peer.output(BusMessage::text("drop-me".into()));
        assert_eq!(inner_seen.lock().as_slice(), ["in:hello"]);

        inner.output(BusMessage::text("reply".into()));
        assert_eq!(peer_seen.lock().as_slice(), ["out:reply"]);
    }

    #[test]
    fn test_destroy_marks_inert_and_notifies_peers() {
        let a = Bus::new("a");
        let b = Bus::new("b");
        a.connect(&b);

        let notified = Arc::new(Mutex::new(0u32));
        let n = Arc::clone(&notified);
        b.on_disconnect(move || *n.lock() += 1);

        let (seen_b, tap_b) = collector();
        b.on_input(tap_b);

        a.destroy();
        assert!(a.is_destroyed());
        assert_eq!(*notified.lock(), 1);

        // Further traffic through the destroyed bus is silently dropped.
        a.output(BusMessage::text("ghost".into()));
        assert!(seen_b.lock().is_empty());

        // Destroy is idempotent.
        a.destroy();
        assert_eq!(*notified.lock(), 1);
    }

    #[test]
    fn test_remove_tap() {
        let a = Bus::new("a");
        let (seen, tap) = collector();
        let id = a.on_input(tap);

        a.input(BusMessage::text("one".into()));
        a.remove_tap(id);
        a.input(BusMessage::text("two".into()));

        assert_eq!(seen.lock().as_slice(), ["one"]);
    }

    #[test]
    fn test_nested_emission_runs_in_fifo_order() {
        // A tap that re-emits must not starve or reorder the original
        // delivery; the queue drains breadth-first.
        let a = Bus::new("a");
        let b = Bus::new("b");
        a.connect(&b);

        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        let b2 = b.clone();
        b.on_input(move |msg| {
            if let BusPayload::Text(s) = &msg.payload {
                o.lock().push(s.clone());
                if s == "first" {
                    b2.output(BusMessage::text("echo".into()));
                }
            }
        });
        let o2 = Arc::clone(&order);
        a.on_input(move |msg| {
            if let BusPayload::Text(s) = &msg.payload {
                o2.lock().push(format!("a:{s}"));
            }
        });

        a.output(BusMessage::text("first".into()));
        assert_eq!(order.lock().as_slice(), ["first", "a:echo"]);
    }
}
