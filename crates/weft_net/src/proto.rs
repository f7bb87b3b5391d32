//! Request/reply protocol — conversations over interface ports.
//!
//! [`Messenger`] builds on [`Iface`] ports: fire-and-forget sends share one
//! well-known outbound port, request/response conversations allocate a fresh
//! anonymous port per call, and persistent listeners auto-synthesize replies
//! by swapping packet endpoints. No timeout is enforced at this layer;
//! callers compose their own by racing `tokio::time::timeout` against the
//! returned future.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::NetError;
use crate::iface::{Iface, Port};
use crate::packet::{Address, DeviceInfo, Packet, PacketFlags, ports};

/// Listener callback. Returning `Some(value)` sends an automatic reply with
/// source/destination swapped; `None` stays silent.
pub type ReplyFn = Arc<dyn Fn(&Packet) -> Option<Value> + Send + Sync>;

/// Request/reply protocol endpoint over one interface.
#[derive(Clone)]
pub struct Messenger {
    iface: Iface,
    send_port: Port,
}

impl Messenger {
    /// Create a messenger, binding the shared outbound port.
    pub fn new(iface: Iface) -> Result<Self, NetError> {
        let send_port = iface.open(ports::SEND)?;
        Ok(Self { iface, send_port })
    }

    /// The underlying interface.
    pub fn iface(&self) -> &Iface {
        &self.iface
    }

    /// Fire-and-forget send on the shared outbound port.
    pub fn send(&self, data: Value, dest: Address, dport: u16, flags: PacketFlags) {
        self.send_port
            .send(Packet::with_flags(data, dest, dport, flags));
    }

    /// Send one request from a fresh anonymous port and resolve on the first
    /// reply. The port is destroyed exactly once resolved.
    pub async fn request(
        &self,
        data: Value,
        dest: Address,
        dport: u16,
        flags: PacketFlags,
    ) -> Result<Packet, NetError> {
        let port = self.iface.open_anon()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        port.on_packet(move |p| {
            let _ = tx.send(p.clone());
        });
        port.send(Packet::with_flags(data, dest, dport, flags));

        let reply = rx.recv().await;
        port.close();
        reply.ok_or(NetError::PortClosed)
    }

    /// Like [`Messenger::request`], but accumulate replies until one arrives
    /// with the end-of-conversation flag, then resolve with the full ordered
    /// list.
    pub async fn request_all(
        &self,
        data: Value,
        dest: Address,
        dport: u16,
        flags: PacketFlags,
    ) -> Result<Vec<Packet>, NetError> {
        let port = self.iface.open_anon()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        port.on_packet(move |p| {
            let _ = tx.send(p.clone());
        });
        port.send(Packet::with_flags(data, dest, dport, flags));

        let mut replies = Vec::new();
        loop {
            match rx.recv().await {
                Some(p) => {
                    let done = p.flags.eoc;
                    replies.push(p);
                    if done {
                        break;
                    }
                }
                None => {
                    port.close();
                    return Err(NetError::PortClosed);
                }
            }
        }
        port.close();
        Ok(replies)
    }

    /// Open a persistent listener. If the callback returns a value, a reply
    /// packet with swapped endpoints is sent back automatically.
    pub fn listen(&self, number: u16, callback: ReplyFn) -> Result<Port, NetError> {
        let port = self.iface.open(number)?;
        let responder = port.clone();
        port.on_packet(move |p| {
            if let Some(data) = callback(p) {
                responder.send(p.reply(data));
            }
        });
        Ok(port)
    }

    /// Bind a listener and a sender closure to a fixed peer/port pair.
    /// With no `sport`, an anonymous port is used.
    pub fn open_connection(
        &self,
        dest: Address,
        dport: u16,
        callback: impl Fn(&Packet) + Send + Sync + 'static,
        sport: Option<u16>,
    ) -> Result<Connection, NetError> {
        let port = match sport {
            Some(n) => self.iface.open(n)?,
            None => self.iface.open_anon()?,
        };
        port.on_packet(callback);
        Ok(Connection { port, dest, dport })
    }
}

/// A bound sender/listener pair for a fixed peer and destination port.
pub struct Connection {
    port: Port,
    dest: Address,
    dport: u16,
}

impl Connection {
    /// Send data to the bound peer.
    pub fn send(&self, data: Value, flags: PacketFlags) {
        self.port
            .send(Packet::with_flags(data, self.dest.clone(), self.dport, flags));
    }

    /// The local port backing this connection.
    pub fn port(&self) -> &Port {
        &self.port
    }

    /// Close the local port.
    pub fn close(&self) {
        self.port.close();
    }
}

// ── Service factories ───────────────────────────────────────────────────

/// Answer ping-flagged packets with the current timestamp (millis).
pub fn ping_service() -> ReplyFn {
    Arc::new(|p| {
        p.flags
            .ping
            .then(|| Value::from(chrono::Utc::now().timestamp_millis()))
    })
}

/// Answer any query with this device's descriptor.
pub fn info_service(info: DeviceInfo) -> ReplyFn {
    Arc::new(move |_p| match serde_json::to_value(&info) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!("info service serialization failed: {e}");
            None
        }
    })
}

/// Echo the received data back to the sender.
pub fn echo_service() -> ReplyFn {
    Arc::new(|p| Some(p.data.clone()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitchConfig;
    use crate::switch::Switch;
    use serde_json::json;
    use std::time::Duration;

    /// Two interfaces attached to one switch, with messengers on both.
    fn two_node_net() -> (Messenger, Messenger) {
        let sw = Switch::new("sw", SwitchConfig::default());
        let if_a = Iface::new("if-a");
        let if_b = Iface::new("if-b");
        if_a.uplink().connect(&sw.add_link());
        if_b.uplink().connect(&sw.add_link());
        (
            Messenger::new(if_a).unwrap(),
            Messenger::new(if_b).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_send_fire_and_forget() {
        let (m1, m2) = two_node_net();
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let _listener = m2
            .listen(
                ports::MESSAGE,
                Arc::new(move |p| {
                    sink.lock().push(p.data.clone());
                    None
                }),
            )
            .unwrap();

        m1.send(
            json!("one-way"),
            m2.iface().addr(),
            ports::MESSAGE,
            PacketFlags::none(),
        );

        assert_eq!(received.lock().as_slice(), [json!("one-way")]);
    }

    #[tokio::test]
    async fn test_request_gets_echoed_reply() {
        let (m1, m2) = two_node_net();
        let _listener = m2.listen(ports::MESSAGE, echo_service()).unwrap();

        let reply = m1
            .request(
                json!({"ask": 42}),
                m2.iface().addr(),
                ports::MESSAGE,
                PacketFlags::none(),
            )
            .await
            .unwrap();

        assert_eq!(reply.data, json!({"ask": 42}));
        assert_eq!(reply.src, m2.iface().addr());
        // The anonymous request port is gone; only the shared SEND port
        // remains open.
        assert_eq!(m1.iface().open_count(), 1);
    }

    #[tokio::test]
    async fn test_request_all_collects_until_eoc() {
        let (m1, m2) = two_node_net();

        // Multi-reply listener: three replies, the third flagged eoc.
        let port = m2.iface().open(ports::MESSAGE).unwrap();
        let responder = port.clone();
        port.on_packet(move |p| {
            for i in 0..3 {
                let mut reply = p.reply(json!(i));
                if i == 2 {
                    reply.flags = PacketFlags::eoc();
                }
                responder.send(reply);
            }
        });

        let replies = m1
            .request_all(
                json!("gimme"),
                m2.iface().addr(),
                ports::MESSAGE,
                PacketFlags::none(),
            )
            .await
            .unwrap();

        assert_eq!(replies.len(), 3);
        let data: Vec<_> = replies.iter().map(|p| p.data.clone()).collect();
        assert_eq!(data, [json!(0), json!(1), json!(2)]);
        assert!(replies[2].flags.eoc);
    }

    #[tokio::test]
    async fn test_ping_service_answers_with_timestamp() {
        let (m1, m2) = two_node_net();
        let _listener = m2.listen(ports::PING, ping_service()).unwrap();

        let reply = m1
            .request(
                json!({}),
                m2.iface().addr(),
                ports::PING,
                PacketFlags::ping(),
            )
            .await
            .unwrap();
        assert!(reply.data.is_i64());

        // Non-ping packets to the ping port stay unanswered.
        let silent = tokio::time::timeout(
            Duration::from_millis(50),
            m1.request(json!({}), m2.iface().addr(), ports::PING, PacketFlags::none()),
        )
        .await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn test_info_service_returns_descriptor() {
        let (m1, m2) = two_node_net();
        let _listener = m2
            .listen(ports::INFO, info_service(m2.iface().info()))
            .unwrap();

        let reply = m1
            .request(
                json!({}),
                m2.iface().addr(),
                ports::INFO,
                PacketFlags::none(),
            )
            .await
            .unwrap();

        let info: DeviceInfo = serde_json::from_value(reply.data).unwrap();
        assert_eq!(info.addr, m2.iface().addr());
    }

    #[tokio::test]
    async fn test_delivery_error_arrives_as_error_packet() {
        let (m1, _m2) = two_node_net();

        // A hop budget of 1 expires at the switch, which answers with a
        // ttl-timeout reply instead of forwarding.
        let port = m1.iface().open_anon().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        port.on_packet(move |p| {
            let _ = tx.send(p.clone());
        });
        let mut p = Packet::new(json!("doomed"), Address::from_string("nowhere"), 7);
        p.ttl = 1;
        port.send(p);

        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_delivery_error());
        assert_eq!(reply.data, json!("ttl timeout"));
        port.close();
    }

    #[tokio::test]
    async fn test_open_connection_binds_peer() {
        let (m1, m2) = two_node_net();
        let _listener = m2.listen(ports::MESSAGE, echo_service()).unwrap();

        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let conn = m1
            .open_connection(
                m2.iface().addr(),
                ports::MESSAGE,
                move |p| sink.lock().push(p.data.clone()),
                None,
            )
            .unwrap();

        conn.send(json!("bound"), PacketFlags::none());
        assert_eq!(received.lock().as_slice(), [json!("bound")]);
        conn.close();
    }
}
