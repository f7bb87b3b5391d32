//! WebSocket links — carrying a bus over a WebSocket connection.
//!
//! Each connection yields one [`Bus`] standing in for the remote device:
//! connect a local component's bus to it and traffic flows through the
//! socket. Text frames are serialized with the packet wire format; raw
//! strings (secure-socket frames) pass through verbatim. The read half runs
//! in a spawned task that forwards frames into the bus; transport failures
//! surface as a [`ControlMsg::LinkDown`] followed by bus destruction.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, BusMessage, ControlMsg};
use crate::error::NetError;
use crate::packet::{decode_wire, encode_wire};

/// Wire a WebSocket's halves to a fresh bus.
///
/// The bus stands in for the remote peer: local traffic arriving as bus
/// *input* is sent over the socket, and received frames are emitted as bus
/// *output* so connected local buses receive them.
fn bridge_streams<S, R>(label: String, mut sink: S, mut stream: R) -> Bus
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
{
    let bus = Bus::new(format!("wslink:{label}"));

    // Outbound: local peers write into the link; a writer task owns the sink.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let encode_label = label.clone();
    bus.on_input(move |msg| match encode_wire(msg) {
        Ok(text) => {
            let _ = out_tx.send(text);
        }
        Err(e) => warn!("wslink {encode_label}: cannot encode outbound frame: {e}"),
    });

    let writer_bus = bus.clone();
    let writer_label = label.clone();
    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!("wslink {writer_label}: send error: {e}");
                writer_bus.output(BusMessage::control(ControlMsg::LinkDown {
                    reason: e.to_string(),
                }));
                writer_bus.destroy();
                break;
            }
        }
    });

    // Local destroy stops the reader, so both halves drop and the TCP
    // connection closes for the remote side too.
    let closed = Arc::new(Notify::new());
    let closed_tap = Arc::clone(&closed);
    let tap_bus = bus.clone();
    bus.on_disconnect(move || {
        if tap_bus.is_destroyed() {
            closed_tap.notify_one();
        }
    });

    // Inbound: received frames become bus output for connected local buses.
    let reader_bus = bus.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => reader_bus.output(decode_wire(&text)),
                    Some(Ok(Message::Close(_))) => {
                        debug!("wslink {label}: peer sent close");
                        break;
                    }
                    Some(Ok(_)) => {} // Ignore binary/ping/pong frames.
                    Some(Err(e)) => {
                        debug!("wslink {label}: read error: {e}");
                        reader_bus.output(BusMessage::control(ControlMsg::LinkDown {
                            reason: e.to_string(),
                        }));
                        break;
                    }
                    None => break,
                },
                _ = closed.notified() => {
                    debug!("wslink {label}: closed locally");
                    break;
                }
            }
        }
        reader_bus.destroy();
    });

    bus
}

/// Start a WebSocket link server.
///
/// Binds immediately and returns the bound address; accepted connections are
/// bridged to buses and handed to `link_tx`. The accept loop runs until the
/// shutdown channel fires.
pub async fn serve_links(
    addr: SocketAddr,
    link_tx: mpsc::Sender<(SocketAddr, Bus)>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<SocketAddr, NetError> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!("link server listening on {local}");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let link_tx = link_tx.clone();
                            tokio::spawn(async move {
                                match accept_async(stream).await {
                                    Ok(ws) => {
                                        let (sink, stream) = ws.split();
                                        let bus =
                                            bridge_streams(peer_addr.to_string(), sink, stream);
                                        let _ = link_tx.send((peer_addr, bus)).await;
                                    }
                                    Err(e) => {
                                        error!("WebSocket accept failed for {peer_addr}: {e}");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!("TCP accept failed: {e}");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("link server shutting down");
                    break;
                }
            }
        }
    });

    Ok(local)
}

/// Dial a remote link server and return the bridged bus.
pub async fn dial_link(addr: &str) -> Result<Bus, NetError> {
    let url = if addr.starts_with("ws://") || addr.starts_with("wss://") {
        addr.to_string()
    } else {
        format!("ws://{addr}")
    };

    let (ws, _) = connect_async(&url)
        .await
        .map_err(|e| NetError::Transport(format!("Connect to {addr} failed: {e}")))?;
    let (sink, stream) = ws.split();
    Ok(bridge_streams(addr.to_string(), sink, stream))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusPayload;
    use crate::config::SocketConfig;
    use crate::packet::{Address, Packet, ports};
    use crate::socket::{SecureSocket, SocketEvent};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn linked_pair() -> (Bus, Bus) {
        let (link_tx, mut link_rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);
        let local = serve_links(
            "127.0.0.1:0".parse().unwrap(),
            link_tx,
            shutdown_tx.subscribe(),
        )
        .await
        .unwrap();

        let client_bus = dial_link(&local.to_string()).await.unwrap();
        let (_addr, server_bus) = tokio::time::timeout(Duration::from_secs(2), link_rx.recv())
            .await
            .unwrap()
            .unwrap();
        (client_bus, server_bus)
    }

    #[tokio::test]
    async fn test_packet_survives_the_bridge() {
        let (client_link, server_link) = linked_pair().await;

        let local = Bus::new("local");
        local.connect(&client_link);
        let remote = Bus::new("remote");
        remote.connect(&server_link);

        let (tx, mut rx) = mpsc::unbounded_channel();
        remote.on_input(move |msg| {
            let _ = tx.send(msg.clone());
        });

        let mut p = Packet::new(json!({"over": "websocket"}), Address::broadcast(), ports::PING);
        p.src = Address::from_string("sender");
        local.output(BusMessage::packet(p.clone()));

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match got.payload {
            BusPayload::Packet(q) => assert_eq!(q, p),
            other => panic!("Expected packet, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_raw_text_passes_verbatim() {
        let (client_link, server_link) = linked_pair().await;

        let local = Bus::new("local");
        local.connect(&client_link);
        let remote = Bus::new("remote");
        remote.connect(&server_link);

        let (tx, mut rx) = mpsc::unbounded_channel();
        remote.on_input(move |msg| {
            let _ = tx.send(msg.clone());
        });

        local.output(BusMessage::text("handshake aGVsbG8=".into()));

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match got.payload {
            BusPayload::Text(s) => assert_eq!(s, "handshake aGVsbG8="),
            other => panic!("Expected raw text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_secure_socket_handshake_over_websocket() {
        let (client_link, server_link) = linked_pair().await;

        let cfg = SocketConfig {
            secret: "ws-shared-secret".to_string(),
            step_timeout: Duration::from_secs(2),
            ..SocketConfig::default()
        };
        let (server, mut server_rx) = SecureSocket::new("srv", cfg.clone());
        let (client, _client_rx) = SecureSocket::new("cli", cfg);
        server.wire().connect(&server_link);
        client.wire().connect(&client_link);

        let (accepted, connected) = tokio::join!(server.accept(), client.connect());
        assert_eq!(accepted.unwrap().name, "cli");
        assert_eq!(connected.unwrap().name, "srv");

        client.send(json!({"through": "the wire"})).unwrap();
        loop {
            match tokio::time::timeout(Duration::from_secs(2), server_rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                SocketEvent::Data(v) => {
                    assert_eq!(v, json!({"through": "the wire"}));
                    break;
                }
                SocketEvent::Ready(_) => continue,
                other => panic!("Unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_dial_unreachable_fails() {
        let result = dial_link("127.0.0.1:1").await;
        assert!(matches!(result, Err(NetError::Transport(_))));
    }

    #[tokio::test]
    async fn test_remote_close_destroys_local_link() {
        let (client_link, server_link) = linked_pair().await;

        let dropped = Arc::new(parking_lot::Mutex::new(false));
        let flag = Arc::clone(&dropped);
        client_link.on_disconnect(move || *flag.lock() = true);

        // Destroying the server-side bus stops its writer task, dropping the
        // sink and closing the TCP stream; the client's reader observes it.
        server_link.destroy();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if *dropped.lock() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("client link was not torn down");
    }
}
