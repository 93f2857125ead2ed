//! `StompTransport`: a long-lived TCP/TLS STOMP 1.x session.
//!
//! Connection-state-machine shape grounded in
//! `examples/Treystu-SCMessenger/core/src/relay/client.rs`: an
//! `Arc<RwLock<ConnectionState>>`, an async `start`/reconnect flow that
//! walks a list of candidates, a `thiserror` error enum, and
//! `tokio::test`-based integration tests against a real in-process TCP
//! listener standing in for the broker. The wire framing itself (NUL-
//! terminated STOMP text frames rather than `relay/client.rs`'s
//! length-prefixed binary protocol) comes from `transport::frame`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::frame::Frame;
use super::{Delivery, TransportError};

/// Initial-CONNECT deadline (`CONNECTION_TIMEOUT` in `ssm/ssm2.py`).
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between closing a dead socket and re-walking the broker list
/// (`handle_disconnect`'s `sleep(2)` in `ssm/ssm2.py`).
pub const RECONNECT_PAUSE: Duration = Duration::from_secs(2);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const SUBSCRIPTION_ID: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Subscribed,
    Disconnecting,
    Dead,
}

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

struct Connected {
    writer: Mutex<Box<dyn Stream>>,
}

pub struct StompTransport {
    brokers: Vec<(String, u16)>,
    use_ssl: bool,
    destination: Option<String>,
    state: Arc<RwLock<ConnectionState>>,
    connected_notify: Arc<Notify>,
    receipt_rx: Option<mpsc::Receiver<String>>,
    receipt_tx: mpsc::Sender<String>,
    deliveries_tx: Option<mpsc::UnboundedSender<Delivery>>,
    deliveries_rx: Option<mpsc::UnboundedReceiver<Delivery>>,
    conn: Option<Connected>,
    txn_counter: AtomicU64,
}

impl StompTransport {
    pub fn new(brokers: Vec<(String, u16)>, use_ssl: bool) -> Self {
        let (receipt_tx, receipt_rx) = mpsc::channel(8);
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        StompTransport {
            brokers,
            use_ssl,
            destination: None,
            state: Arc::new(RwLock::new(ConnectionState::Idle)),
            connected_notify: Arc::new(Notify::new()),
            receipt_rx: Some(receipt_rx),
            receipt_tx,
            deliveries_tx: Some(deliveries_tx),
            deliveries_rx: Some(deliveries_rx),
            conn: None,
            txn_counter: AtomicU64::new(0),
        }
    }

    pub fn with_destination(mut self, destination: String) -> Self {
        self.destination = Some(destination);
        self
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Non-blocking drain of whatever the background reader task has
    /// queued since the last call; the Receiver loop calls this once per
    /// 100ms tick instead of an explicit `pull`.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.deliveries_rx.as_mut()?.try_recv().ok()
    }

    async fn dial_one(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        let tcp = TcpStream::connect((host, port)).await?;
        let boxed: Box<dyn Stream> = if self.use_ssl {
            let connector = tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
            Box::new(connector.connect(host, tcp).await.map_err(|e| {
                TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })?)
        } else {
            warn!("connecting to {}:{} without TLS", host, port);
            Box::new(tcp)
        };

        let (mut read_half, write_half) = tokio::io::split(boxed);

        let connect_frame = Frame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", host);

        let writer = Mutex::new(write_half as Box<dyn Stream>);
        // Send CONNECT before handing the writer off to the shared slot.
        {
            let mut guard = writer.lock().await;
            guard.write_all(&connect_frame.encode()).await?;
        }

        self.conn = Some(Connected { writer });

        let state = self.state.clone();
        let notify = self.connected_notify.clone();
        let receipt_tx = self.receipt_tx.clone();
        let deliveries_tx = self.deliveries_tx.clone();

        tokio::spawn(async move {
            let mut buf = Vec::with_capacity(4096);
            let mut chunk = [0u8; 4096];
            loop {
                let n = match read_half.read(&mut chunk).await {
                    Ok(0) => {
                        debug!("stomp socket closed by peer");
                        *state.write().await = ConnectionState::Dead;
                        return;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("stomp read error: {}", e);
                        *state.write().await = ConnectionState::Dead;
                        return;
                    }
                };
                buf.extend_from_slice(&chunk[..n]);

                while let Some((frame, consumed)) = Frame::parse(&buf) {
                    buf.drain(..consumed);
                    match frame.command.as_str() {
                        "CONNECTED" => {
                            *state.write().await = ConnectionState::Connected;
                            notify.notify_one();
                        }
                        "RECEIPT" => {
                            if let Some(id) = frame.get("receipt-id") {
                                let _ = receipt_tx.try_send(id.to_string());
                            }
                        }
                        "MESSAGE" => {
                            if let Some(tx) = &deliveries_tx {
                                let headers: HashMap<String, String> =
                                    frame.headers.iter().cloned().collect();
                                let _ = tx.send(Delivery {
                                    headers,
                                    body: frame.body,
                                    ack_id: None,
                                });
                            }
                        }
                        "ERROR" => {
                            warn!("stomp ERROR frame received");
                            *state.write().await = ConnectionState::Dead;
                            return;
                        }
                        _ => {}
                    }
                }
            }
        });

        Ok(())
    }

    /// `start()`: Idle -> Connecting, walk the broker list in order, first
    /// successful CONNECT wins.
    pub async fn start(&mut self) -> Result<(), TransportError> {
        *self.state.write().await = ConnectionState::Connecting;
        let brokers = self.brokers.clone();
        for (host, port) in brokers {
            if self.dial_one(&host, port).await.is_err() {
                continue;
            }
            match timeout(CONNECTION_TIMEOUT, self.connected_notify.notified()).await {
                Ok(()) if *self.state.read().await == ConnectionState::Connected => {
                    info!("stomp connected to {}:{}", host, port);
                    return Ok(());
                }
                _ => {
                    warn!("broker {}:{} did not confirm CONNECT in time", host, port);
                    self.conn = None;
                    continue;
                }
            }
        }
        *self.state.write().await = ConnectionState::Dead;
        Err(TransportError::NoBroker)
    }

    /// Closes any remaining socket, sleeps 2s, then re-walks the broker
    /// list (spec.md §4.4.2).
    pub async fn reconnect(&mut self) -> Result<(), TransportError> {
        self.conn = None;
        tokio::time::sleep(RECONNECT_PAUSE).await;
        self.start().await
    }

    pub async fn subscribe(&mut self, destination: &str) -> Result<(), TransportError> {
        let frame = Frame::new("SUBSCRIBE")
            .header("destination", destination)
            .header("id", SUBSCRIPTION_ID)
            .header("ack", "auto");
        self.send_frame(&frame).await?;
        *self.state.write().await = ConnectionState::Subscribed;
        Ok(())
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let conn = self.conn.as_ref().ok_or(TransportError::LostConnection)?;
        let mut guard = conn.writer.lock().await;
        guard.write_all(&frame.encode()).await?;
        Ok(())
    }

    /// Attach headers `{destination, receipt=id, empa-id=id}` and block
    /// until the matching RECEIPT frame arrives, polling connection
    /// health roughly every 10ms in the meantime (spec.md §4.4.2).
    pub async fn publish(&mut self, body: &[u8], id: &str) -> Result<(), TransportError> {
        let destination = self
            .destination
            .clone()
            .ok_or(TransportError::LostConnection)?;
        let frame = Frame::new("SEND")
            .header("destination", &destination)
            .header("receipt", id)
            .header("empa-id", id)
            .body(body.to_vec());
        self.send_frame(&frame).await?;

        let receipt_rx = self
            .receipt_rx
            .as_mut()
            .expect("receipt channel always present");
        loop {
            tokio::select! {
                received = receipt_rx.recv() => {
                    match received {
                        Some(receipt_id) if receipt_id == id => return Ok(()),
                        Some(_other) => continue, // stale receipt, keep waiting
                        None => return Err(TransportError::LostConnection),
                    }
                }
                _ = tokio::time::sleep(RECEIPT_POLL_INTERVAL) => {
                    if *self.state.read().await == ConnectionState::Dead {
                        return Err(TransportError::LostConnection);
                    }
                }
            }
        }
    }

    /// `BEGIN`+`ABORT` a transaction with a unique id; a pure keep-alive
    /// ping, never actually commits anything.
    pub async fn send_ping(&mut self) -> Result<(), TransportError> {
        let txn_id = format!(
            "{}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos(),
            self.txn_counter.fetch_add(1, Ordering::SeqCst)
        );
        self.send_frame(&Frame::new("BEGIN").header("transaction", &txn_id))
            .await?;
        self.send_frame(&Frame::new("ABORT").header("transaction", &txn_id))
            .await
    }

    pub async fn stop(&mut self) -> Result<(), TransportError> {
        *self.state.write().await = ConnectionState::Disconnecting;
        if self.conn.is_some() {
            let _ = self.send_frame(&Frame::new("DISCONNECT")).await;
        }
        self.conn = None;
        *self.state.write().await = ConnectionState::Dead;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_broker(listener: TcpListener, receipt_id: &'static str) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            let (frame, _) = Frame::parse(&buf[..n]).expect("valid test frame");
            match frame.command.as_str() {
                "CONNECT" => {
                    let connected = Frame::new("CONNECTED").header("version", "1.2");
                    socket.write_all(&connected.encode()).await.unwrap();
                }
                "SEND" => {
                    let receipt = Frame::new("RECEIPT").header("receipt-id", receipt_id);
                    socket.write_all(&receipt.encode()).await.unwrap();
                }
                "DISCONNECT" => return,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn connect_transitions_to_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(fake_broker(listener, "msg-1"));

        let mut transport = StompTransport::new(vec![(addr.ip().to_string(), addr.port())], false);
        transport.start().await.unwrap();
        assert_eq!(transport.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn publish_waits_for_matching_receipt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(fake_broker(listener, "msg-42"));

        let mut transport = StompTransport::new(vec![(addr.ip().to_string(), addr.port())], false)
            .with_destination("/queue/accounting".to_string());
        transport.start().await.unwrap();
        transport.publish(b"hello", "msg-42").await.unwrap();
    }

    #[tokio::test]
    async fn exhausting_broker_list_is_no_broker_error() {
        let mut transport = StompTransport::new(vec![("127.0.0.1".to_string(), 1)], false);
        let result = transport.start().await;
        assert!(matches!(result, Err(TransportError::NoBroker)));
    }
}
