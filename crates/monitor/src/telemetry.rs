//! Optional MQTT status reporting.
//!
//! The rumqttc `EventLoop` is owned by one background task, the only place
//! that connects, reconnects or reads connection state. Publishes are
//! queued through the client's request channel, so the control loop never
//! touches the connection while it is being rebuilt.
//!
//! ## Connection lifecycle
//!
//! ```text
//! connect ──[ok within ceiling]──▶ connected ──[lost]──▶ reconnecting
//!    │                               ▲                        │
//!    └──[ceiling hit]──▶ fatal       └──────[ok]──────────────┤
//!                                    │                        │
//!                                 [close]  cooldown ◀──[ceiling hit]
//!                                    ▼
//!                                  closed
//! ```
//!
//! Closing queues a DISCONNECT behind any pending status lines and lets
//! the supervisor flush them before it exits.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub(crate) const CLIENT_ID: &str = "soil-monitor";
pub(crate) const TOPIC: &str = "soil-monitor";
pub(crate) const DEFAULT_PORT: u16 = 1883;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10;
/// Longest `close` waits for queued lines and the DISCONNECT to go out.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("invalid broker uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: &'static str },

    #[error("broker unreachable after {attempts} attempts: {last}")]
    Connection { attempts: u32, last: String },
}

/// Bounded-retry parameters for connecting to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    /// Total connection attempts per round.
    pub(crate) attempts: u32,
    /// Wait between failed attempts.
    pub(crate) backoff: Duration,
    /// Wait after a steady-state round gives up before starting another.
    pub(crate) cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(5),
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Anything that accepts status lines. Delivery is best-effort.
pub(crate) trait Reporter {
    fn publish(&self, line: &str);
}

impl<T: Reporter + ?Sized> Reporter for &T {
    fn publish(&self, line: &str) {
        (**self).publish(line)
    }
}

/// The connection half the retry logic drives.
pub(crate) trait Link {
    type Error: fmt::Display;

    /// Make one connection attempt.
    fn try_connect(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Service an established connection until it is closed locally
    /// (`Ok`) or drops (`Err`).
    fn drive(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Try to connect up to `policy.attempts` times, sleeping `policy.backoff`
/// between failures. Returns the attempt number that succeeded.
pub(crate) async fn connect_with_retry<L: Link>(
    link: &mut L,
    policy: RetryPolicy,
) -> Result<u32, TelemetryError> {
    let mut last = String::from("no attempt made");

    for attempt in 1..=policy.attempts {
        match link.try_connect().await {
            Ok(()) => {
                info!(attempt, "broker connected");
                return Ok(attempt);
            }
            Err(e) => {
                warn!(attempt, max = policy.attempts, "broker connect failed: {e}");
                last = e.to_string();
                if attempt < policy.attempts {
                    sleep(policy.backoff).await;
                }
            }
        }
    }

    Err(TelemetryError::Connection {
        attempts: policy.attempts,
        last,
    })
}

/// Background owner of the connection: services it, and on loss runs
/// bounded reconnect rounds until one succeeds. Returns once the
/// connection is closed locally.
pub(crate) async fn supervise<L: Link>(mut link: L, policy: RetryPolicy, connected: watch::Sender<bool>) {
    loop {
        let cause = match link.drive().await {
            Ok(()) => {
                connected.send_replace(false);
                info!("broker connection closed");
                return;
            }
            Err(cause) => cause,
        };
        connected.send_replace(false);
        warn!("broker connection lost, reconnecting: {cause}");

        while let Err(e) = connect_with_retry(&mut link, policy).await {
            error!(
                cooldown_sec = policy.cooldown.as_secs(),
                "telemetry suspended: {e}"
            );
            sleep(policy.cooldown).await;
        }

        connected.send_replace(true);
        info!("broker connection restored");
    }
}

// ---------------------------------------------------------------------------
// Broker URI
// ---------------------------------------------------------------------------

/// Split `tcp://host:port`, `mqtt://host:port` or bare `host[:port]`.
pub(crate) fn parse_broker_uri(uri: &str) -> Result<(String, u16), TelemetryError> {
    let invalid = |reason| TelemetryError::InvalidUri {
        uri: uri.to_string(),
        reason,
    };

    let rest = match uri.trim().split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some(_) => return Err(invalid("unsupported scheme (use tcp:// or mqtt://)")),
        None => uri.trim(),
    };
    let rest = rest.trim_end_matches('/');

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
            (host, port)
        }
        None => (rest, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    if port == 0 {
        return Err(invalid("port must be non-zero"));
    }

    Ok((host.to_string(), port))
}

// ---------------------------------------------------------------------------
// rumqttc
// ---------------------------------------------------------------------------

struct MqttLink {
    eventloop: EventLoop,
}

impl Link for MqttLink {
    type Error = ConnectionError;

    async fn try_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            if let Event::Incoming(Packet::ConnAck(_)) = self.eventloop.poll().await? {
                return Ok(());
            }
        }
    }

    async fn drive(&mut self) -> Result<(), ConnectionError> {
        loop {
            // The eventloop flushes each request before reporting it.
            match self.eventloop.poll().await? {
                Event::Outgoing(Outgoing::Disconnect) => return Ok(()),
                Event::Incoming(Packet::Disconnect) => debug!("broker sent disconnect"),
                _ => {}
            }
        }
    }
}

/// Fire-and-forget status publisher (QoS 0, not retained, fixed topic).
pub(crate) struct TelemetryPublisher {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl TelemetryPublisher {
    /// Connect within the policy's ceiling, then hand the connection to a
    /// background supervisor. Failure here is fatal to the caller.
    pub(crate) async fn connect(uri: &str, policy: RetryPolicy) -> Result<Self, TelemetryError> {
        let (host, port) = parse_broker_uri(uri)?;

        let mut options = MqttOptions::new(CLIENT_ID, host.clone(), port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let mut link = MqttLink { eventloop };

        info!(%host, port, "connecting to broker");
        connect_with_retry(&mut link, policy).await?;

        let (tx, rx) = watch::channel(true);
        let task = tokio::spawn(supervise(link, policy, tx));

        Ok(Self {
            client,
            connected: rx,
            task,
        })
    }

    pub(crate) fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Flush queued status lines, send DISCONNECT and wait for the
    /// supervisor to exit. Gives up after [`CLOSE_TIMEOUT`]; while offline
    /// there is nothing to flush and the supervisor is stopped at once.
    pub(crate) async fn close(self) {
        let Self {
            client,
            connected,
            mut task,
        } = self;

        if *connected.borrow() {
            let closed = tokio::time::timeout(CLOSE_TIMEOUT, async {
                client.disconnect().await.map_err(|e| e.to_string())?;
                (&mut task).await.map_err(|e| e.to_string())
            })
            .await;

            match closed {
                Ok(Ok(())) => return,
                Ok(Err(e)) => warn!("broker disconnect failed: {e}"),
                Err(_) => warn!(
                    timeout_sec = CLOSE_TIMEOUT.as_secs(),
                    "broker disconnect timed out"
                ),
            }
        }
        task.abort();
    }
}

impl Reporter for TelemetryPublisher {
    fn publish(&self, line: &str) {
        if !self.is_connected() {
            debug!(line, "broker offline, status line dropped");
            return;
        }
        if let Err(e) = self
            .client
            .try_publish(TOPIC, QoS::AtMostOnce, false, line.as_bytes().to_vec())
        {
            warn!("telemetry publish failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Fails `failures` connection attempts, then succeeds. `drive` reports
    /// a loss on its first call, then reports a local close if `closes` is
    /// set or idles forever.
    struct FlakyLink {
        failures: u32,
        attempts: Arc<AtomicU32>,
        drops_left: u32,
        closes: bool,
    }

    impl FlakyLink {
        fn new(failures: u32) -> (Self, Arc<AtomicU32>) {
            let attempts = Arc::new(AtomicU32::new(0));
            (
                Self {
                    failures,
                    attempts: Arc::clone(&attempts),
                    drops_left: 1,
                    closes: false,
                },
                attempts,
            )
        }
    }

    impl Link for FlakyLink {
        type Error = String;

        async fn try_connect(&mut self) -> Result<(), String> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(format!("refused #{n}"))
            } else {
                Ok(())
            }
        }

        async fn drive(&mut self) -> Result<(), String> {
            if self.drops_left > 0 {
                self.drops_left -= 1;
                return Err("connection reset".to_string());
            }
            if self.closes {
                return Ok(());
            }
            std::future::pending().await
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 5,
            backoff: Duration::ZERO,
            cooldown: Duration::ZERO,
        }
    }

    // -- connect_with_retry ---------------------------------------------------

    #[tokio::test]
    async fn connect_first_try() {
        let (mut link, attempts) = FlakyLink::new(0);
        assert_eq!(connect_with_retry(&mut link, fast_policy()).await.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_succeeds_on_last_allowed_attempt() {
        let (mut link, attempts) = FlakyLink::new(4);
        assert_eq!(connect_with_retry(&mut link, fast_policy()).await.unwrap(), 5);
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn connect_gives_up_after_ceiling() {
        let (mut link, attempts) = FlakyLink::new(5);
        match connect_with_retry(&mut link, fast_policy()).await {
            Err(TelemetryError::Connection { attempts: n, last }) => {
                assert_eq!(n, 5);
                assert_eq!(last, "refused #5");
            }
            other => panic!("expected Connection error, got {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn connect_waits_backoff_between_attempts() {
        let (mut link, _) = FlakyLink::new(2);
        let policy = RetryPolicy {
            backoff: Duration::from_millis(20),
            ..fast_policy()
        };
        let started = tokio::time::Instant::now();
        connect_with_retry(&mut link, policy).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    // -- supervise ------------------------------------------------------------

    /// Poll until the supervisor has made `expected` attempts and reports
    /// the link as connected again.
    async fn wait_reconnected(rx: &watch::Receiver<bool>, attempts: &AtomicU32, expected: u32) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if attempts.load(Ordering::SeqCst) == expected && *rx.borrow() {
                    return;
                }
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("reconnect timed out");
    }

    #[tokio::test]
    async fn connection_loss_triggers_bounded_reconnect() {
        // One loss, then 3 refused attempts before the broker is back.
        let (link, attempts) = FlakyLink::new(3);
        let (tx, rx) = watch::channel(true);
        let task = tokio::spawn(supervise(link, fast_policy(), tx));

        wait_reconnected(&rx, &attempts, 4).await;
        task.abort();
    }

    #[tokio::test]
    async fn exhausted_round_starts_another_after_cooldown() {
        // First round (5 attempts) fails entirely; second round succeeds.
        let (link, attempts) = FlakyLink::new(6);
        let (tx, rx) = watch::channel(true);
        let task = tokio::spawn(supervise(link, fast_policy(), tx));

        wait_reconnected(&rx, &attempts, 7).await;
        task.abort();
    }

    #[tokio::test]
    async fn local_close_ends_supervisor() {
        let (mut link, attempts) = FlakyLink::new(0);
        link.closes = true;
        let (tx, rx) = watch::channel(true);

        tokio::time::timeout(Duration::from_secs(2), supervise(link, fast_policy(), tx))
            .await
            .expect("supervisor kept running after close");

        // Lost once, reconnected once, then closed.
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!*rx.borrow());
    }

    // -- parse_broker_uri -----------------------------------------------------

    #[test]
    fn parse_tcp_uri() {
        assert_eq!(
            parse_broker_uri("tcp://broker.local:1884").unwrap(),
            ("broker.local".to_string(), 1884)
        );
    }

    #[test]
    fn parse_mqtt_uri_default_port() {
        assert_eq!(
            parse_broker_uri("mqtt://10.0.0.5").unwrap(),
            ("10.0.0.5".to_string(), DEFAULT_PORT)
        );
    }

    #[test]
    fn parse_bare_host_port() {
        assert_eq!(
            parse_broker_uri("localhost:1883/").unwrap(),
            ("localhost".to_string(), 1883)
        );
    }

    #[test]
    fn parse_rejects_tls_scheme() {
        assert!(matches!(
            parse_broker_uri("ssl://broker:8883"),
            Err(TelemetryError::InvalidUri { .. })
        ));
    }

    #[test]
    fn parse_rejects_bad_port() {
        assert!(parse_broker_uri("tcp://broker:abc").is_err());
        assert!(parse_broker_uri("tcp://broker:0").is_err());
        assert!(parse_broker_uri("tcp://broker:70000").is_err());
    }

    #[test]
    fn parse_rejects_missing_host() {
        assert!(parse_broker_uri("tcp://:1883").is_err());
        assert!(parse_broker_uri("").is_err());
    }

    // -- TelemetryPublisher ---------------------------------------------------

    #[tokio::test]
    async fn unreachable_broker_is_fatal() {
        // Nothing listens on port 1 on the loopback interface.
        let policy = RetryPolicy {
            attempts: 2,
            ..fast_policy()
        };
        let err = TelemetryPublisher::connect("tcp://127.0.0.1:1", policy)
            .await
            .err()
            .expect("connect should fail");
        assert!(matches!(err, TelemetryError::Connection { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn invalid_uri_fails_before_connecting() {
        let err = TelemetryPublisher::connect("ws://broker", fast_policy())
            .await
            .err()
            .expect("connect should fail");
        assert!(matches!(err, TelemetryError::InvalidUri { .. }));
    }

    // -- TelemetryPublisher against a loopback broker -------------------------

    const CONNECT: u8 = 1;
    const PUBLISH: u8 = 3;
    const DISCONNECT: u8 = 14;

    /// One MQTT frame: fixed-header byte and body.
    type Frame = (u8, Vec<u8>);

    async fn read_frame(sock: &mut TcpStream) -> Option<Frame> {
        let header = sock.read_u8().await.ok()?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let b = sock.read_u8().await.ok()?;
            len |= usize::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        sock.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    /// Accepts one client, acks its CONNECT, then records every frame until
    /// DISCONNECT or end of stream.
    async fn loopback_broker() -> (String, JoinHandle<Vec<Frame>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("tcp://{}", listener.local_addr().unwrap());

        let task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let (header, _) = read_frame(&mut sock).await.unwrap();
            assert_eq!(header >> 4, CONNECT);
            sock.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            let mut frames = Vec::new();
            while let Some(frame) = read_frame(&mut sock).await {
                let done = frame.0 >> 4 == DISCONNECT;
                frames.push(frame);
                if done {
                    break;
                }
            }
            frames
        });
        (uri, task)
    }

    /// Topic and payload of a QoS 0 PUBLISH body.
    fn split_publish(body: &[u8]) -> (&[u8], &[u8]) {
        let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
        body[2..].split_at(topic_len)
    }

    fn publishes(frames: &[Frame]) -> Vec<(u8, String, String)> {
        frames
            .iter()
            .filter(|(header, _)| header >> 4 == PUBLISH)
            .map(|(header, body)| {
                let (topic, payload) = split_publish(body);
                (
                    *header,
                    String::from_utf8_lossy(topic).into_owned(),
                    String::from_utf8_lossy(payload).into_owned(),
                )
            })
            .collect()
    }

    async fn broker_frames(task: JoinHandle<Vec<Frame>>) -> Vec<Frame> {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("broker never saw the client finish")
            .unwrap()
    }

    #[tokio::test]
    async fn status_line_reaches_broker_at_most_once() {
        let (uri, broker) = loopback_broker().await;
        let publisher = TelemetryPublisher::connect(&uri, fast_policy()).await.unwrap();
        assert!(publisher.is_connected());

        publisher.publish("Current moisture=100");
        publisher.close().await;

        let sent = publishes(&broker_frames(broker).await);
        // 0x30: PUBLISH, QoS 0, not retained, not a duplicate.
        assert_eq!(
            sent,
            vec![(0x30, TOPIC.to_string(), "Current moisture=100".to_string())]
        );
    }

    #[tokio::test]
    async fn close_flushes_last_line_then_disconnects() {
        let (uri, broker) = loopback_broker().await;
        let publisher = TelemetryPublisher::connect(&uri, fast_policy()).await.unwrap();

        publisher.publish("Pump off");
        publisher.publish("Shutting down");
        publisher.close().await;

        let frames = broker_frames(broker).await;
        let lines: Vec<_> = publishes(&frames).into_iter().map(|(_, _, p)| p).collect();
        assert_eq!(lines, vec!["Pump off", "Shutting down"]);
        assert_eq!(frames.last().map(|(h, _)| h >> 4), Some(DISCONNECT));
    }

    #[tokio::test]
    async fn offline_publish_is_dropped() {
        let (uri, broker) = loopback_broker().await;
        let mut publisher = TelemetryPublisher::connect(&uri, fast_policy()).await.unwrap();

        let (_offline, rx) = watch::channel(false);
        publisher.connected = rx;
        assert!(!publisher.is_connected());

        publisher.publish("Current moisture=42");
        publisher.close().await;

        let frames = broker_frames(broker).await;
        assert!(publishes(&frames).is_empty(), "sent while offline: {frames:?}");
    }

    #[tokio::test]
    async fn publish_never_waits_on_a_full_queue() {
        let (uri, broker) = loopback_broker().await;
        let publisher = TelemetryPublisher::connect(&uri, fast_policy()).await.unwrap();

        // No await between publishes: the supervisor cannot drain the queue,
        // so everything past its capacity is dropped rather than waited on.
        for n in 0..REQUEST_CAPACITY * 3 {
            publisher.publish(&format!("Current moisture={n}"));
        }
        publisher.close().await;

        let sent = publishes(&broker_frames(broker).await).len();
        assert!(sent >= 1 && sent <= REQUEST_CAPACITY, "sent {sent}");
    }
}
