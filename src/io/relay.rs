// src/io/relay.rs
//
// Full-duplex relay between the TA612C serial port and one WebSocket client.
//
// Each connection runs two pumps:
// - serial -> socket: a blocking reader on the blocking pool feeds chunks
//   through a channel; each chunk goes out verbatim as one binary message and
//   is tapped for telemetry when a sink is configured.
// - socket -> serial: binary messages are written verbatim, text messages as
//   one byte per character.
// The first pump to stop ends the connection. The other is dropped, the
// socket is closed and the blocking reader is joined before returning.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};

use super::serial::SerialDuplex;
use super::IoError;
use crate::telemetry::{TelemetrySink, TelemetryTap};

// ============================================================================
// Configuration
// ============================================================================

/// Largest chunk read from serial in one call.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Pause after an empty serial read before polling again.
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(50);

/// Chunks buffered between the blocking reader and the socket writer.
const CHUNK_QUEUE_DEPTH: usize = 32;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub chunk_size: usize,
    pub idle_backoff: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// Client closed the WebSocket
    SocketClosed,
    /// Serial reader stopped without reporting an error
    SerialStopped,
    /// I/O failure on either side
    Failed(IoError),
}

impl std::fmt::Display for PumpExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PumpExit::SocketClosed => write!(f, "client closed connection"),
            PumpExit::SerialStopped => write!(f, "serial reader stopped"),
            PumpExit::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Traffic counters for one connection.
#[derive(Debug, Default)]
struct RelayCounters {
    serial_to_socket: AtomicU64,
    socket_to_serial: AtomicU64,
    readings: AtomicU64,
}

/// What happened on a finished connection.
#[derive(Debug)]
pub struct ConnectionSummary {
    pub exit: PumpExit,
    pub bytes_to_socket: u64,
    pub bytes_to_serial: u64,
    pub readings: u64,
}

/// Message from the blocking serial reader.
enum SerialChunk {
    Data(Vec<u8>),
    Failed(std::io::Error),
}

// ============================================================================
// Relay
// ============================================================================

/// Shared relay state: the serial device and the optional telemetry sink.
/// One `Relay` serves every client connection.
pub struct Relay {
    serial: Arc<dyn SerialDuplex>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(
        serial: Arc<dyn SerialDuplex>,
        telemetry: Option<Arc<dyn TelemetrySink>>,
        config: RelayConfig,
    ) -> Self {
        Relay {
            serial,
            telemetry,
            config,
        }
    }

    /// Relay between the serial device and one WebSocket until either side
    /// stops. Never retries; the client is expected to reconnect.
    pub async fn run<S>(&self, ws: S, peer: &str) -> ConnectionSummary
    where
        S: Stream<Item = Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Unpin
            + Send,
    {
        let counters = RelayCounters::default();
        let (mut sink, mut stream) = ws.split();

        let (reader, writer) = match self.serial.split() {
            Ok(halves) => halves,
            Err(e) => {
                let _ = sink.close().await;
                return summarize(
                    PumpExit::Failed(IoError::connection(self.serial.name(), e.to_string())),
                    &counters,
                );
            }
        };

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        let config = self.config.clone();
        let reader_task =
            tokio::task::spawn_blocking(move || read_serial_blocking(reader, chunk_tx, config));

        let tap = self.telemetry.clone().map(TelemetryTap::new);
        let device = self.serial.name();

        let exit = tokio::select! {
            exit = serial_to_socket(chunk_rx, &mut sink, tap, device, peer, &counters) => exit,
            exit = socket_to_serial(&mut stream, writer, device, peer, &counters) => exit,
        };

        // Both pump futures are gone: the chunk receiver is dropped, so the
        // reader exits after its current read returns.
        let _ = sink.close().await;
        if let Err(e) = reader_task.await {
            tlog!("[relay] Serial reader for {} panicked: {:?}", peer, e);
        }

        summarize(exit, &counters)
    }
}

fn summarize(exit: PumpExit, counters: &RelayCounters) -> ConnectionSummary {
    ConnectionSummary {
        exit,
        bytes_to_socket: counters.serial_to_socket.load(Ordering::Relaxed),
        bytes_to_serial: counters.socket_to_serial.load(Ordering::Relaxed),
        readings: counters.readings.load(Ordering::Relaxed),
    }
}

// ============================================================================
// Serial -> Socket
// ============================================================================

/// Blocking serial read loop. Runs until the receiver goes away or the port
/// reports an error. Empty reads and timeouts sleep before polling again.
fn read_serial_blocking(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<SerialChunk>,
    config: RelayConfig,
) {
    let mut buf = vec![0u8; config.chunk_size.max(1)];

    while !tx.is_closed() {
        match reader.read(&mut buf) {
            Ok(0) => std::thread::sleep(config.idle_backoff),
            Ok(n) => {
                if tx.blocking_send(SerialChunk::Data(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                std::thread::sleep(config.idle_backoff);
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                let _ = tx.blocking_send(SerialChunk::Failed(e));
                return;
            }
        }
    }
}

async fn serial_to_socket<K>(
    mut chunks: mpsc::Receiver<SerialChunk>,
    sink: &mut K,
    mut tap: Option<TelemetryTap>,
    device: &str,
    peer: &str,
    counters: &RelayCounters,
) -> PumpExit
where
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(chunk) = chunks.recv().await {
        let data = match chunk {
            SerialChunk::Data(data) => data,
            SerialChunk::Failed(e) => {
                return PumpExit::Failed(IoError::read(device, e.to_string()));
            }
        };

        // Decode a copy only once the client has the raw bytes
        let copy = tap.is_some().then(|| data.clone());
        let len = data.len() as u64;

        if let Err(e) = sink.send(Message::binary(data)).await {
            return PumpExit::Failed(IoError::connection(peer, format!("send failed: {}", e)));
        }
        counters.serial_to_socket.fetch_add(len, Ordering::Relaxed);

        if let (Some(tap), Some(copy)) = (tap.as_mut(), copy) {
            let decoded = tap.ingest(&copy);
            counters.readings.fetch_add(decoded as u64, Ordering::Relaxed);
        }
    }

    PumpExit::SerialStopped
}

// ============================================================================
// Socket -> Serial
// ============================================================================

/// Bytes to write to the device for an inbound message, if any.
///
/// Binary payloads pass through untouched. Text is a legacy path for clients
/// that cannot send binary frames and is encoded one byte per character;
/// text outside ASCII cannot be encoded that way and is dropped.
fn outbound_bytes(msg: &Message) -> Option<Vec<u8>> {
    match msg {
        Message::Binary(data) if !data.is_empty() => Some(data.to_vec()),
        Message::Text(text) if !text.as_str().is_empty() => {
            let text = text.as_str();
            if text.is_ascii() {
                Some(text.as_bytes().to_vec())
            } else {
                tlog!("[relay] Dropping non-ASCII text message ({} bytes)", text.len());
                None
            }
        }
        _ => None,
    }
}

fn write_to_serial(writer: &mut (dyn Write + Send), data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data)?;
    writer.flush()
}

async fn socket_to_serial<S>(
    stream: &mut S,
    mut writer: Box<dyn Write + Send>,
    device: &str,
    peer: &str,
    counters: &RelayCounters,
) -> PumpExit
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(tungstenite::Error::ConnectionClosed) => return PumpExit::SocketClosed,
            Err(e) => {
                return PumpExit::Failed(IoError::connection(peer, format!("receive failed: {}", e)));
            }
        };

        if msg.is_close() {
            return PumpExit::SocketClosed;
        }

        let Some(data) = outbound_bytes(&msg) else {
            continue;
        };

        // Serial writes block at the OS level; keep them off the async workers.
        let write = tokio::task::spawn_blocking(move || {
            let result = write_to_serial(writer.as_mut(), &data);
            (writer, data, result)
        })
        .await;

        let (returned, data, result) = match write {
            Ok(done) => done,
            Err(e) => {
                return PumpExit::Failed(IoError::write(device, format!("writer task failed: {}", e)));
            }
        };
        writer = returned;

        if let Err(e) = result {
            return PumpExit::Failed(IoError::write(device, e.to_string()));
        }

        counters
            .socket_to_serial
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        tlog!("[relay] {} -> device: [{}]", peer, hex::encode(&data));
    }

    PumpExit::SocketClosed
}

// ============================================================================
// Tests
// ============================================================================


#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    use super::testing::MockSerial;
    use super::*;
    use crate::io::serial::framer::encode_realtime_frame;
    use crate::telemetry::testing::{FailingSink, RecordingSink};

    type Client = WebSocketStream<DuplexStream>;

    fn fast_config() -> RelayConfig {
        RelayConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_backoff: Duration::from_millis(10),
        }
    }

    /// Start a relay over an in-memory WebSocket and return the client end.
    async fn start(
        serial: Arc<MockSerial>,
        telemetry: Option<Arc<dyn TelemetrySink>>,
    ) -> (Client, JoinHandle<ConnectionSummary>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let relay = Relay::new(serial, telemetry, fast_config());
        let handle = tokio::spawn(async move {
            let ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
            relay.run(ws, "test-client").await
        });
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (client, handle)
    }

    async fn next_binary(client: &mut Client) -> Vec<u8> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for message")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Binary(data) = msg {
                return data.to_vec();
            }
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_serial_bytes_forwarded_verbatim() {
        let serial = Arc::new(MockSerial::default());
        let noise = vec![0x00, 0x55, 0xAA, 0xFF, 0x13, 0x37];
        serial.push(&noise);

        let (mut client, handle) = start(serial.clone(), None).await;
        assert_eq!(next_binary(&mut client).await, noise);

        client.close(None).await.unwrap();
        let summary = handle.await.unwrap();
        assert!(matches!(summary.exit, PumpExit::SocketClosed));
        assert_eq!(summary.bytes_to_socket, noise.len() as u64);
    }

    #[tokio::test]
    async fn test_binary_and_text_written_to_serial() {
        let serial = Arc::new(MockSerial::default());
        let (mut client, handle) = start(serial.clone(), None).await;

        client.send(Message::binary(vec![0xAA, 0x55, 0x01, 0x03, 0x03])).await.unwrap();
        client.send(Message::text("AT\r\n")).await.unwrap();
        // Empty and non-ASCII messages are ignored
        client.send(Message::binary(Vec::new())).await.unwrap();
        client.send(Message::text("°C")).await.unwrap();

        let s = serial.clone();
        wait_for(move || s.written().len() == 9).await;
        assert_eq!(
            serial.written(),
            vec![0xAA, 0x55, 0x01, 0x03, 0x03, b'A', b'T', b'\r', b'\n']
        );

        client.close(None).await.unwrap();
        let summary = handle.await.unwrap();
        assert_eq!(summary.bytes_to_serial, 9);
    }

    #[tokio::test]
    async fn test_back_to_back_frames_reach_sink_in_order() {
        let serial = Arc::new(MockSerial::default());
        let sink = Arc::new(RecordingSink::default());

        let mut chunk = encode_realtime_frame([215, 220, 20001, -3000]);
        chunk.extend_from_slice(&encode_realtime_frame([216, 221, 20000, -3001]));
        serial.push(&chunk);

        let (mut client, handle) = start(serial.clone(), Some(sink.clone())).await;
        assert_eq!(next_binary(&mut client).await, chunk);

        client.close(None).await.unwrap();
        let summary = handle.await.unwrap();
        assert_eq!(summary.readings, 2);
        assert_eq!(
            sink.channels(),
            vec![
                [Some(21.5), Some(22.0), None, Some(-300.0)],
                [Some(21.6), Some(22.1), Some(2000.0), None],
            ]
        );
    }

    #[tokio::test]
    async fn test_frame_split_across_reads_decoded_once() {
        let serial = Arc::new(MockSerial::default());
        let sink = Arc::new(RecordingSink::default());
        let frame = encode_realtime_frame([100, 200, 300, 400]);
        serial.push(&frame[..5]);
        serial.push(&frame[5..]);

        let (mut client, handle) = start(serial.clone(), Some(sink.clone())).await;
        let mut received = next_binary(&mut client).await;
        received.extend(next_binary(&mut client).await);
        assert_eq!(received, frame);

        client.close(None).await.unwrap();
        handle.await.unwrap();
        assert_eq!(sink.readings.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_affect_relay() {
        let serial = Arc::new(MockSerial::default());
        let frame = encode_realtime_frame([1, 2, 3, 4]);
        serial.push(&frame);
        serial.push(&frame);

        let (mut client, handle) = start(serial.clone(), Some(Arc::new(FailingSink))).await;
        let mut received = next_binary(&mut client).await;
        received.extend(next_binary(&mut client).await);
        assert_eq!(received.len(), frame.len() * 2);

        client.close(None).await.unwrap();
        let summary = handle.await.unwrap();
        assert!(matches!(summary.exit, PumpExit::SocketClosed));
    }

    #[tokio::test]
    async fn test_idle_serial_sleeps_and_stays_alive() {
        let serial = Arc::new(MockSerial::default());
        let reads: Arc<AtomicUsize> = serial.reads.clone();
        let (mut client, handle) = start(serial.clone(), None).await;

        // Nothing arrives while the device is idle
        let idle = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
        assert!(idle.is_err(), "no message expected from an idle device");
        assert!(!handle.is_finished());

        // 10 ms backoff over 200 ms: a busy loop would read far more often
        let count = reads.load(Ordering::SeqCst);
        assert!(count >= 2, "reader should keep polling, got {count}");
        assert!(count < 60, "reader is spinning: {count} reads");

        // Still relaying once data shows up
        serial.push(&[0x42]);
        assert_eq!(next_binary(&mut client).await, vec![0x42]);

        client.close(None).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_serial_read_error_closes_connection() {
        let serial = Arc::new(MockSerial::default());
        serial.push(&[0x01]);
        serial.push_error(ErrorKind::BrokenPipe);

        let (mut client, handle) = start(serial.clone(), None).await;
        assert_eq!(next_binary(&mut client).await, vec![0x01]);

        let summary = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(summary.exit, PumpExit::Failed(IoError::Read { .. })));

        // Client sees the close
        let end = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(Ok(msg)) = client.next().await {
                if msg.is_close() {
                    return;
                }
            }
        })
        .await;
        assert!(end.is_ok());
    }

    #[tokio::test]
    async fn test_serial_write_error_closes_connection() {
        let serial = Arc::new(MockSerial {
            fail_writes: true,
            ..Default::default()
        });
        let (mut client, handle) = start(serial.clone(), None).await;

        client.send(Message::binary(vec![0x01, 0x02])).await.unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(summary.exit, PumpExit::Failed(IoError::Write { .. })));
        assert_eq!(summary.bytes_to_serial, 0);
    }

    #[tokio::test]
    async fn test_dropped_client_tears_down_reader() {
        let serial = Arc::new(MockSerial::default());
        let (client, handle) = start(serial.clone(), None).await;

        drop(client);
        let summary = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!matches!(summary.exit, PumpExit::SerialStopped));

        // Reader was joined, so no further polling happens
        let after = serial.reads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(serial.reads.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_chunk_not_decoded_when_send_fails() {
        let recorder = Arc::new(RecordingSink::default());
        let tap = TelemetryTap::new(recorder.clone());
        let counters = RelayCounters::default();

        let (tx, rx) = mpsc::channel(1);
        tx.send(SerialChunk::Data(encode_realtime_frame([100, 200, 300, 400])))
            .await
            .unwrap();
        drop(tx);

        let mut refusing = Box::pin(futures::sink::unfold((), |_, _msg: Message| async {
            Err::<(), _>(tungstenite::Error::ConnectionClosed)
        }));

        let exit = serial_to_socket(rx, &mut refusing, Some(tap), "mock", "test-client", &counters).await;

        assert!(matches!(exit, PumpExit::Failed(IoError::Connection { .. })));
        assert!(recorder.readings.lock().unwrap().is_empty());
        assert_eq!(counters.readings.load(Ordering::Relaxed), 0);
        assert_eq!(counters.serial_to_socket.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_outbound_bytes() {
        assert_eq!(outbound_bytes(&Message::binary(vec![1, 2])), Some(vec![1, 2]));
        assert_eq!(outbound_bytes(&Message::text("ok")), Some(b"ok".to_vec()));
        assert_eq!(outbound_bytes(&Message::binary(Vec::new())), None);
        assert_eq!(outbound_bytes(&Message::text("")), None);
        assert_eq!(outbound_bytes(&Message::text("é")), None);
        assert_eq!(outbound_bytes(&Message::Ping(Vec::new().into())), None);
    }
}
