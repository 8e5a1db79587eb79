//! IPC transport implementations
//!
//! Every link, whatever carries it, is exposed to the rest of the workspace
//! as a [`Duplex`]: an outbound sender and an inbound receiver. Byte streams
//! are attached with [`attach_stream`], which spawns one pump task per
//! direction. A process context attaches its own stdio with
//! [`StdioTransport`], whose writer is a native thread so that events keep
//! reaching the orchestrator while a test holds the runtime thread. Thread
//! and sandboxed contexts use a plain in-memory [`duplex_pair`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::IpcError;
use crate::protocol::{ContextMessage, MessageEnvelope, OrchestratorMessage, IPC_PROTOCOL_VERSION};

type Outbound<T> = mpsc::UnboundedReceiver<Result<T, IpcError>>;

/// Numbers envelopes and renders them as newline-terminated JSON
#[derive(Debug)]
pub struct LineFramer {
    next_seq: u64,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self { next_seq: 1 }
    }
}

impl LineFramer {
    /// The sequence number is only consumed when encoding succeeds
    pub fn frame<T: Serialize>(&mut self, message: &T) -> Result<Vec<u8>, IpcError> {
        let envelope = MessageEnvelope::new(self.next_seq, message);
        let mut line = serde_json::to_vec(&envelope).map_err(|e| IpcError::Encode(e.to_string()))?;
        line.push(b'\n');
        self.next_seq += 1;
        Ok(line)
    }
}

/// Writes one JSON envelope per line
pub struct JsonLinesWriter<W> {
    inner: W,
    framer: LineFramer,
}

impl<W: AsyncWrite + Unpin> JsonLinesWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            framer: LineFramer::default(),
        }
    }

    /// Wrap `message` in an envelope and write it
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), IpcError> {
        let line = self.framer.frame(message)?;
        self.write_raw(&line).await
    }

    /// Write bytes that were already framed
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), IpcError> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    fn framer(&mut self) -> &mut LineFramer {
        &mut self.framer
    }

    pub async fn close(&mut self) -> Result<(), IpcError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Reads JSON envelopes line by line, checking version and ordering
pub struct JsonLinesReader<R> {
    inner: BufReader<R>,
    line: String,
    last_seq: u64,
}

impl<R: AsyncRead + Unpin> JsonLinesReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            line: String::new(),
            last_seq: 0,
        }
    }

    /// Receive the next envelope; end of stream is `LinkClosed`
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<MessageEnvelope<T>, IpcError> {
        loop {
            self.line.clear();
            let read = self.inner.read_line(&mut self.line).await?;
            if read == 0 {
                return Err(IpcError::LinkClosed);
            }

            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let envelope: MessageEnvelope<T> = serde_json::from_str(trimmed)
                .map_err(|e| IpcError::Malformed(e.to_string()))?;

            // Check protocol version compatibility
            if !envelope.is_compatible() {
                return Err(IpcError::VersionMismatch {
                    expected: IPC_PROTOCOL_VERSION,
                    actual: envelope.protocol_version,
                });
            }

            if envelope.seq <= self.last_seq {
                return Err(IpcError::OutOfOrder {
                    previous: self.last_seq,
                    actual: envelope.seq,
                });
            }
            self.last_seq = envelope.seq;

            return Ok(envelope);
        }
    }
}

/// Stdin/Stdout transport used inside a process context
pub struct StdioTransport;

impl StdioTransport {
    /// Attach a duplex to this process's stdin and stdout
    ///
    /// Reads go through the runtime; writes happen on a native thread that
    /// does not depend on the runtime making progress.
    pub fn attach<Tx, Rx>() -> Result<Duplex<Tx, Rx>, IpcError>
    where
        Tx: Serialize + Send + 'static,
        Rx: DeserializeOwned + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        spawn_blocking_writer(out_rx, std::io::stdout())?;
        Ok(Duplex {
            outbound: LinkSender { tx: out_tx },
            inbound: spawn_reader(tokio::io::stdin()),
        })
    }
}

/// Drain `outbound` into `out` on a dedicated thread until every sender is gone
pub(crate) fn spawn_blocking_writer<Tx, W>(
    outbound: Outbound<Tx>,
    out: W,
) -> Result<std::thread::JoinHandle<()>, IpcError>
where
    Tx: Serialize + Send + 'static,
    W: Write + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name("trellis-ipc-writer".to_string())
        .spawn(move || write_blocking(outbound, out))?;
    Ok(handle)
}

fn write_blocking<Tx: Serialize, W: Write>(mut outbound: Outbound<Tx>, mut out: W) {
    let mut framer = LineFramer::default();
    while let Some(frame) = outbound.blocking_recv() {
        let Ok(message) = frame else { continue };
        let line = match framer.frame(&message) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("Dropping outbound message: {}", e);
                continue;
            }
        };
        if let Err(e) = out.write_all(&line).and_then(|()| out.flush()) {
            log::debug!("IPC writer stopped: {}", e);
            return;
        }
    }
}

/// Cloneable sending half of a link
pub struct LinkSender<T> {
    tx: mpsc::UnboundedSender<Result<T, IpcError>>,
}

impl<T> Clone for LinkSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> LinkSender<T> {
    pub fn send(&self, message: T) -> Result<(), IpcError> {
        self.tx.send(Ok(message)).map_err(|_| IpcError::PeerGone)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One end of a bidirectional link
pub struct Duplex<Tx, Rx> {
    outbound: LinkSender<Tx>,
    inbound: mpsc::UnboundedReceiver<Result<Rx, IpcError>>,
}

/// Orchestrator end of a context link
pub type OrchestratorLink = Duplex<ContextMessage, OrchestratorMessage>;

/// Context end of a context link
pub type ContextLink = Duplex<OrchestratorMessage, ContextMessage>;

impl<Tx, Rx> Duplex<Tx, Rx> {
    pub fn send(&self, message: Tx) -> Result<(), IpcError> {
        self.outbound.send(message)
    }

    /// Next inbound message; `None` once the other end is gone
    pub async fn recv(&mut self) -> Option<Result<Rx, IpcError>> {
        self.inbound.recv().await
    }

    /// A cloneable handle for sending from other tasks
    pub fn sender(&self) -> LinkSender<Tx> {
        self.outbound.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    pub fn split(self) -> (LinkSender<Tx>, mpsc::UnboundedReceiver<Result<Rx, IpcError>>) {
        (self.outbound, self.inbound)
    }
}

/// Connected in-memory ends; what one sends the other receives in order
pub fn duplex_pair<A, B>() -> (Duplex<A, B>, Duplex<B, A>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Duplex {
            outbound: LinkSender { tx: a_tx },
            inbound: b_rx,
        },
        Duplex {
            outbound: LinkSender { tx: b_tx },
            inbound: a_rx,
        },
    )
}

/// Attach a duplex to a byte stream, spawning reader and writer pumps
///
/// The reader pump forwards the first error it hits and stops, so the
/// receiving side sees exactly one `Err` before the channel closes. A line
/// that is not a valid envelope counts: the peer can no longer be trusted.
pub fn attach_stream<Tx, Rx, R, W>(reader: R, writer: W) -> Duplex<Tx, Rx>
where
    Tx: Serialize + Send + 'static,
    Rx: DeserializeOwned + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Result<Tx, IpcError>>();

    tokio::spawn(async move {
        let mut writer = JsonLinesWriter::new(writer);
        while let Some(frame) = out_rx.recv().await {
            // Only the encoded bytes live across the write
            let line = {
                let Ok(message) = frame else { continue };
                match writer.framer().frame(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        log::warn!("Dropping outbound message: {}", e);
                        continue;
                    }
                }
            };
            if let Err(e) = writer.write_raw(&line).await {
                log::debug!("IPC writer stopped: {}", e);
                return;
            }
        }
        let _ = writer.close().await;
    });

    Duplex {
        outbound: LinkSender { tx: out_tx },
        inbound: spawn_reader(reader),
    }
}

fn spawn_reader<Rx, R>(reader: R) -> mpsc::UnboundedReceiver<Result<Rx, IpcError>>
where
    Rx: DeserializeOwned + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Result<Rx, IpcError>>();
    tokio::spawn(async move {
        let mut reader = JsonLinesReader::new(reader);
        loop {
            match reader.receive::<Rx>().await {
                Ok(envelope) => {
                    if in_tx.send(Ok(envelope.message)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    log::debug!("IPC reader stopped: {}", e);
                    let _ = in_tx.send(Err(e));
                    return;
                }
            }
        }
    });
    in_rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ContextError, ContextStatus};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_reader_keeps_buffered_lines() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, client_write) = tokio::io::split(client);

        let mut writer = JsonLinesWriter::new(client_write);
        for _ in 0..3 {
            writer
                .send(&ContextMessage::Ping {
                    correlation_id: Uuid::new_v4(),
                })
                .await
                .unwrap();
        }

        let mut reader = JsonLinesReader::new(server_read);
        for expected in 1..=3 {
            let envelope = reader.receive::<ContextMessage>().await.unwrap();
            assert_eq!(envelope.seq, expected);
        }
    }

    #[tokio::test]
    async fn test_reader_rejects_version_and_order() {
        let bad_version = r#"{"protocol_version":99,"seq":1,"timestamp":"2024-01-01T00:00:00Z","message":{"type":"shutdown"}}"#;
        let input = format!("{}\n", bad_version);
        let mut reader = JsonLinesReader::new(input.as_bytes());
        assert!(matches!(
            reader.receive::<ContextMessage>().await,
            Err(IpcError::VersionMismatch { actual: 99, .. })
        ));

        let replayed = r#"{"protocol_version":1,"seq":4,"timestamp":"2024-01-01T00:00:00Z","message":{"type":"shutdown"}}"#;
        let input = format!("{}\n{}\n", replayed, replayed);
        let mut reader = JsonLinesReader::new(input.as_bytes());
        assert!(reader.receive::<ContextMessage>().await.is_ok());
        assert!(matches!(
            reader.receive::<ContextMessage>().await,
            Err(IpcError::OutOfOrder { previous: 4, actual: 4 })
        ));
        assert!(matches!(
            reader.receive::<ContextMessage>().await,
            Err(IpcError::LinkClosed)
        ));
    }

    #[tokio::test]
    async fn test_malformed_line_ends_the_link() {
        let valid = r#"{"protocol_version":1,"seq":1,"timestamp":"2024-01-01T00:00:00Z","message":{"type":"shutdown"}}"#;
        let input = format!("stray print from a test\n{}\n", valid);
        let mut link: ContextLink =
            attach_stream(std::io::Cursor::new(input.into_bytes()), tokio::io::sink());

        assert!(matches!(link.recv().await, Some(Err(IpcError::Malformed(_)))));
        assert!(link.recv().await.is_none());
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn test_blocking_writer_needs_no_runtime() {
        let buffer = SharedBuffer::default();
        let (tx, rx) = mpsc::unbounded_channel::<Result<ContextMessage, IpcError>>();
        let writer = spawn_blocking_writer(rx, buffer.clone()).unwrap();

        // Nothing on this thread polls anything; the writer thread must flush on its own
        tx.send(Ok(ContextMessage::Shutdown)).unwrap();
        tx.send(Ok(ContextMessage::Shutdown)).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while buffer.lines().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let lines = buffer.lines();
        assert_eq!(lines.len(), 2);
        let second: MessageEnvelope<ContextMessage> = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(second.seq, 2);

        drop(tx);
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn test_duplex_pair_delivers_in_order() {
        let (mut orchestrator, mut context): (OrchestratorLink, ContextLink) = duplex_pair();

        orchestrator.send(ContextMessage::Shutdown).unwrap();
        let received = context.recv().await.unwrap().unwrap();
        assert!(matches!(received, ContextMessage::Shutdown));

        for files_run in 0..5 {
            let mut status = ContextStatus::new("c".to_string(), 1);
            status.files_run = files_run;
            context
                .send(OrchestratorMessage::Heartbeat { status })
                .unwrap();
        }
        for expected in 0..5 {
            match orchestrator.recv().await.unwrap().unwrap() {
                OrchestratorMessage::Heartbeat { status } => assert_eq!(status.files_run, expected),
                other => panic!("unexpected message {}", other.label()),
            }
        }

        drop(context);
        assert!(orchestrator.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_attached_streams_talk() {
        let (a, b) = tokio::io::duplex(8192);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let orchestrator: OrchestratorLink = attach_stream(a_read, a_write);
        let mut context: ContextLink = attach_stream(b_read, b_write);
        let mut orchestrator = orchestrator;

        orchestrator
            .send(ContextMessage::Ping {
                correlation_id: Uuid::nil(),
            })
            .unwrap();
        assert!(matches!(
            context.recv().await.unwrap().unwrap(),
            ContextMessage::Ping { .. }
        ));

        context
            .send(OrchestratorMessage::Error {
                error: ContextError::MessageParseError {
                    error: "bad".to_string(),
                },
            })
            .unwrap();
        assert!(matches!(
            orchestrator.recv().await.unwrap().unwrap(),
            OrchestratorMessage::Error { .. }
        ));

        drop(context);
        assert!(matches!(
            orchestrator.recv().await,
            Some(Err(IpcError::LinkClosed))
        ));
    }
}
