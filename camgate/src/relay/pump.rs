//! Generic stream pump: reads chunks or lines from an upstream source and
//! forwards them, in order and without batching, to a client-facing body
//! channel. Optionally injects keep-alive frames while the source is idle.
//!
//! Closure of the client side of the channel is the universal cancellation
//! signal for a relay: the pump stops reading and returns as soon as a send
//! fails.

use std::io;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// How the pump frames upstream data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    /// Fixed-size reads forwarded verbatim; sized to match the transport's
    /// packet boundaries.
    Chunk { size: usize },
    /// One terminated line per frame, forwarded the moment it completes.
    /// SSE framing is line-oriented and clients expect sub-frame latency.
    Line,
}

/// Keep-alive injection: after `idle` without source data, emit `frame` and
/// reset the idle clock.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    pub idle: Duration,
    pub frame: Bytes,
}

/// Why a pump run ended. None of these are errors from the pump's point of
/// view; the caller decides what each means for its session.
#[derive(Debug)]
pub enum PumpEnd {
    /// Source reached end of stream.
    SourceEof,
    /// Source read failed.
    SourceError(io::Error),
    /// Client side of the channel closed (peer disconnected).
    ClientGone,
    /// Explicit cancellation.
    Cancelled,
}

/// Marker error for a closed client channel.
#[derive(Debug)]
pub struct ClientGone;

/// Sending half of a relay: a bounded channel whose receiving half backs the
/// HTTP response body. Bounded capacity keeps the relay unbuffered in
/// practice and makes peer disconnects visible on the next send.
#[derive(Clone)]
pub struct RelaySink {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl RelaySink {
    /// Create a sink and the response `Body` fed by it.
    pub fn channel(capacity: usize) -> (Self, Body) {
        let (tx, rx) = mpsc::channel(capacity);
        let body = Body::from_stream(ReceiverStream::new(rx));
        (Self { tx }, body)
    }

    /// Forward one frame; fails once the client has disconnected.
    pub async fn send(&self, frame: Bytes) -> Result<(), ClientGone> {
        self.tx.send(Ok(frame)).await.map_err(|_| ClientGone)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the client has disconnected. Lets the pump notice a
    /// gone client even while the source is idle.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

/// The relay engine. Construct with a mode, optionally attach a keep-alive
/// policy and a cancellation token, then [`run`](Self::run) it over a source.
pub struct StreamPump {
    mode: PumpMode,
    keepalive: Option<KeepAlive>,
    cancel: CancellationToken,
}

impl StreamPump {
    pub fn new(mode: PumpMode) -> Self {
        Self {
            mode,
            keepalive: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_keepalive(mut self, keepalive: KeepAlive) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Relay `source` into `sink` until EOF, source error, client disconnect,
    /// or cancellation. Never panics; every successful read is either fully
    /// forwarded or the pump terminates.
    pub async fn run<R>(&self, source: R, sink: &RelaySink) -> PumpEnd
    where
        R: AsyncRead + Unpin,
    {
        match self.mode {
            PumpMode::Chunk { size } => self.run_chunks(source, sink, size).await,
            PumpMode::Line => self.run_lines(source, sink).await,
        }
    }

    fn idle_period(&self) -> Duration {
        // The sleep branch is disabled when no keep-alive is configured; the
        // fallback only keeps the deadline arithmetic total.
        self.keepalive
            .as_ref()
            .map(|ka| ka.idle)
            .unwrap_or(Duration::from_secs(3600))
    }

    async fn run_chunks<R>(&self, mut source: R, sink: &RelaySink, size: usize) -> PumpEnd
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; size];
        let idle = self.idle_period();
        let mut deadline = Instant::now() + idle;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                _ = sink.closed() => return PumpEnd::ClientGone,
                _ = sleep_until(deadline), if self.keepalive.is_some() => {
                    if let Some(keepalive) = &self.keepalive
                        && sink.send(keepalive.frame.clone()).await.is_err()
                    {
                        return PumpEnd::ClientGone;
                    }
                    deadline = Instant::now() + idle;
                }
                read = source.read(&mut buf) => match read {
                    Ok(0) => return PumpEnd::SourceEof,
                    Ok(n) => {
                        if sink.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            return PumpEnd::ClientGone;
                        }
                        deadline = Instant::now() + idle;
                    }
                    Err(e) => return PumpEnd::SourceError(e),
                },
            }
        }
    }

    async fn run_lines<R>(&self, source: R, sink: &RelaySink) -> PumpEnd
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(source);
        // Persists across keep-alive wakeups: a partially read line is
        // appended here and completed by the next read_until call.
        let mut line: Vec<u8> = Vec::new();
        let idle = self.idle_period();
        let mut deadline = Instant::now() + idle;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                _ = sink.closed() => return PumpEnd::ClientGone,
                _ = sleep_until(deadline), if self.keepalive.is_some() => {
                    if let Some(keepalive) = &self.keepalive
                        && sink.send(keepalive.frame.clone()).await.is_err()
                    {
                        return PumpEnd::ClientGone;
                    }
                    deadline = Instant::now() + idle;
                }
                read = reader.read_until(b'\n', &mut line) => match read {
                    Ok(0) => {
                        // EOF; flush any unterminated trailing line.
                        if !line.is_empty()
                            && sink.send(Bytes::from(std::mem::take(&mut line))).await.is_err()
                        {
                            return PumpEnd::ClientGone;
                        }
                        return PumpEnd::SourceEof;
                    }
                    Ok(_) => {
                        if sink.send(Bytes::from(std::mem::take(&mut line))).await.is_err() {
                            return PumpEnd::ClientGone;
                        }
                        deadline = Instant::now() + idle;
                    }
                    Err(e) => return PumpEnd::SourceError(e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    fn collect_body(body: Body) -> tokio::task::JoinHandle<Vec<Bytes>> {
        tokio::spawn(async move {
            let mut stream = body.into_data_stream();
            let mut frames = Vec::new();
            while let Some(frame) = stream.next().await {
                frames.push(frame.unwrap());
            }
            frames
        })
    }

    #[tokio::test]
    async fn chunk_mode_forwards_all_bytes_in_order() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (sink, body) = RelaySink::channel(8);
        let collector = collect_body(body);

        let input: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let to_write = input.clone();
        let write_task = tokio::spawn(async move {
            for piece in to_write.chunks(97) {
                writer.write_all(piece).await.unwrap();
            }
            // Dropping the writer ends the stream.
        });

        let pump = StreamPump::new(PumpMode::Chunk { size: 1024 });
        let end = pump.run(reader, &sink).await;
        assert!(matches!(end, PumpEnd::SourceEof));
        drop(sink);

        write_task.await.unwrap();
        let frames = collector.await.unwrap();
        let output: Vec<u8> = frames.concat();
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn line_mode_forwards_one_frame_per_line() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (sink, body) = RelaySink::channel(8);
        let collector = collect_body(body);

        tokio::spawn(async move {
            writer.write_all(b"a\nbb\n\nccc").await.unwrap();
        });

        let pump = StreamPump::new(PumpMode::Line);
        let end = pump.run(reader, &sink).await;
        assert!(matches!(end, PumpEnd::SourceEof));
        drop(sink);

        let frames = collector.await.unwrap();
        let frames: Vec<&[u8]> = frames.iter().map(|b| b.as_ref()).collect();
        assert_eq!(frames, vec![&b"a\n"[..], b"bb\n", b"\n", b"ccc"]);
    }

    #[tokio::test]
    async fn stops_reading_once_client_is_gone() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (sink, body) = RelaySink::channel(1);
        drop(body);

        tokio::spawn(async move {
            let _ = writer.write_all(&[0u8; 4096]).await;
        });

        let pump = StreamPump::new(PumpMode::Chunk { size: 16 });
        let end = pump.run(reader, &sink).await;
        assert!(matches!(end, PumpEnd::ClientGone));
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn idle_source_still_detects_client_disconnect() {
        // Connected source that never produces a byte, no keep-alive: the
        // pump must not sit in the read forever once the client is gone.
        let (_writer, reader) = tokio::io::duplex(64);
        let (sink, body) = RelaySink::channel(8);

        let pump_task = tokio::spawn(async move {
            StreamPump::new(PumpMode::Chunk { size: 16 })
                .run(reader, &sink)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(body);

        let end = tokio::time::timeout(Duration::from_secs(5), pump_task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(end, PumpEnd::ClientGone));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_emitted_once_per_idle_threshold() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (sink, body) = RelaySink::channel(8);
        let mut stream = body.into_data_stream();

        let pump_task = tokio::spawn(async move {
            let pump = StreamPump::new(PumpMode::Line).with_keepalive(KeepAlive {
                idle: Duration::from_secs(15),
                frame: Bytes::from_static(b": keep-alive\n\n"),
            });
            pump.run(reader, &sink).await
        });

        let start = Instant::now();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b": keep-alive\n\n");
        assert!(start.elapsed() >= Duration::from_secs(15));

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(&second[..], b": keep-alive\n\n");
        assert!(start.elapsed() >= Duration::from_secs(30));

        // Real data resets the idle clock and is forwarded as-is.
        writer.write_all(b"data: x\n").await.unwrap();
        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(&third[..], b"data: x\n");

        drop(writer);
        let end = pump_task.await.unwrap();
        assert!(matches!(end, PumpEnd::SourceEof));
    }

    #[tokio::test]
    async fn cancellation_stops_the_pump() {
        let (_writer, reader) = tokio::io::duplex(64);
        let (sink, _body) = RelaySink::channel(8);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let pump =
            StreamPump::new(PumpMode::Chunk { size: 16 }).with_cancellation(cancel);
        let end = pump.run(reader, &sink).await;
        assert!(matches!(end, PumpEnd::Cancelled));
    }
}
