//! Terminal output streaming to WebSocket clients.
//!
//! The output pump drains a backend's [`OutputStream`] into `output` frames.
//! Bytes accumulate until either the flush interval elapses or the buffer
//! reaches the chunk size. Each flushed chunk also feeds the line detector,
//! whose signals follow the chunk's output frame.

use qterm_protocol::{Frame, PlacementHint};
use qterm_session::{LineDetector, OutputStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::StreamConfig;
use crate::websocket::Outbound;

/// Why an output pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// The backend's output ended.
    Eof,
    /// Reading the backend failed.
    ReadFailed(String),
    /// Asked to stop by its owner.
    Stopped,
    /// The connection's writer is gone.
    ChannelClosed,
}

/// A running pump and the token that stops it.
#[derive(Debug)]
pub struct PumpHandle {
    task: JoinHandle<PumpExit>,
    stop: CancellationToken,
}

impl PumpHandle {
    /// Waits for the pump to exit on its own.
    pub async fn join(&mut self) -> PumpExit {
        match (&mut self.task).await {
            Ok(exit) => exit,
            Err(e) => PumpExit::ReadFailed(format!("output pump task failed: {e}")),
        }
    }

    /// Flushes what is buffered and stops, aborting after `grace`.
    pub async fn stop(mut self, grace: std::time::Duration) -> Option<PumpExit> {
        self.stop.cancel();
        match tokio::time::timeout(grace, self.join()).await {
            Ok(exit) => Some(exit),
            Err(_) => {
                self.task.abort();
                None
            }
        }
    }
}

/// Starts a pump that owns `output` and `detector` until it exits.
pub fn start_output_pump(
    output: OutputStream,
    tx: mpsc::Sender<Outbound>,
    detector: LineDetector,
    placement: PlacementHint,
    config: &StreamConfig,
) -> PumpHandle {
    let stop = CancellationToken::new();
    let pump = OutputPump {
        output,
        tx,
        detector,
        placement,
        buffer: Vec::with_capacity(config.chunk_size),
        chunk_size: config.chunk_size.max(1),
        flush_interval: config.flush_interval(),
        stop: stop.clone(),
    };
    PumpHandle {
        task: tokio::spawn(pump.run()),
        stop,
    }
}

enum PumpEvent {
    Tick,
    Read(std::io::Result<usize>),
    Stop,
}

struct OutputPump {
    output: OutputStream,
    tx: mpsc::Sender<Outbound>,
    detector: LineDetector,
    placement: PlacementHint,
    buffer: Vec<u8>,
    chunk_size: usize,
    flush_interval: std::time::Duration,
    stop: CancellationToken,
}

impl OutputPump {
    async fn run(mut self) -> PumpExit {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut read_buf = vec![0u8; self.chunk_size];
        loop {
            // Never below 1: a full buffer is flushed before the next read and
            // at most 3 bytes of an incomplete character are held back.
            let room = self.chunk_size.saturating_sub(self.buffer.len()).max(1);

            let event = tokio::select! {
                _ = self.stop.cancelled() => PumpEvent::Stop,
                _ = ticker.tick() => PumpEvent::Tick,
                read = self.output.read(&mut read_buf[..room]) => PumpEvent::Read(read),
            };

            match event {
                PumpEvent::Tick => {
                    if !self.buffer.is_empty() && !self.flush(false).await {
                        return PumpExit::ChannelClosed;
                    }
                }
                PumpEvent::Read(Ok(0)) => return self.finish(PumpExit::Eof).await,
                PumpEvent::Read(Ok(n)) => {
                    self.buffer.extend_from_slice(&read_buf[..n]);
                    if self.buffer.len() >= self.chunk_size && !self.flush(false).await {
                        return PumpExit::ChannelClosed;
                    }
                }
                PumpEvent::Read(Err(e)) => {
                    return self.finish(PumpExit::ReadFailed(e.to_string())).await;
                }
                PumpEvent::Stop => {
                    if !self.flush(true).await {
                        return PumpExit::ChannelClosed;
                    }
                    return PumpExit::Stopped;
                }
            }
        }
    }

    /// Emits the buffer as one output frame, followed by any detected signals.
    ///
    /// Unless `force`d, an incomplete UTF-8 sequence at the end stays buffered.
    /// Returns `false` when the writer is gone.
    async fn flush(&mut self, force: bool) -> bool {
        let cut = if force {
            self.buffer.len()
        } else {
            complete_prefix_len(&self.buffer)
        };
        if cut == 0 {
            return true;
        }

        let chunk: Vec<u8> = self.buffer.drain(..cut).collect();
        let text = String::from_utf8_lossy(&chunk).into_owned();
        if self.tx.send(Outbound::Frame(Frame::output(text))).await.is_err() {
            return false;
        }

        for kind in self.detector.feed(&chunk) {
            debug!(signal = %kind, "command signal detected");
            let frame = Frame::signal(kind, self.placement);
            if self.tx.send(Outbound::Frame(frame)).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Final flush, then a diagnostic describing why reading stopped.
    async fn finish(mut self, exit: PumpExit) -> PumpExit {
        if !self.flush(true).await {
            return PumpExit::ChannelClosed;
        }

        let reason = match &exit {
            PumpExit::ReadFailed(reason) => reason.as_str(),
            _ => "EOF",
        };
        let diagnostic = Frame::diagnostic(format!("Terminal read error: {reason}"));
        if self.tx.send(Outbound::Frame(diagnostic)).await.is_err() {
            return PumpExit::ChannelClosed;
        }
        debug!(exit = ?exit, "output pump finished");
        exit
    }
}

/// Length of the longest prefix of `buf` that does not end inside a UTF-8 sequence.
fn complete_prefix_len(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(4) {
        let byte = buf[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use qterm_protocol::SignalKind;
    use qterm_session::SignalTable;
    use qterm_session::signal::DEFAULT_MAX_LINE_LEN;
    use tokio::time::Instant;

    use super::*;

    struct Harness {
        input: mpsc::Sender<io::Result<Bytes>>,
        frames: mpsc::Receiver<Outbound>,
        pump: PumpHandle,
    }

    fn harness(chunk_size: usize) -> Harness {
        let (input, rx) = mpsc::channel(16);
        let (tx, frames) = mpsc::channel(64);
        let config = StreamConfig {
            flush_interval_ms: 50,
            chunk_size,
        };
        let detector = LineDetector::new(Arc::new(SignalTable::default()), DEFAULT_MAX_LINE_LEN);
        let pump = start_output_pump(
            OutputStream::new(rx),
            tx,
            detector,
            PlacementHint::default(),
            &config,
        );
        Harness {
            input,
            frames,
            pump,
        }
    }

    async fn next_frame(frames: &mut mpsc::Receiver<Outbound>) -> Frame {
        match frames.recv().await {
            Some(Outbound::Frame(frame)) => frame,
            Some(Outbound::Ping) => panic!("unexpected ping"),
            None => panic!("pump closed the channel"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_interval() {
        let mut h = harness(4096);
        let start = Instant::now();
        h.input.send(Ok(Bytes::from_static(b"hello"))).await.unwrap();

        assert_eq!(next_frame(&mut h.frames).await, Frame::output("hello"));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesces_reads_within_interval() {
        let mut h = harness(4096);
        h.input.send(Ok(Bytes::from_static(b"one "))).await.unwrap();
        h.input.send(Ok(Bytes::from_static(b"two"))).await.unwrap();

        assert_eq!(next_frame(&mut h.frames).await, Frame::output("one two"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_at_chunk_size() {
        let mut h = harness(8);
        let start = Instant::now();
        h.input
            .send(Ok(Bytes::from_static(b"0123456789")))
            .await
            .unwrap();

        assert_eq!(next_frame(&mut h.frames).await, Frame::output("01234567"));
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(next_frame(&mut h.frames).await, Frame::output("89"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_holds_back_split_character() {
        let mut h = harness(4096);
        h.input.send(Ok(Bytes::from_static(b"h\xc3"))).await.unwrap();
        assert_eq!(next_frame(&mut h.frames).await, Frame::output("h"));

        h.input
            .send(Ok(Bytes::from_static(b"\xa9llo")))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut h.frames).await, Frame::output("\u{e9}llo"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eof_flushes_and_reports() {
        let mut h = harness(4096);
        h.input.send(Ok(Bytes::from_static(b"partial"))).await.unwrap();
        drop(h.input);

        assert_eq!(next_frame(&mut h.frames).await, Frame::output("partial"));
        assert_eq!(
            next_frame(&mut h.frames).await,
            Frame::diagnostic("Terminal read error: EOF")
        );
        assert_eq!(h.pump.join().await, PumpExit::Eof);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_reports_cause() {
        let mut h = harness(4096);
        h.input
            .send(Err(io::Error::other("input/output error")))
            .await
            .unwrap();

        assert_eq!(
            next_frame(&mut h.frames).await,
            Frame::diagnostic("Terminal read error: input/output error")
        );
        assert_eq!(
            h.pump.join().await,
            PumpExit::ReadFailed("input/output error".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_follows_output() {
        let mut h = harness(4096);
        h.input
            .send(Ok(Bytes::from_static(b"git status\r\n")))
            .await
            .unwrap();

        assert_eq!(
            next_frame(&mut h.frames).await,
            Frame::output("git status\r\n")
        );
        assert_eq!(
            next_frame(&mut h.frames).await,
            Frame::Signal {
                kind: SignalKind::DnaHelix,
                x: 10,
                y: 10
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_without_diagnostic() {
        let mut h = harness(4096);
        h.input.send(Ok(Bytes::from_static(b"tail"))).await.unwrap();
        tokio::task::yield_now().await;

        // Let the pump buffer the read before stopping it.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let exit = h.pump.stop(Duration::from_secs(2)).await;
        assert_eq!(exit, Some(PumpExit::Stopped));

        assert_eq!(next_frame(&mut h.frames).await, Frame::output("tail"));
        assert!(h.frames.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_writer_stops_pump() {
        let mut h = harness(4096);
        drop(h.frames);
        h.input.send(Ok(Bytes::from_static(b"lost"))).await.unwrap();
        assert_eq!(h.pump.join().await, PumpExit::ChannelClosed);
    }

    #[test]
    fn test_complete_prefix_len() {
        assert_eq!(complete_prefix_len(b""), 0);
        assert_eq!(complete_prefix_len(b"abc"), 3);
        assert_eq!(complete_prefix_len("h\u{e9}".as_bytes()), 3);
        assert_eq!(complete_prefix_len(b"h\xc3"), 1);
        assert_eq!(complete_prefix_len(b"a\xe2\x82"), 1);
        assert_eq!(complete_prefix_len(b"a\xf0\x9f\x98"), 1);
        assert_eq!(complete_prefix_len("a\u{1f600}".as_bytes()), 5);
        // Stray continuation bytes are not held back.
        assert_eq!(complete_prefix_len(b"\x80\x80\x80\x80"), 4);
    }
}
