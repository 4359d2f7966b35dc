//! Duplex pump — move lines between a stream and the local console.
//!
//! [`run_pump`] splits a [`DuplexChannel`] into its read and write halves
//! and runs two tasks over them:
//!
//! - **receive**: reads newline-delimited lines off the stream and emits them
//!   to a [`LineSink`]. A bare newline is swallowed. Bytes that are not valid
//!   UTF-8 are replaced, never dropped. End of stream (or a read error, which
//!   means the same thing here) ends the loop quietly. A line longer than the
//!   reader's limit is a framing error and also ends the loop.
//! - **send**: reads lines from local input, writes each one to the stream
//!   with a single `\n` terminator and flushes before reading the next. The
//!   line's bytes are forwarded as they are. A local input failure, end of
//!   input included, is logged and ends the loop.
//!
//! When either loop ends it signals the other, and a shutdown signal from
//! the caller stops both. Once both have exited the stream's write side is
//! closed.

use crate::error::{WireError, WireResult};

use futures::io::{
    AsyncBufReadExt as _, AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _,
    BufReader, BufWriter, ReadHalf, WriteHalf,
};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead as LocalInput, AsyncBufReadExt as _};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Longest line accepted from a peer, delimiter included.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Buffered line reader over the input side of a stream.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: BufReader<R>,
    max_line: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_line(reader, MAX_LINE_BYTES)
    }

    /// Reader that rejects lines longer than `max_line` bytes.
    pub fn with_max_line(reader: R, max_line: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_line: max_line.max(1),
        }
    }

    /// Next line as raw bytes, delimiter included. `Ok(None)` at end of
    /// stream. A line that hits the length limit without a delimiter is an
    /// `InvalidData` error.
    pub async fn read_line_bytes(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let limit = self.max_line as u64;
        let n = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if n == self.max_line && !line.ends_with(b"\n") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds {} bytes", self.max_line),
            ));
        }
        Ok(Some(line))
    }

    /// Next line decoded as UTF-8, invalid sequences replaced.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        Ok(self
            .read_line_bytes()
            .await?
            .map(|line| String::from_utf8_lossy(&line).into_owned()))
    }
}

/// Buffered writer over the output side of a stream. Every line is flushed.
#[derive(Debug)]
pub struct LineWriter<W> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: BufWriter::new(writer),
        }
    }

    /// Write `line` followed by `\n`, then flush.
    pub async fn write_line(&mut self, line: impl AsRef<[u8]>) -> io::Result<()> {
        self.inner.write_all(line.as_ref()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await
    }

    /// Flush and close the underlying writer.
    pub async fn close(&mut self) -> io::Result<()> {
        self.inner.close().await
    }

    pub fn get_ref(&self) -> &W {
        self.inner.get_ref()
    }
}

/// A stream wrapped for line-oriented reads and flush-on-write.
#[derive(Debug)]
pub struct DuplexChannel<S> {
    reader: LineReader<ReadHalf<S>>,
    writer: LineWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> DuplexChannel<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = stream.split();
        Self {
            reader: LineReader::new(reader),
            writer: LineWriter::new(writer),
        }
    }

    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        self.reader.read_line().await
    }

    pub async fn write_line(&mut self, line: impl AsRef<[u8]>) -> io::Result<()> {
        self.writer.write_line(line).await
    }

    /// Split into independently owned halves.
    pub fn into_halves(self) -> (LineReader<ReadHalf<S>>, LineWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

/// Local destination for lines received from the peer.
pub trait LineSink: Send + 'static {
    fn emit(&mut self, line: &str) -> io::Result<()>;
}

impl LineSink for mpsc::UnboundedSender<String> {
    fn emit(&mut self, line: &str) -> io::Result<()> {
        self.send(line.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "line sink closed"))
    }
}

/// Relay stream lines to `sink` until the stream ends.
pub async fn receive_loop<R, O>(reader: &mut LineReader<R>, sink: &mut O)
where
    R: AsyncRead + Unpin,
    O: LineSink + ?Sized,
{
    loop {
        let line = match reader.read_line_bytes().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Stream closed by peer");
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(error = %e, "Dropping stream with oversized line");
                return;
            }
            Err(e) => {
                debug!(error = %e, "Stream read failed, treating as closed");
                return;
            }
        };

        if line == b"\n" {
            continue;
        }
        let text = String::from_utf8_lossy(strip_newline(&line));
        if let Err(e) = sink.emit(&text) {
            debug!(error = %e, "Local output closed");
            return;
        }
    }
}

/// Relay local input lines to the stream until input fails or the stream
/// stops accepting writes. Only the former is an error.
pub async fn send_loop<I, W>(input: &mut I, writer: &mut LineWriter<W>) -> WireResult<()>
where
    I: LocalInput + Unpin + ?Sized,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        match input.read_until(b'\n', &mut line).await {
            Ok(0) => {
                let e = io::Error::new(io::ErrorKind::UnexpectedEof, "local input closed");
                warn!(error = %e, "Local input ended");
                return Err(WireError::LocalInput(e));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Reading local input failed");
                return Err(WireError::LocalInput(e));
            }
        }

        if let Err(e) = writer.write_line(strip_newline(&line)).await {
            debug!(error = %e, "Stream write failed");
            return Ok(());
        }
    }
}

fn strip_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// How a pump loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Hit its own termination condition.
    Finished,
    /// Stopped by the other loop or by the caller's shutdown signal.
    Stopped,
}

/// Outcome of a pump run.
#[derive(Debug)]
pub struct PumpReport {
    pub receive: LoopExit,
    pub send: LoopExit,
    /// Set when the send loop ended on a local input failure.
    pub send_error: Option<WireError>,
}

/// Handle to a running pump.
#[derive(Debug)]
pub struct PumpHandle {
    task: JoinHandle<PumpReport>,
}

impl PumpHandle {
    /// Wait for both loops to exit and the stream to be closed.
    pub async fn join(self) -> WireResult<PumpReport> {
        self.task.await.map_err(|e| WireError::Task(e.to_string()))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start the receive and send loops over `channel`.
///
/// `input` is the local line source, `sink` the local output. Setting
/// `shutdown` to `true` stops both loops.
pub fn run_pump<S, I, O>(
    channel: DuplexChannel<S>,
    input: I,
    sink: O,
    shutdown: watch::Receiver<bool>,
) -> PumpHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    I: LocalInput + Unpin + Send + 'static,
    O: LineSink,
{
    let (mut reader, mut writer) = channel.into_halves();
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    let receive = {
        let stop_tx = Arc::clone(&stop_tx);
        let mut stop = stop_rx.clone();
        let mut shutdown = shutdown.clone();
        let mut sink = sink;
        tokio::spawn(async move {
            let exit = tokio::select! {
                _ = receive_loop(&mut reader, &mut sink) => LoopExit::Finished,
                _ = stopped(&mut stop) => LoopExit::Stopped,
                _ = stopped(&mut shutdown) => LoopExit::Stopped,
            };
            let _ = stop_tx.send(true);
            exit
        })
    };

    let send = {
        let mut stop = stop_rx;
        let mut shutdown = shutdown;
        let mut input = input;
        tokio::spawn(async move {
            let (exit, error) = tokio::select! {
                result = send_loop(&mut input, &mut writer) => (LoopExit::Finished, result.err()),
                _ = stopped(&mut stop) => (LoopExit::Stopped, None),
                _ = stopped(&mut shutdown) => (LoopExit::Stopped, None),
            };
            let _ = stop_tx.send(true);
            (writer, exit, error)
        })
    };

    let task = tokio::spawn(async move {
        let (receive, send) = tokio::join!(receive, send);

        let receive = receive.unwrap_or_else(|e| {
            warn!(error = %e, "Receive loop panicked");
            LoopExit::Stopped
        });
        let (send, send_error) = match send {
            Ok((mut writer, exit, error)) => {
                if let Err(e) = writer.close().await {
                    debug!(error = %e, "Closing stream failed");
                }
                (exit, error)
            }
            Err(e) => {
                warn!(error = %e, "Send loop panicked");
                (LoopExit::Stopped, None)
            }
        };

        debug!(receive = ?receive, send = ?send, "Pump finished");
        PumpReport {
            receive,
            send,
            send_error,
        }
    });

    PumpHandle { task }
}

/// Resolve once `signal` turns `true`. A dropped sender never resolves.
async fn stopped(signal: &mut watch::Receiver<bool>) {
    let closed = signal.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    /// In-memory stream: reads from a fixed buffer (or never, if `None`),
    /// records writes and whether it was closed.
    struct MemoryStream {
        incoming: Option<Cursor<Vec<u8>>>,
        outgoing: Arc<Mutex<Vec<u8>>>,
        closed: Arc<AtomicBool>,
    }

    impl MemoryStream {
        fn new(incoming: Option<&[u8]>) -> (Self, Arc<Mutex<Vec<u8>>>, Arc<AtomicBool>) {
            let outgoing = Arc::new(Mutex::new(Vec::new()));
            let closed = Arc::new(AtomicBool::new(false));
            let stream = Self {
                incoming: incoming.map(|b| Cursor::new(b.to_vec())),
                outgoing: Arc::clone(&outgoing),
                closed: Arc::clone(&closed),
            };
            (stream, outgoing, closed)
        }
    }

    impl AsyncRead for MemoryStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            match self.incoming.as_mut() {
                Some(cursor) => Pin::new(cursor).poll_read(cx, buf),
                None => Poll::Pending,
            }
        }
    }

    impl AsyncWrite for MemoryStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.outgoing.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.closed.store(true, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_receive_skips_bare_newlines() {
        let mut reader = LineReader::new(&b"hello\n\n\nworld\n"[..]);
        let (mut tx, mut rx) = mpsc::unbounded_channel();

        receive_loop(&mut reader, &mut tx).await;
        assert_eq!(drain(&mut rx), vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn test_receive_keeps_unterminated_last_line() {
        let mut reader = LineReader::new(&b"one\r\ntwo"[..]);
        let (mut tx, mut rx) = mpsc::unbounded_channel();

        receive_loop(&mut reader, &mut tx).await;
        assert_eq!(drain(&mut rx), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_receive_replaces_invalid_utf8_and_keeps_going() {
        let mut reader = LineReader::new(&b"caf\xe9\nstill here\n"[..]);
        let (mut tx, mut rx) = mpsc::unbounded_channel();

        receive_loop(&mut reader, &mut tx).await;
        assert_eq!(drain(&mut rx), vec!["caf\u{FFFD}", "still here"]);
    }

    #[tokio::test]
    async fn test_oversized_line_is_framing_error() {
        let mut reader = LineReader::with_max_line(&b"ok\n0123456789abcdef\nlater\n"[..], 8);
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("ok\n"));
        let err = reader.read_line_bytes().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_receive_stops_at_oversized_line() {
        let mut reader = LineReader::with_max_line(&b"ok\n0123456789abcdef\nlater\n"[..], 8);
        let (mut tx, mut rx) = mpsc::unbounded_channel();

        receive_loop(&mut reader, &mut tx).await;
        assert_eq!(drain(&mut rx), vec!["ok"]);
    }

    #[tokio::test]
    async fn test_line_at_exact_limit_accepted() {
        let mut reader = LineReader::with_max_line(&b"abc\n"[..], 4);
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("abc\n"));
        assert_eq!(reader.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_forwards_non_utf8_bytes() {
        let mut input: &[u8] = b"caf\xe9\nnext\n";
        let mut writer = LineWriter::new(Vec::new());

        let result = send_loop(&mut input, &mut writer).await;
        assert!(matches!(result, Err(WireError::LocalInput(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof));
        assert_eq!(writer.get_ref().as_slice(), b"caf\xe9\nnext\n");
    }

    #[tokio::test]
    async fn test_send_appends_single_newline_and_fails_on_eof() {
        let mut input: &[u8] = b"hi\n\nlast";
        let mut writer = LineWriter::new(Vec::new());

        let result = send_loop(&mut input, &mut writer).await;
        assert!(matches!(result, Err(WireError::LocalInput(_))));
        assert_eq!(writer.get_ref().as_slice(), b"hi\n\nlast\n");
    }

    #[tokio::test]
    async fn test_peer_close_stops_send_and_closes_stream() {
        let (stream, _outgoing, closed) = MemoryStream::new(Some(&b"a\n\nb\n"[..]));
        // Local input that stays open and silent.
        let (_keep_open, local) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = run_pump(
            DuplexChannel::new(stream),
            tokio::io::BufReader::new(local),
            tx,
            shutdown_rx,
        );
        let report = pump.join().await.unwrap();

        assert_eq!(report.receive, LoopExit::Finished);
        assert_eq!(report.send, LoopExit::Stopped);
        assert!(report.send_error.is_none());
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(drain(&mut rx), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_local_input_end_stops_receive() {
        let (stream, outgoing, closed) = MemoryStream::new(None);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = run_pump(DuplexChannel::new(stream), &b"bye\n"[..], tx, shutdown_rx);
        let report = pump.join().await.unwrap();

        assert_eq!(report.send, LoopExit::Finished);
        assert!(matches!(report.send_error, Some(WireError::LocalInput(_))));
        assert_eq!(report.receive, LoopExit::Stopped);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(outgoing.lock().unwrap().as_slice(), b"bye\n");
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_both_loops() {
        let (stream, _outgoing, closed) = MemoryStream::new(None);
        let (_keep_open, local) = tokio::io::duplex(64);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = run_pump(
            DuplexChannel::new(stream),
            tokio::io::BufReader::new(local),
            tx,
            shutdown_rx,
        );
        tokio::task::yield_now().await;
        assert!(!pump.is_finished());

        shutdown_tx.send(true).unwrap();
        let report = pump.join().await.unwrap();
        assert_eq!(report.receive, LoopExit::Stopped);
        assert_eq!(report.send, LoopExit::Stopped);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_channel_line_round_trip() {
        let (stream, outgoing, _closed) = MemoryStream::new(Some(&b"ping\n"[..]));
        let mut channel = DuplexChannel::new(stream);

        assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("ping\n"));
        assert_eq!(channel.read_line().await.unwrap(), None);
        channel.write_line("pong").await.unwrap();
        assert_eq!(outgoing.lock().unwrap().as_slice(), b"pong\n");
    }
}
