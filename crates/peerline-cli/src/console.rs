//! Console adapters: stdin as the pump's line source, stdout as its sink.

use colored::Colorize;
use peerline_wire::LineSink;
use std::io::{self, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, BufReader, ReadBuf, Stdin};

pub const PROMPT: &str = "> ";

/// Prints received lines in green, each followed by a fresh prompt.
pub struct ConsoleSink<W> {
    out: W,
}

impl ConsoleSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn prompt(&mut self) -> io::Result<()> {
        self.out.write_all(PROMPT.as_bytes())?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send + 'static> LineSink for ConsoleSink<W> {
    fn emit(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.out, "{}", line.green())?;
        self.prompt()
    }
}

/// Line input that prints a prompt before each line is read.
///
/// The prompt is written on the first fill after a newline has been
/// consumed (and on the very first fill).
pub struct PromptedInput<R, W> {
    inner: R,
    out: W,
    prompt_due: bool,
    newline_at: Option<usize>,
}

impl<R, W> PromptedInput<R, W> {
    pub fn new(inner: R, out: W) -> Self {
        Self {
            inner,
            out,
            prompt_due: true,
            newline_at: None,
        }
    }

    pub fn writer(&self) -> &W {
        &self.out
    }
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for PromptedInput<R, W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<R: AsyncBufRead + Unpin, W: Write + Unpin> AsyncBufRead for PromptedInput<R, W> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        if this.prompt_due {
            this.prompt_due = false;
            // A console that can't show the prompt can still be read from.
            let _ = this
                .out
                .write_all(PROMPT.as_bytes())
                .and_then(|()| this.out.flush());
        }
        let buf = ready!(Pin::new(&mut this.inner).poll_fill_buf(cx))?;
        this.newline_at = buf.iter().position(|b| *b == b'\n');
        Poll::Ready(Ok(buf))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.get_mut();
        if this.newline_at.is_some_and(|at| at < amt) {
            this.prompt_due = true;
        }
        this.newline_at = None;
        Pin::new(&mut this.inner).consume(amt);
    }
}

/// Buffered stdin for the send loop, prompting on stdout.
pub fn stdin_lines() -> PromptedInput<BufReader<Stdin>, io::Stdout> {
    PromptedInput::new(BufReader::new(tokio::io::stdin()), io::stdout())
}
