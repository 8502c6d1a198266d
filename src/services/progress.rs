//! Transfer progress rendering.
//!
//! Purely cosmetic: rendering failures are ignored and a discarded sink has
//! no effect on the bytes being transferred.

use std::{
    fmt,
    io::{self, Write},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Instant,
};
use tokio::io::{AsyncRead, ReadBuf};

/// Total rendered width of one progress line, in columns.
pub const PROGRESS_BAR_WIDTH: usize = 80;

/// Shared destination for human-readable progress text.
#[derive(Clone)]
pub struct ProgressSink {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ProgressSink {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
        }
    }

    pub fn discard() -> Self {
        Self::new(io::sink())
    }

    fn render(&self, text: &str) {
        if let Ok(mut out) = self.out.lock() {
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSink").finish_non_exhaustive()
    }
}

/// Byte-count progress bar with a known total.
struct ProgressBar {
    sink: ProgressSink,
    total: u64,
    done: u64,
    started: Instant,
    last_permille: Option<u64>,
    finished: bool,
}

impl ProgressBar {
    fn start(sink: ProgressSink, total: u64) -> Self {
        let mut bar = Self {
            sink,
            total,
            done: 0,
            started: Instant::now(),
            last_permille: None,
            finished: false,
        };
        bar.redraw();
        bar
    }

    fn add(&mut self, n: u64) {
        self.done += n;
        self.redraw();
    }

    /// Only redraw when the rendered percentage would change.
    fn redraw(&mut self) {
        let permille = self.permille();
        if self.last_permille != Some(permille) {
            self.last_permille = Some(permille);
            self.sink.render(&format!("\r{}", self.line()));
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.sink.render(&format!("\r{}\n", self.line()));
        }
    }

    fn permille(&self) -> u64 {
        if self.total == 0 {
            1000
        } else {
            (self.done.min(self.total) * 1000) / self.total
        }
    }

    fn line(&self) -> String {
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            (self.done as f64 / elapsed) as u64
        } else {
            0
        };
        let permille = self.permille();

        let prefix = format!("{} / {} ", format_bytes(self.done), format_bytes(self.total));
        let suffix = format!(
            " {:>3}.{}% {}/s",
            permille / 10,
            permille % 10,
            format_bytes(speed)
        );
        let bar_width = PROGRESS_BAR_WIDTH
            .saturating_sub(prefix.len() + suffix.len() + 2)
            .max(10);
        let filled = (bar_width as u64 * permille / 1000) as usize;

        let mut bar = "=".repeat(filled);
        if filled < bar_width {
            bar.push('>');
            bar.push_str(&"-".repeat(bar_width - filled - 1));
        }
        format!("{prefix}[{bar}]{suffix}")
    }
}

impl Drop for ProgressBar {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Reader proxy that reports every byte read to a progress bar. The bar is
/// finalized when the proxy is dropped.
pub struct ProgressReader<R> {
    inner: R,
    bar: ProgressBar,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, sink: ProgressSink, total: u64) -> Self {
        Self {
            inner,
            bar: ProgressBar::start(sink, total),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            this.bar.add((buf.filled().len() - before) as u64);
        }
        poll
    }
}

/// Render a byte count with binary units, e.g. `1.50 KiB`.
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}
