//! Console input that never blocks runtime shutdown.
//!
//! `tokio::io::stdin` parks a runtime blocking thread in `read` that cannot
//! be cancelled, so dropping the runtime waits for the next Enter. Lines are
//! read on a plain OS thread instead and forwarded over a channel; that
//! thread is simply abandoned at process exit.

use std::io::BufRead;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;

/// `AsyncRead` over byte chunks from a channel. A closed channel reads as EOF.
pub struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            pos: 0,
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        while this.pos >= this.pending.len() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => {
                    this.pending = chunk;
                    this.pos = 0;
                }
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = (this.pending.len() - this.pos).min(buf.remaining());
        buf.put_slice(&this.pending[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

/// Spawn the stdin reader thread and return its async side.
pub fn stdin_reader() -> ChannelReader {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.blocking_send(format!("{line}\n").into_bytes()).is_err() {
                break;
            }
        }
        debug!("stdin reader finished");
    });
    ChannelReader::new(rx)
}
