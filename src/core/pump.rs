//! Bidirectional byte pump (C2): two concurrent copy loops between a
//! pair of TCP streams, with unified, exactly-once termination.

use crate::util::net::force_close;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{Duration, sleep};
use tracing::{debug, trace};

/// At most 3 retries on a transient read/write error. Unbounded retry
/// on a pathological peer is a denial-of-service risk.
const MAX_TRANSIENT_RETRIES: u32 = 3;
const READ_BUF: usize = 8192;

/// Serializes the "close both sockets exactly once" transition shared
/// by both pump directions.
#[derive(Default)]
pub struct CloseGuard {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` exactly once — on the call that performs the
    /// transition. Subsequent calls are no-ops that return `false`.
    pub fn close_once(&self) -> bool {
        let first = self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    /// Resolves once [`close_once`] has run (from any task).
    pub async fn wait_closed(&self) {
        if self.is_closed() {
            return;
        }
        self.notify.notified().await;
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

/// Run one direction of the pump: read from `src`, write to `dst`,
/// until EOF, a terminal error, or `guard` trips. On exit for any
/// reason it calls [`CloseGuard::close_once`]; only the first caller
/// (of either direction) actually force-closes both sockets.
async fn copy_loop(
    src: Arc<TcpStream>,
    dst: Arc<TcpStream>,
    other: Arc<TcpStream>,
    guard: Arc<CloseGuard>,
    counter: Arc<AtomicU64>,
    label: &'static str,
) {
    let mut buf = vec![0u8; READ_BUF];
    let mut retries: u32 = 0;

    loop {
        if guard.is_closed() {
            break;
        }

        let read = (&*src).read(&mut buf);
        let n = tokio::select! {
            res = read => res,
            _ = guard.wait_closed() => break,
        };

        let n = match n {
            Ok(0) => {
                trace!("[Pump:{label}] eof");
                break;
            }
            Ok(n) => {
                retries = 0;
                n
            }
            Err(err) if is_transient(&err) && retries < MAX_TRANSIENT_RETRIES => {
                retries += 1;
                sleep(Duration::from_millis(1u64 << retries)).await;
                continue;
            }
            Err(err) => {
                debug!("[Pump:{label}] read error: {err}");
                break;
            }
        };

        if let Err(err) = (&*dst).write_all(&buf[..n]).await {
            debug!("[Pump:{label}] write error: {err}");
            break;
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    if guard.close_once() {
        force_close(&src);
        force_close(&dst);
        force_close(&other);
    }
}

/// Drive the two-directional relay between `a` and `b` to completion.
/// Returns (bytes a→b, bytes b→a).
pub async fn run(a: Arc<TcpStream>, b: Arc<TcpStream>, guard: Arc<CloseGuard>) -> (u64, u64) {
    let ab_bytes = Arc::new(AtomicU64::new(0));
    let ba_bytes = Arc::new(AtomicU64::new(0));

    let task_ab = tokio::spawn(copy_loop(
        a.clone(),
        b.clone(),
        a.clone(),
        guard.clone(),
        ab_bytes.clone(),
        "a->b",
    ));
    let task_ba = tokio::spawn(copy_loop(
        b.clone(),
        a.clone(),
        b.clone(),
        guard.clone(),
        ba_bytes.clone(),
        "b->a",
    ));

    let _ = tokio::join!(task_ab, task_ba);

    // Either direction may have exited without ever hitting an error
    // (e.g. half-close); make sure the close transition always runs.
    if guard.close_once() {
        force_close(&a);
        force_close(&b);
    }

    (ab_bytes.load(Ordering::Relaxed), ba_bytes.load(Ordering::Relaxed))
}
