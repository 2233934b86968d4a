//! # Reactor
//!
//! The single cooperative engine behind every scheme. It owns:
//! - the **timer registry**: one-shot timeouts and repeating intervals
//!   addressed by small integer ids, cancellable at any time;
//! - the **watch registry**: readiness subscriptions on shared sockets;
//! - the **wake queue**: the only door through which foreign threads may
//!   push work onto the loop;
//! - the **root token** that tears every child task down on `stop()`.
//!
//! Timers and watches carry a generation counter: a callback that was queued
//! but not yet invoked when `clear()` ran is skipped, and a timer id reused
//! after `clear()` gets a fresh generation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::{NetError, Result};

/// Identifier of a registered timer.
pub type TimerId = u64;
/// Identifier of a readiness watch.
pub type WatchId = u64;

/// Work item posted through the wake queue.
type Job = Box<dyn FnOnce() + Send + 'static>;

/// Interest direction for [`Reactor::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    Both,
}

impl Direction {
    fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
            Direction::Both => Interest::READABLE | Interest::WRITABLE,
        }
    }
}

struct TimerEntry {
    generation: u64,
    token: CancellationToken,
}

struct WatchEntry {
    token: CancellationToken,
}

struct Inner {
    timers: Mutex<HashMap<TimerId, TimerEntry>>,
    watches: Mutex<HashMap<WatchId, WatchEntry>>,
    next_timer: AtomicU64,
    next_watch: AtomicU64,
    generation: AtomicU64,
    root: CancellationToken,
    wake_tx: mpsc::UnboundedSender<Job>,
    wake_rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    watch_ceiling: usize,
}

/// The event engine. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let ceiling = fd_soft_limit()
            .map(|limit| {
                log::info!("file descriptor soft limit: {limit}");
                // keep headroom for listeners, logs and the wake pipe
                limit.saturating_sub(FD_HEADROOM).max(8) as usize
            })
            .unwrap_or(DEFAULT_WATCH_CEILING);
        Self {
            inner: Arc::new(Inner {
                timers: Mutex::new(HashMap::new()),
                watches: Mutex::new(HashMap::new()),
                next_timer: AtomicU64::new(1),
                next_watch: AtomicU64::new(1),
                generation: AtomicU64::new(1),
                root: CancellationToken::new(),
                wake_tx,
                wake_rx: Mutex::new(Some(wake_rx)),
                watch_ceiling: ceiling,
            }),
        }
    }

    /// Token cancelled when [`Reactor::stop`] runs; every task spawned
    /// through the reactor is a child of it.
    pub fn cancelled(&self) -> CancellationToken {
        self.inner.root.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// Maximum number of simultaneous watches (fd soft limit minus headroom).
    pub fn watch_ceiling(&self) -> usize {
        self.inner.watch_ceiling
    }

    /// Spawn a task that dies with the reactor.
    pub fn spawn<F>(&self, fut: F) -> tokio::task::JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = self.inner.root.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        })
    }

    /// Schedule `f` once, at or after `delay_ms` milliseconds.
    pub fn timeout<F>(&self, delay_ms: u64, f: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let tid = self.inner.next_timer.fetch_add(1, Ordering::Relaxed);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.root.child_token();
        self.inner
            .timers
            .lock()
            .expect("timer registry poisoned")
            .insert(tid, TimerEntry { generation, token: token.clone() });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                    // skip the callback when `clear` raced the expiry
                    let live = {
                        let mut timers = inner.timers.lock().expect("timer registry poisoned");
                        match timers.get(&tid) {
                            Some(entry) if entry.generation == generation => {
                                timers.remove(&tid);
                                true
                            }
                            _ => false,
                        }
                    };
                    if live {
                        f();
                    }
                }
            }
        });
        tid
    }

    /// Schedule `f` every `delay_ms` milliseconds until [`Reactor::clear`].
    pub fn interval<F>(&self, delay_ms: u64, mut f: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let tid = self.inner.next_timer.fetch_add(1, Ordering::Relaxed);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.root.child_token();
        self.inner
            .timers
            .lock()
            .expect("timer registry poisoned")
            .insert(tid, TimerEntry { generation, token: token.clone() });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let period = Duration::from_millis(delay_ms.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let live = {
                            let timers = inner.timers.lock().expect("timer registry poisoned");
                            matches!(timers.get(&tid), Some(entry) if entry.generation == generation)
                        };
                        if !live {
                            break;
                        }
                        f();
                    }
                }
            }
        });
        tid
    }

    /// Cancel a timer. Idempotent; safe to call from inside a callback.
    pub fn clear(&self, tid: TimerId) {
        if let Some(entry) = self
            .inner
            .timers
            .lock()
            .expect("timer registry poisoned")
            .remove(&tid)
        {
            entry.token.cancel();
        }
    }

    /// Subscribe to readiness on a shared stream. `f` runs on the loop with
    /// each readiness edge until `unwatch`.
    pub fn watch<F>(&self, stream: Arc<TcpStream>, direction: Direction, mut f: F) -> Result<WatchId>
    where
        F: FnMut(std::io::Result<tokio::io::Ready>) + Send + 'static,
    {
        let mut watches = self.inner.watches.lock().expect("watch registry poisoned");
        if watches.len() >= self.inner.watch_ceiling {
            return Err(NetError::ResourceExhausted(format!(
                "watch ceiling of {} reached",
                self.inner.watch_ceiling
            )));
        }
        let wid = self.inner.next_watch.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.root.child_token();
        watches.insert(wid, WatchEntry { token: token.clone() });
        drop(watches);

        let interest = direction.interest();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    ready = stream.ready(interest) => {
                        let failed = ready.is_err();
                        f(ready);
                        if failed {
                            break;
                        }
                    }
                }
            }
        });
        Ok(wid)
    }

    /// Drop a readiness subscription. Idempotent.
    pub fn unwatch(&self, wid: WatchId) {
        if let Some(entry) = self
            .inner
            .watches
            .lock()
            .expect("watch registry poisoned")
            .remove(&wid)
        {
            entry.token.cancel();
        }
    }

    /// Post work onto the loop from any thread.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.inner.wake_tx.send(Box::new(f));
    }

    /// Drive the wake queue until [`Reactor::stop`]. Jobs already queued when
    /// stop lands are drained before returning.
    pub async fn run(&self) {
        let mut rx = match self
            .inner
            .wake_rx
            .lock()
            .expect("wake queue poisoned")
            .take()
        {
            Some(rx) => rx,
            None => {
                log::warn!("reactor run() called twice, ignoring");
                return;
            }
        };
        let root = self.inner.root.clone();
        loop {
            tokio::select! {
                _ = root.cancelled() => {
                    while let Ok(job) = rx.try_recv() {
                        job();
                    }
                    break;
                }
                job = rx.recv() => {
                    match job {
                        Some(job) => job(),
                        None => break,
                    }
                }
            }
        }
    }

    /// Halt the loop: cancels every child task, timer and watch.
    pub fn stop(&self) {
        self.inner.root.cancel();
    }
}

const FD_HEADROOM: u64 = 64;
const DEFAULT_WATCH_CEILING: usize = 960;

/// Soft RLIMIT_NOFILE, logged once at startup.
#[cfg(unix)]
fn fd_soft_limit() -> Option<u64> {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: getrlimit writes into the struct we own and nothing else.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    (rc == 0).then_some(limit.rlim_cur as u64)
}

#[cfg(not(unix))]
fn fd_soft_limit() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn timeout_fires_once() {
        let reactor = Reactor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        reactor.timeout(10, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleared_timeout_never_fires() {
        let reactor = Reactor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let tid = reactor.timeout(30, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        reactor.clear(tid);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn interval_repeats_until_cleared() {
        let reactor = Reactor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let tid = reactor.interval(10, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(55)).await;
        reactor.clear(tid);
        let after_clear = hits.load(Ordering::SeqCst);
        assert!(after_clear >= 2, "expected several ticks, got {after_clear}");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(hits.load(Ordering::SeqCst), after_clear);
    }

    #[tokio::test]
    async fn watch_reports_readability() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();

        let reactor = Reactor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let wid = reactor
            .watch(Arc::new(client), Direction::Read, move |ready| {
                if ready.map(|r| r.is_readable()).unwrap_or(false) {
                    h.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        use tokio::io::AsyncWriteExt;
        server_side.write_all(b"wake").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(hits.load(Ordering::SeqCst) >= 1);
        reactor.unwatch(wid);
    }

    #[tokio::test]
    async fn stop_drains_posted_jobs() {
        let reactor = Reactor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = Arc::clone(&hits);
            reactor.post(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        reactor.stop();
        reactor.run().await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
