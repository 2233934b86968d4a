//! # Broker
//!
//! One broker per live connection. It owns the transport, the read/write
//! chunk buffers, back-pressure marks, bandwidth budgets, per-operation
//! timeouts, retry counters and the protocol phase. Brokers belong to
//! exactly one scheme and are addressed by a process-wide monotonic id;
//! schemes never hold raw references into each other.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::core::chunks::Chunks;
use crate::core::transport::Transport;
use crate::errors::{NetError, Result};

/// Stable 64-bit broker id, monotonic per process.
pub type BrokerId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next broker id.
pub fn next_id() -> BrokerId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Major connection state, driven by the transition table below.
///
/// ```text
/// INIT → CONNECTING → PROXY_HANDSHAKE → APP_READY ⇄ APP_ACTIVE → CLOSING → CLOSED
///                             └──── (no proxy) ──→ APP_READY
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Connecting,
    ProxyHandshake,
    AppReady,
    AppActive,
    Closing,
    Closed,
}

impl Phase {
    fn can_advance(self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Init, Connecting)
                | (Connecting, ProxyHandshake)
                | (Connecting, AppReady)
                | (ProxyHandshake, AppReady)
                | (AppReady, AppActive)
                | (AppActive, AppReady)
                | (_, Closing)
                | (Closing, Closed)
                | (Init, Closed)
                | (Connecting, Closed)
        )
    }
}

/// What the connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ClientToServer,
    ClientToProxy,
    ServerAccepted,
}

/// `(min, max)` watermark pair governing when reads are delivered and when
/// writes are suspended.
#[derive(Debug, Clone, Copy)]
pub struct Marks {
    pub min: usize,
    pub max: usize,
}

impl Default for Marks {
    fn default() -> Self {
        Self { min: 1, max: 1024 * 1024 }
    }
}

/// Per-direction byte budgets per second; `0` means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct Budgets {
    pub read: usize,
    pub write: usize,
}

/// Per-operation deadlines, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub read: u64,
    pub write: u64,
    pub connect: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { read: 30, write: 15, connect: 15 }
    }
}

/// Retry accounting for the client pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    pub current: u16,
    pub limit: u16,
}

impl Default for Retry {
    fn default() -> Self {
        Self { current: 0, limit: 3 }
    }
}

/// The runtime object owning one live connection.
#[derive(Debug)]
pub struct Broker {
    id: BrokerId,
    scheme_id: u64,
    role: Role,
    phase: Phase,
    pub transport: Option<Transport>,
    pub peer: Option<SocketAddr>,
    pub accepted_at: Instant,
    pub read_buf: Chunks,
    pub write_buf: Chunks,
    pub mark_read: Marks,
    pub mark_write: Marks,
    pub budgets: Budgets,
    pub timeouts: Timeouts,
    pub retry: Retry,
}

impl Broker {
    pub fn new(scheme_id: u64, role: Role) -> Self {
        Self {
            id: next_id(),
            scheme_id,
            role,
            phase: Phase::Init,
            transport: None,
            peer: None,
            accepted_at: Instant::now(),
            read_buf: Chunks::new(),
            write_buf: Chunks::new(),
            mark_read: Marks::default(),
            mark_write: Marks::default(),
            budgets: Budgets::default(),
            timeouts: Timeouts::default(),
            retry: Retry::default(),
        }
    }

    pub fn id(&self) -> BrokerId {
        self.id
    }

    pub fn scheme_id(&self) -> u64 {
        self.scheme_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The transport is held exactly while the broker is not CLOSED.
    pub fn is_open(&self) -> bool {
        self.transport.is_some() && self.phase != Phase::Closed
    }

    /// Advance the phase along the transition table.
    pub fn advance(&mut self, to: Phase) -> Result<()> {
        if self.phase == to {
            return Ok(());
        }
        if !self.phase.can_advance(to) {
            return Err(NetError::Protocol(format!(
                "illegal broker transition {:?} -> {:?}",
                self.phase, to
            )));
        }
        log::trace!("broker {} {:?} -> {:?}", self.id, self.phase, to);
        self.phase = to;
        if to == Phase::Closed {
            self.transport = None;
            self.read_buf.clear();
            self.write_buf.clear();
        }
        Ok(())
    }

    /// Attach the connected socket and enter CONNECTING.
    pub fn attach(&mut self, transport: Transport) -> Result<()> {
        self.peer = transport.peer_addr().ok();
        self.transport = Some(transport);
        self.advance(Phase::Connecting)
    }

    /// Flip the connection target from proxy to origin after a successful
    /// proxy handshake: the application codec restarts from scratch and the
    /// retry budget is granted anew.
    pub fn switch_connect(&mut self) -> Result<()> {
        if self.role != Role::ClientToProxy {
            return Err(NetError::Protocol("switchover on a non-proxy broker".into()));
        }
        self.role = Role::ClientToServer;
        self.retry.current = 0;
        self.read_buf.clear();
        self.write_buf.clear();
        self.advance(Phase::AppReady)
    }

    /// Whether another connect attempt is allowed.
    pub fn may_retry(&self) -> bool {
        self.retry.current < self.retry.limit
    }

    /// Back-pressure check: writes are suspended above the high-water mark.
    pub fn write_suspended(&self) -> bool {
        self.write_buf.len() > self.mark_write.max
    }

    /// Delivery check: the read callback only fires with at least `min`
    /// buffered bytes.
    pub fn read_deliverable(&self) -> bool {
        self.read_buf.len() >= self.mark_read.min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let a = Broker::new(1, Role::ClientToServer);
        let b = Broker::new(1, Role::ClientToServer);
        assert!(b.id() > a.id());
    }

    #[test]
    fn legal_phase_walk() {
        let mut b = Broker::new(1, Role::ClientToProxy);
        b.advance(Phase::Connecting).unwrap();
        b.advance(Phase::ProxyHandshake).unwrap();
        b.switch_connect().unwrap();
        assert_eq!(b.phase(), Phase::AppReady);
        assert_eq!(b.role(), Role::ClientToServer);
        b.advance(Phase::AppActive).unwrap();
        b.advance(Phase::AppReady).unwrap();
        b.advance(Phase::Closing).unwrap();
        b.advance(Phase::Closed).unwrap();
        assert!(!b.is_open());
    }

    #[test]
    fn illegal_transition_rejected() {
        let mut b = Broker::new(1, Role::ClientToServer);
        assert!(b.advance(Phase::AppActive).is_err());
        b.advance(Phase::Connecting).unwrap();
        assert!(b.advance(Phase::Init).is_err());
    }

    #[test]
    fn closed_broker_drops_buffers() {
        let mut b = Broker::new(1, Role::ServerAccepted);
        b.read_buf.add(&b"data"[..]);
        b.advance(Phase::Closing).unwrap();
        b.advance(Phase::Closed).unwrap();
        assert!(b.read_buf.is_empty());
        assert!(!b.is_open());
    }

    #[test]
    fn marks_govern_backpressure() {
        let mut b = Broker::new(1, Role::ClientToServer);
        b.mark_write = Marks { min: 1, max: 8 };
        b.write_buf.add(vec![0u8; 9]);
        assert!(b.write_suspended());
        b.mark_read = Marks { min: 4, max: 64 };
        b.read_buf.add(&b"ab"[..]);
        assert!(!b.read_deliverable());
        b.read_buf.add(&b"cd"[..]);
        assert!(b.read_deliverable());
    }
}
