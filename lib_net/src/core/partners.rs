//! Symmetric broker pairing used by the proxy servers to tunnel bytes
//! between two connections.
//!
//! For every pair `(a, b)` with `a != b`: `m[a] = b` and `m[b] = a`. A
//! single-broker insert is stored as a self-loop until its partner arrives.
//! Removing either side cancels both relay tasks, which closes both sockets.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::core::broker::BrokerId;

struct Partner {
    peer: BrokerId,
    token: CancellationToken,
}

/// Bidirectional broker pairing map.
#[derive(Default)]
pub struct Partners {
    base: Mutex<HashMap<BrokerId, Partner>>,
}

impl Partners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, id: BrokerId) -> bool {
        self.base.lock().expect("partners poisoned").contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.base.lock().expect("partners poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a lone broker as a self-loop.
    pub fn add(&self, id: BrokerId, token: CancellationToken) {
        self.base
            .lock()
            .expect("partners poisoned")
            .insert(id, Partner { peer: id, token });
    }

    /// Join two brokers. Fails when either side is already paired with a
    /// third broker.
    pub fn merge(
        &self,
        a: BrokerId,
        token_a: CancellationToken,
        b: BrokerId,
        token_b: CancellationToken,
    ) -> bool {
        let mut base = self.base.lock().expect("partners poisoned");
        let a_free = base.get(&a).map(|p| p.peer == a).unwrap_or(true);
        let b_free = base.get(&b).map(|p| p.peer == b).unwrap_or(true);
        if !a_free || !b_free || a == b {
            return false;
        }
        base.insert(a, Partner { peer: b, token: token_a });
        base.insert(b, Partner { peer: a, token: token_b });
        true
    }

    /// Partner of `id`, if paired.
    pub fn peer(&self, id: BrokerId) -> Option<BrokerId> {
        self.base
            .lock()
            .expect("partners poisoned")
            .get(&id)
            .map(|p| p.peer)
    }

    /// Remove `id` and its partner, cancelling both relay tokens.
    pub fn del(&self, id: BrokerId) {
        let mut base = self.base.lock().expect("partners poisoned");
        if let Some(entry) = base.remove(&id) {
            entry.token.cancel();
            if entry.peer != id {
                if let Some(peer) = base.remove(&entry.peer) {
                    peer.token.cancel();
                }
            }
        }
    }

    /// Tear down every pair.
    pub fn clear(&self) {
        let mut base = self.base.lock().expect("partners poisoned");
        for (_, entry) in base.drain() {
            entry.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_symmetric() {
        let partners = Partners::new();
        assert!(partners.merge(1, CancellationToken::new(), 2, CancellationToken::new()));
        assert_eq!(partners.peer(1), Some(2));
        assert_eq!(partners.peer(2), Some(1));
    }

    #[test]
    fn self_loop_then_merge() {
        let partners = Partners::new();
        partners.add(7, CancellationToken::new());
        assert_eq!(partners.peer(7), Some(7));
        assert!(partners.merge(7, CancellationToken::new(), 9, CancellationToken::new()));
        assert_eq!(partners.peer(7), Some(9));
    }

    #[test]
    fn paired_broker_refuses_third() {
        let partners = Partners::new();
        partners.merge(1, CancellationToken::new(), 2, CancellationToken::new());
        assert!(!partners.merge(2, CancellationToken::new(), 3, CancellationToken::new()));
    }

    #[test]
    fn del_cancels_both_sides() {
        let partners = Partners::new();
        let ta = CancellationToken::new();
        let tb = CancellationToken::new();
        partners.merge(1, ta.clone(), 2, tb.clone());
        partners.del(1);
        assert!(ta.is_cancelled());
        assert!(tb.is_cancelled());
        assert!(!partners.has(1));
        assert!(!partners.has(2));
    }
}
