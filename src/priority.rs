//! The keyed priority function used to rank competing announcements of one
//! transaction.

use crate::{PeerId, Priority, TxId};
use rand::Rng;
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

/// Computes the priority of an announcement from its (transaction, peer,
/// preferred) triple. Higher priorities are selected first.
///
/// The preferred flag occupies the most significant bit, so a preferred
/// announcement always outranks a non-preferred one; within the same
/// preference class, a SipHash-2-4 of (transaction, peer) keyed with this
/// computer's salt breaks the tie. In production the salt is drawn once per
/// tracker instance from the thread rng, so remote peers cannot predict which
/// of them will be selected for a given transaction on any particular node.
#[derive(Debug, Clone)]
pub(crate) struct PriorityComputer {
    k0: u64,
    k1: u64,
}

impl PriorityComputer {
    /// Creates a new computer. A deterministic computer uses a fixed all-zero
    /// salt, for reproducible tests.
    pub(crate) fn new(deterministic: bool) -> Self {
        if deterministic {
            Self { k0: 0, k1: 0 }
        } else {
            let mut rng = rand::rng();
            Self { k0: rng.random(), k1: rng.random() }
        }
    }

    pub(crate) fn priority(&self, txid: &TxId, peer: PeerId, preferred: bool) -> Priority {
        let mut hasher = SipHasher24::new_with_keys(self.k0, self.k1);
        hasher.write(txid.as_bytes());
        hasher.write_u64(peer);
        let low_bits = hasher.finish() >> 1;
        low_bits | (preferred as u64) << 63
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(fill: u8) -> TxId {
        TxId::new([fill; 32])
    }

    #[test]
    fn preferred_always_outranks_non_preferred() {
        let computer = PriorityComputer::new(true);
        for i in 0..=u8::MAX {
            let preferred = computer.priority(&txid(i), u64::from(i), true);
            for j in 0..=u8::MAX {
                let plain = computer.priority(&txid(j), u64::from(j), false);
                assert!(preferred > plain);
            }
        }
    }

    #[test]
    fn deterministic_mode_is_reproducible() {
        let a = PriorityComputer::new(true);
        let b = PriorityComputer::new(true);
        assert_eq!(a.priority(&txid(7), 42, false), b.priority(&txid(7), 42, false));
        assert_eq!(a.priority(&txid(7), 42, true), b.priority(&txid(7), 42, true));
    }

    #[test]
    fn priority_depends_on_txid_and_peer() {
        let computer = PriorityComputer::new(true);
        let base = computer.priority(&txid(1), 1, false);
        assert_ne!(base, computer.priority(&txid(2), 1, false));
        assert_ne!(base, computer.priority(&txid(1), 2, false));
    }

    #[test]
    fn randomized_computers_disagree() {
        // Two independently salted computers agreeing on 16 inputs would be a
        // 2^-1024 coincidence.
        let a = PriorityComputer::new(false);
        let b = PriorityComputer::new(false);
        let same = (0..16u8).all(|i| {
            a.priority(&txid(i), u64::from(i), false) == b.priority(&txid(i), u64::from(i), false)
        });
        assert!(!same);
    }
}
