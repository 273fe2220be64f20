#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Tracks which peers announced which transactions, and schedules requests for
//! the corresponding transaction bodies.
//!
//! A p2p node learns about new transactions through inventory announcements
//! from many peers at once, but should download each transaction from only one
//! peer at a time. [`TxRequestTracker`] is the bookkeeping structure that makes
//! that decision: for every announced transaction it selects a single peer to
//! request from (preferred peers first, then a keyed pseudorandom tie-break),
//! delays requests until a caller-chosen ready time, fails over to the
//! next-best peer when a request expires or a peer disconnects, and never
//! schedules two simultaneous requests for the same transaction.
//!
//! The tracker performs no I/O and reads no clocks. Time is virtual: the
//! caller passes the current timestamp to [`TxRequestTracker::get_requestable`]
//! and all promotions and expirations are driven by that value, which makes the
//! structure fully deterministic and lets tests (and clock corrections) move
//! time backwards without violating any invariant.
//!
//! # Usage
//!
//! - Call [`received_inv`](TxRequestTracker::received_inv) for every inventory
//!   announcement.
//! - Call [`get_requestable`](TxRequestTracker::get_requestable) when ready to
//!   issue requests to a peer; send a request for every returned id and record
//!   it with [`requested_tx`](TxRequestTracker::requested_tx).
//! - Call [`received_response`](TxRequestTracker::received_response) when the
//!   peer answers (with the transaction or with not-found),
//!   [`disconnected_peer`](TxRequestTracker::disconnected_peer) on link loss,
//!   and [`forget_txid`](TxRequestTracker::forget_txid) once a transaction is
//!   no longer wanted.
//!
//! The tracker is not internally thread-safe; the caller serializes access.

use std::fmt;

mod announcement;
mod priority;
mod tracker;

pub use tracker::TxRequestTracker;

/// Identifier for a peer.
///
/// Opaque to the tracker; the caller assigns these (e.g. connection ids) and
/// guarantees they are not reused while announcements for them are tracked.
pub type PeerId = u64;

/// Virtual timestamp in microseconds.
///
/// Supplied by the caller on every query; the tracker never reads a wall
/// clock.
pub type Timestamp = u64;

/// Priority of an announcement, used to choose among peers that announced the
/// same transaction.
///
/// The most significant bit carries the preferred flag, so preferred
/// announcements always outrank non-preferred ones; the low bits are a keyed
/// pseudorandom hash of (transaction, peer). Higher is better.
pub type Priority = u64;

/// A 32-byte transaction identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId([u8; 32]);

impl TxId {
    /// The all-zeroes id, the smallest possible value.
    pub const MIN: Self = Self([0x00; 32]);

    /// The all-ones id, the largest possible value.
    pub const MAX: Self = Self([0xff; 32]);

    /// Creates a new id from raw bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the id.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for TxId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txid_display_is_prefixed_hex() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let txid = TxId::new(bytes);
        let repr = txid.to_string();
        assert!(repr.starts_with("0xab00"));
        assert!(repr.ends_with("01"));
        assert_eq!(repr.len(), 2 + 64);
    }

    #[test]
    fn txid_ordering_matches_bytes() {
        assert!(TxId::MIN < TxId::MAX);
        let mut bytes = [0u8; 32];
        bytes[0] = 1;
        assert!(TxId::MIN < TxId::new(bytes));
        assert!(TxId::new(bytes) < TxId::MAX);
    }
}
