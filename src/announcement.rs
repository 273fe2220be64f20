//! A tracked (peer, transaction) relationship and the key projections that
//! order it in the tracker's three views.

use crate::{priority::PriorityComputer, PeerId, Priority, Timestamp, TxId};

/// Lifecycle state of an announcement, with the timestamp relevant to that
/// state embedded in the variant.
///
/// A candidate announcement carries the time at which it becomes requestable,
/// a requested one carries the time at which the outstanding request expires,
/// and a completed one carries nothing. Keeping the timestamp inside the
/// variant (instead of a shared field reinterpreted per state) makes it
/// impossible to read an expiry as a ready time or vice versa.
///
/// Expected behaviour:
/// - When first announced by a peer, the state is [`CandidateDelayed`] until
///   `ready_at` is reached.
/// - Announcements past their `ready_at` that have not been requested are
///   either [`CandidateReady`] or [`CandidateBest`]. Neither expires; they
///   stay put until requested or no longer needed. A `CandidateReady` is
///   promoted to `CandidateBest` when it is the best one left for its
///   transaction.
/// - A requested announcement is [`Requested`] until `expires_at` is reached.
/// - On expiry, or when the peer replies to the request (with the transaction
///   or with not-found), the state becomes [`Completed`].
///
/// [`CandidateDelayed`]: State::CandidateDelayed
/// [`CandidateReady`]: State::CandidateReady
/// [`CandidateBest`]: State::CandidateBest
/// [`Requested`]: State::Requested
/// [`Completed`]: State::Completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    /// A candidate whose ready time is in the future.
    CandidateDelayed {
        /// Earliest time this announcement becomes requestable.
        ready_at: Timestamp,
    },
    /// A candidate that is requestable but not the selected one.
    CandidateReady {
        /// Retained so the announcement can fall back to
        /// [`CandidateDelayed`](State::CandidateDelayed) if time moves
        /// backwards.
        ready_at: Timestamp,
    },
    /// The best candidate for its transaction; only exists while no
    /// [`Requested`](State::Requested) announcement does.
    CandidateBest {
        /// See [`CandidateReady`](State::CandidateReady).
        ready_at: Timestamp,
    },
    /// An announcement with an outstanding request.
    Requested {
        /// Time at which the outstanding request is considered failed.
        expires_at: Timestamp,
    },
    /// A tombstone: the request concluded (response, expiry, or superseded),
    /// but siblings for the same transaction still exist, so the row is kept
    /// to block re-announcement by the same peer.
    Completed,
}

/// Discriminant-only rank of a [`State`], ordered the way the by-transaction
/// view needs: all candidates of one transaction sort before its selected
/// announcement, which sorts before its tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum StateRank {
    CandidateDelayed,
    CandidateReady,
    CandidateBest,
    Requested,
    Completed,
}

/// Position of an announcement in the by-time view.
///
/// Announcements waiting for a future timestamp sort first, so advancing time
/// walks the view from the front; requestable announcements (whose timestamp
/// is in the past) sort last, so a backward clock walks it from the back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum WaitClass {
    /// The timestamp matters once it is reached: a delayed candidate's ready
    /// time or a request's expiry.
    FutureEvent,
    /// The timestamp is irrelevant (completed announcements).
    NoEvent,
    /// The timestamp mattered and has passed (ready/best candidates).
    PastEvent,
}

impl State {
    pub(crate) fn rank(&self) -> StateRank {
        match self {
            Self::CandidateDelayed { .. } => StateRank::CandidateDelayed,
            Self::CandidateReady { .. } => StateRank::CandidateReady,
            Self::CandidateBest { .. } => StateRank::CandidateBest,
            Self::Requested { .. } => StateRank::Requested,
            Self::Completed => StateRank::Completed,
        }
    }

    /// The timestamp this state is keyed on in the by-time view; zero for
    /// completed announcements, whose timestamp is irrelevant.
    pub(crate) fn time(&self) -> Timestamp {
        match *self {
            Self::CandidateDelayed { ready_at }
            | Self::CandidateReady { ready_at }
            | Self::CandidateBest { ready_at } => ready_at,
            Self::Requested { expires_at } => expires_at,
            Self::Completed => 0,
        }
    }

    pub(crate) fn wait_class(&self) -> WaitClass {
        if self.is_waiting() {
            WaitClass::FutureEvent
        } else if self.is_selectable() {
            WaitClass::PastEvent
        } else {
            WaitClass::NoEvent
        }
    }

    /// Whether this announcement is waiting for a certain time to pass.
    pub(crate) fn is_waiting(&self) -> bool {
        matches!(self, Self::CandidateDelayed { .. } | Self::Requested { .. })
    }

    /// Whether this announcement could become the selected one if the current
    /// selected announcement disappears.
    pub(crate) fn is_selectable(&self) -> bool {
        matches!(self, Self::CandidateReady { .. } | Self::CandidateBest { .. })
    }

    /// Whether this announcement is the selected one for its transaction.
    /// There is at most one selected announcement per transaction.
    pub(crate) fn is_selected(&self) -> bool {
        matches!(self, Self::CandidateBest { .. } | Self::Requested { .. })
    }
}

/// The data tracked for one transaction announced by one peer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Announcement {
    pub(crate) txid: TxId,
    pub(crate) peer: PeerId,
    /// Whether the announcing peer is preferred; forced into the priority's
    /// most significant bit.
    pub(crate) preferred: bool,
    /// Creation-order counter; decides the order in which simultaneously
    /// selected transactions are handed back to a peer.
    pub(crate) sequence: u64,
    pub(crate) state: State,
}

/// Key of the by-peer view: `(peer, is candidate-best, txid)`.
///
/// Splitting on the candidate-best flag lets `get_requestable` enumerate
/// exactly a peer's selected announcements with one range scan.
pub(crate) type ByPeerKey = (PeerId, bool, TxId);

/// Key of the by-transaction view: `(txid, state rank, priority, peer)`.
///
/// The priority component is nonzero only for ready candidates, so among one
/// transaction's announcements the best ready candidate is the one
/// immediately before its selected announcement (if any), and tombstones sort
/// last. The trailing peer disambiguates equal priorities.
pub(crate) type ByTxIdKey = (TxId, StateRank, Priority, PeerId);

/// Key of the by-time view: `(wait class, timestamp, peer, txid)`.
pub(crate) type ByTimeKey = (WaitClass, Timestamp, PeerId, TxId);

impl Announcement {
    pub(crate) fn new(
        txid: TxId,
        peer: PeerId,
        preferred: bool,
        ready_at: Timestamp,
        sequence: u64,
    ) -> Self {
        Self { txid, peer, preferred, sequence, state: State::CandidateDelayed { ready_at } }
    }

    pub(crate) fn by_peer_key(&self) -> ByPeerKey {
        (self.peer, matches!(self.state, State::CandidateBest { .. }), self.txid)
    }

    pub(crate) fn by_txid_key(&self, computer: &PriorityComputer) -> ByTxIdKey {
        let priority = match self.state {
            State::CandidateReady { .. } => {
                computer.priority(&self.txid, self.peer, self.preferred)
            }
            _ => 0,
        };
        (self.txid, self.state.rank(), priority, self.peer)
    }

    pub(crate) fn by_time_key(&self) -> ByTimeKey {
        (self.state.wait_class(), self.state.time(), self.peer, self.txid)
    }
}
