//! The request tracker: one primary store of announcements plus three ordered
//! views that stay consistent across every mutation.

use crate::{
    announcement::{Announcement, ByPeerKey, ByTimeKey, ByTxIdKey, State, StateRank, WaitClass},
    priority::PriorityComputer,
    PeerId, Priority, Timestamp, TxId,
};
use std::{
    collections::{hash_map::Entry, BTreeSet, HashMap},
    ops::Bound,
};
use tracing::{debug, trace};

/// Incrementally maintained statistics for one peer, so the count queries are
/// O(1) instead of table scans.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PeerInfo {
    /// Total number of announcements for this peer.
    total: usize,
    /// Number of completed announcements for this peer.
    completed: usize,
    /// Number of requested announcements for this peer.
    requested: usize,
}

/// Lookup key of the primary store: one announcement per (peer, transaction)
/// pair.
type PairKey = (PeerId, TxId);

/// Decides, per peer and per announced transaction, when to request the
/// transaction body and from which single peer.
///
/// The tracker maintains one row per (peer, transaction) pair, each in one of
/// five lifecycle states (see [`State`]), and guarantees after every public
/// operation:
///
/// 1. at most one row per (peer, transaction) pair;
/// 2. per transaction, at most one selected row (candidate-best or
///    requested), never two;
/// 3. completed rows survive only as long as non-completed siblings exist for
///    the same transaction; once the last non-completed row goes, every row
///    for that transaction is erased;
/// 4. whenever a transaction has ready candidates but no selected row, the
///    highest-priority ready candidate is promoted to candidate-best.
///
/// Three ordered views over the primary store answer the queries the
/// operations need without scans: by peer (a peer's selected rows), by
/// transaction (promotion, reselection, reaping), and by time (what changed
/// because time passed). All three are updated through the private
/// [`modify`](Self::modify)/[`erase`](Self::erase) helpers; nothing else
/// touches them.
///
/// The structure is single-writer by design: it has no internal locking, and
/// all methods take `&mut self` or `&self` so the borrow checker enforces
/// caller-side serialization within a process.
#[derive(Debug)]
pub struct TxRequestTracker {
    /// The priority salt for this instance.
    computer: PriorityComputer,
    /// Increases for every announcement; orders `get_requestable` output.
    next_sequence: u64,
    /// Primary store. The map key enforces pair uniqueness (invariant 1).
    announcements: HashMap<PairKey, Announcement>,
    /// View sorted by (peer, is candidate-best, txid).
    by_peer: BTreeSet<ByPeerKey>,
    /// View sorted by (txid, state rank, priority, peer).
    by_txid: BTreeSet<ByTxIdKey>,
    /// View sorted by (wait class, timestamp, peer, txid).
    by_time: BTreeSet<ByTimeKey>,
    /// Per-peer statistics backing the O(1) count queries.
    peer_info: HashMap<PeerId, PeerInfo>,
}

// === impl TxRequestTracker ===

impl TxRequestTracker {
    /// Creates a new tracker.
    ///
    /// With `deterministic` set, the priority salt is fixed to zero so peer
    /// selection is reproducible across instances; production callers pass
    /// `false` to draw a fresh salt, so remote peers cannot predict which of
    /// them gets selected for a transaction.
    pub fn new(deterministic: bool) -> Self {
        Self {
            computer: PriorityComputer::new(deterministic),
            next_sequence: 0,
            announcements: Default::default(),
            by_peer: Default::default(),
            by_txid: Default::default(),
            by_time: Default::default(),
            peer_info: Default::default(),
        }
    }

    /// Returns the priority this tracker assigns to an announcement of `txid`
    /// by `peer`. Exposed so callers and tests can predict selection order.
    pub fn priority(&self, txid: &TxId, peer: PeerId, preferred: bool) -> Priority {
        self.computer.priority(txid, peer, preferred)
    }

    /// Registers that `peer` announced `txid`, requestable from `ready_time`
    /// on.
    ///
    /// A no-op if an announcement for this exact pair is already tracked, in
    /// whatever state: a duplicate announcement is ignored, not refreshed,
    /// and a completed tombstone blocks re-announcement until its siblings
    /// are gone.
    pub fn received_inv(
        &mut self,
        peer: PeerId,
        txid: TxId,
        preferred: bool,
        ready_time: Timestamp,
    ) {
        if self.announcements.contains_key(&(peer, txid)) {
            return;
        }

        trace!(target: "txrequest", peer, txid = %txid, preferred, ready_time, "tracking announcement");

        let ann = Announcement::new(txid, peer, preferred, ready_time, self.next_sequence);
        self.link(&ann);
        self.announcements.insert((peer, txid), ann);
        self.peer_info.entry(peer).or_default().total += 1;
        self.next_sequence = self.next_sequence.wrapping_add(1);
    }

    /// Marks the announcement of `txid` by `peer` as requested, with the
    /// outstanding request expiring at `expiry`.
    ///
    /// A no-op if no candidate announcement is tracked for the pair (the
    /// caller requested something it never should have, or the row already
    /// concluded). If the pair was tracked but was not the selected row for
    /// `txid`, the currently selected row is first demoted (a rival
    /// candidate-best back to ready, a rival requested row to completed) so
    /// at most one request per transaction stays outstanding even when the
    /// caller requests from a peer other than the recommended one.
    pub fn requested_tx(&mut self, peer: PeerId, txid: TxId, expiry: Timestamp) {
        let key = (peer, txid);
        let Some(&ann) = self.announcements.get(&key) else { return };

        if !matches!(ann.state, State::CandidateBest { .. }) {
            match ann.state {
                State::CandidateDelayed { .. } | State::CandidateReady { .. } => {}
                // Already requested or completed; a superfluous call.
                _ => return,
            }

            // `ann` was not the selected row, so a selected row for this txid
            // may exist elsewhere. It sorts at the start of the range
            // beginning with (txid, candidate-best).
            let from = (txid, StateRank::CandidateBest, Priority::MIN, PeerId::MIN);
            if let Some(&(t, rank, _, rival)) = self.by_txid.range(from..).next() {
                if t == txid {
                    match rank {
                        StateRank::CandidateBest => self.modify((rival, txid), |a| {
                            if let State::CandidateBest { ready_at } = a.state {
                                // Ready rather than delayed: if time only
                                // moves forward, the next time advance would
                                // promote it right back anyway.
                                a.state = State::CandidateReady { ready_at };
                            }
                        }),
                        // No longer waiting on the old request; completing it
                        // also guarantees progress.
                        StateRank::Requested => {
                            self.modify((rival, txid), |a| a.state = State::Completed)
                        }
                        _ => {}
                    }
                }
            }
        }

        self.modify(key, |a| a.state = State::Requested { expires_at: expiry });
    }

    /// Records that `peer` answered the request for `txid`, with the
    /// transaction body or with an explicit not-found; the tracker does not
    /// distinguish. A no-op for untracked pairs.
    pub fn received_response(&mut self, peer: PeerId, txid: TxId) {
        if self.announcements.contains_key(&(peer, txid)) {
            self.make_completed((peer, txid));
        }
    }

    /// Drops every announcement by `peer`, reselecting the best remaining
    /// candidate for each affected transaction.
    ///
    /// Unlike a not-found response, no tombstone is kept: a disconnected peer
    /// can never serve a request, and its ids may be reused.
    pub fn disconnected_peer(&mut self, peer: PeerId) {
        let txids: Vec<TxId> = self
            .by_peer
            .range((peer, false, TxId::MIN)..=(peer, true, TxId::MAX))
            .map(|&(_, _, txid)| txid)
            .collect();
        if txids.is_empty() {
            return;
        }

        debug!(target: "txrequest", peer, announcements = txids.len(), "dropping disconnected peer");

        // Completing a row only ever deletes rows of the same transaction,
        // and this peer has one row per transaction, so the collected list
        // stays valid throughout.
        for txid in txids {
            if self.make_completed((peer, txid)) {
                self.erase((peer, txid));
            }
        }
    }

    /// Erases every announcement of `txid`, regardless of state. Idempotent;
    /// called once the transaction is confirmed, rejected, or otherwise no
    /// longer interesting.
    pub fn forget_txid(&mut self, txid: TxId) {
        let peers: Vec<PeerId> = self
            .by_txid
            .range(txid_range(txid))
            .map(|&(_, _, _, peer)| peer)
            .collect();
        for peer in peers {
            self.erase((peer, txid));
        }
    }

    /// Returns the transactions to request from `peer` right now, in
    /// announcement order.
    ///
    /// First brings the table in line with `now` (in either direction; see
    /// [`set_time_point`](Self::set_time_point)), then collects the peer's
    /// candidate-best rows. For every returned id the caller is expected to
    /// send a request and record it with
    /// [`requested_tx`](Self::requested_tx).
    ///
    /// When `expired` is supplied, the buffer is cleared and every request
    /// that expired during this call is recorded as (peer, txid), so the
    /// caller can penalize unresponsive peers.
    pub fn get_requestable(
        &mut self,
        peer: PeerId,
        now: Timestamp,
        expired: Option<&mut Vec<(PeerId, TxId)>>,
    ) -> Vec<TxId> {
        self.set_time_point(now, expired);

        let mut selected: Vec<(u64, TxId)> = self
            .by_peer
            .range((peer, true, TxId::MIN)..=(peer, true, TxId::MAX))
            .map(|&(_, _, txid)| (self.announcements[&(peer, txid)].sequence, txid))
            .collect();

        // Priority decided which peer was selected; the order the ids are
        // handed back in is the order they were announced in.
        selected.sort_unstable();
        selected.into_iter().map(|(_, txid)| txid).collect()
    }

    /// Number of announcements by `peer` with an outstanding request.
    pub fn count_in_flight(&self, peer: PeerId) -> usize {
        self.peer_info.get(&peer).map_or(0, |info| info.requested)
    }

    /// Number of candidate (not yet requested, not completed) announcements
    /// by `peer`.
    pub fn count_candidates(&self, peer: PeerId) -> usize {
        self.peer_info
            .get(&peer)
            .map_or(0, |info| info.total - info.requested - info.completed)
    }

    /// Total number of announcements by `peer` in any state.
    pub fn count(&self, peer: PeerId) -> usize {
        self.peer_info.get(&peer).map_or(0, |info| info.total)
    }

    /// Total number of announcements tracked across all peers.
    pub fn len(&self) -> usize {
        self.announcements.len()
    }

    /// Whether no announcements are tracked at all.
    pub fn is_empty(&self) -> bool {
        self.announcements.is_empty()
    }

    /// Brings the table in line with `now`:
    /// - delayed candidates whose ready time has passed become ready (or
    ///   candidate-best, if they win selection);
    /// - requested rows whose expiry has passed complete, handing selection
    ///   to the next-best candidate;
    /// - if time moved backwards, ready/best candidates whose ready time is
    ///   now in the future fall back to delayed.
    fn set_time_point(&mut self, now: Timestamp, mut expired: Option<&mut Vec<(PeerId, TxId)>>) {
        if let Some(buf) = expired.as_deref_mut() {
            buf.clear();
        }

        // Walk announcements waiting on a timestamp from oldest to newest,
        // as long as their timestamp is in the past.
        while let Some(&(wait, time, peer, txid)) = self.by_time.iter().next() {
            if wait != WaitClass::FutureEvent || time > now {
                break;
            }
            match self.announcements[&(peer, txid)].state {
                State::CandidateDelayed { .. } => self.promote_candidate_ready((peer, txid)),
                State::Requested { .. } => {
                    debug!(target: "txrequest", peer, txid = %txid, "request expired");
                    if let Some(buf) = expired.as_deref_mut() {
                        buf.push((peer, txid));
                    }
                    self.make_completed((peer, txid));
                }
                // Future events are exactly delayed candidates and requests.
                state => unreachable!("future event in state {state:?}"),
            }
        }

        // If time went backwards, ready/best candidates may sit ahead of
        // their own ready time; demote them until the newest one is valid.
        // Unusual in production, but it makes behavior under simulated and
        // corrected clocks fully specified.
        while let Some(&(wait, time, peer, txid)) = self.by_time.iter().next_back() {
            if wait != WaitClass::PastEvent || time <= now {
                break;
            }
            let ready_at = match self.announcements[&(peer, txid)].state {
                State::CandidateReady { ready_at } | State::CandidateBest { ready_at } => ready_at,
                state => unreachable!("past event in state {state:?}"),
            };
            self.change_and_reselect((peer, txid), State::CandidateDelayed { ready_at });
        }
    }

    /// Converts a delayed candidate into a ready one, and further into the
    /// candidate-best if it is now the best selectable announcement for its
    /// transaction and no request is outstanding.
    fn promote_candidate_ready(&mut self, key: PairKey) {
        debug_assert!(
            matches!(self.announcements[&key].state, State::CandidateDelayed { .. }),
            "promotion starts from a delayed candidate"
        );

        self.modify(key, |a| {
            if let State::CandidateDelayed { ready_at } = a.state {
                a.state = State::CandidateReady { ready_at };
            }
        });

        // The by-txid view sorts one transaction's rows as: delayed, then
        // ready in increasing priority, then best/requested, then completed.
        // So whatever this row needs to compare against sits immediately
        // after it.
        let ann = self.announcements[&key];
        let my_key = ann.by_txid_key(&self.computer);
        let next = self
            .by_txid
            .range((Bound::Excluded(my_key), Bound::Unbounded))
            .next()
            .copied();

        match next {
            // No selected or better-ready sibling exists: this row wins.
            None => self.set_candidate_best(key),
            Some((txid, rank, ..)) if txid != ann.txid || rank == StateRank::Completed => {
                self.set_candidate_best(key)
            }
            // A weaker candidate-best exists; displace it if we rank higher.
            Some((txid, StateRank::CandidateBest, _, rival)) => {
                let best = self.announcements[&(rival, txid)];
                let rival_priority = self.computer.priority(&best.txid, best.peer, best.preferred);
                let my_priority = self.computer.priority(&ann.txid, ann.peer, ann.preferred);
                if my_priority > rival_priority {
                    self.modify((rival, txid), |a| {
                        if let State::CandidateBest { ready_at } = a.state {
                            a.state = State::CandidateReady { ready_at };
                        }
                    });
                    self.set_candidate_best(key);
                }
            }
            // A higher-priority ready candidate or an outstanding request
            // follows; this row stays merely ready.
            Some(_) => {}
        }
    }

    fn set_candidate_best(&mut self, key: PairKey) {
        self.modify(key, |a| {
            if let State::CandidateReady { ready_at } = a.state {
                a.state = State::CandidateBest { ready_at };
            }
        });
    }

    /// Moves an announcement to a non-selected state (completed, or delayed
    /// when time went backwards). If it was the selected one, the next-best
    /// ready candidate, its immediate predecessor in the by-txid view, is
    /// promoted to candidate-best in its place.
    fn change_and_reselect(&mut self, key: PairKey, new_state: State) {
        debug_assert!(
            matches!(new_state, State::Completed | State::CandidateDelayed { .. }),
            "reselection only demotes"
        );

        let ann = self.announcements[&key];
        if ann.state.is_selected() {
            let my_key = ann.by_txid_key(&self.computer);
            if let Some(&(txid, rank, _, successor)) = self.by_txid.range(..my_key).next_back() {
                if txid == ann.txid && rank == StateRank::CandidateReady {
                    self.set_candidate_best((successor, txid));
                }
            }
        }
        self.modify(key, |a| a.state = new_state);
    }

    /// Whether this is the only announcement of its transaction that is not
    /// completed.
    fn is_only_non_completed(&self, key: PairKey) -> bool {
        let ann = self.announcements[&key];
        debug_assert!(ann.state != State::Completed, "tombstones are never the survivor");

        let my_key = ann.by_txid_key(&self.computer);
        // A same-transaction predecessor ranks at or below this row, and
        // since this row is not completed, neither is the predecessor.
        if let Some(&(txid, ..)) = self.by_txid.range(..my_key).next_back() {
            if txid == ann.txid {
                return false;
            }
        }
        if let Some(&(txid, rank, ..)) =
            self.by_txid.range((Bound::Excluded(my_key), Bound::Unbounded)).next()
        {
            if txid == ann.txid && rank != StateRank::Completed {
                return false;
            }
        }
        true
    }

    /// Concludes an announcement. If no non-completed siblings remain for its
    /// transaction, every row for that transaction is erased and `false` is
    /// returned (the row no longer exists); otherwise the row becomes a
    /// completed tombstone, selection passes to the best remaining candidate,
    /// and `true` is returned.
    fn make_completed(&mut self, key: PairKey) -> bool {
        if self.announcements[&key].state == State::Completed {
            return true;
        }

        if self.is_only_non_completed(key) {
            let txid = key.1;
            let peers: Vec<PeerId> = self
                .by_txid
                .range(txid_range(txid))
                .map(|&(_, _, _, peer)| peer)
                .collect();
            for peer in peers {
                self.erase((peer, txid));
            }
            return false;
        }

        self.change_and_reselect(key, State::Completed);
        true
    }

    /// Applies a state change to one announcement, keeping all three views
    /// and the per-peer statistics consistent. Every mutation in the tracker
    /// funnels through here or through [`erase`](Self::erase).
    fn modify(&mut self, key: PairKey, f: impl FnOnce(&mut Announcement)) {
        let old = self.announcements[&key];
        let mut new = old;
        f(&mut new);

        self.unlink(&old);
        self.link(&new);
        self.announcements.insert(key, new);

        let info = self.peer_info.get_mut(&key.0).expect("tracked peer has statistics");
        info.completed -= (old.state == State::Completed) as usize;
        info.requested -= matches!(old.state, State::Requested { .. }) as usize;
        info.completed += (new.state == State::Completed) as usize;
        info.requested += matches!(new.state, State::Requested { .. }) as usize;
    }

    /// Removes one announcement from the primary store, all three views, and
    /// the per-peer statistics; a peer's statistics entry disappears with its
    /// last announcement.
    fn erase(&mut self, key: PairKey) {
        let ann = self.announcements.remove(&key).expect("erase of tracked announcement");
        self.unlink(&ann);

        match self.peer_info.entry(key.0) {
            Entry::Occupied(mut entry) => {
                let info = entry.get_mut();
                info.completed -= (ann.state == State::Completed) as usize;
                info.requested -= matches!(ann.state, State::Requested { .. }) as usize;
                info.total -= 1;
                if info.total == 0 {
                    entry.remove();
                }
            }
            Entry::Vacant(_) => unreachable!("tracked peer has statistics"),
        }
    }

    fn link(&mut self, ann: &Announcement) {
        let peer = self.by_peer.insert(ann.by_peer_key());
        let txid = self.by_txid.insert(ann.by_txid_key(&self.computer));
        let time = self.by_time.insert(ann.by_time_key());
        debug_assert!(peer && txid && time, "announcement already present in a view");
    }

    fn unlink(&mut self, ann: &Announcement) {
        let peer = self.by_peer.remove(&ann.by_peer_key());
        let txid = self.by_txid.remove(&ann.by_txid_key(&self.computer));
        let time = self.by_time.remove(&ann.by_time_key());
        debug_assert!(peer && txid && time, "announcement missing from a view");
    }

    /// Asserts the class invariants hold and the per-peer statistics match a
    /// recomputation from the table. Panics on violation; meant for tests and
    /// diagnostics, not the hot path.
    pub fn sanity_check(&self) {
        assert_eq!(self.by_peer.len(), self.announcements.len());
        assert_eq!(self.by_txid.len(), self.announcements.len());
        assert_eq!(self.by_time.len(), self.announcements.len());

        #[derive(Default)]
        struct TxIdInfo {
            candidates: usize,
            selected: usize,
            completed: usize,
            best_priority: Option<Priority>,
            top_ready_priority: Option<Priority>,
        }

        let mut peers: HashMap<PeerId, PeerInfo> = HashMap::new();
        let mut txids: HashMap<TxId, TxIdInfo> = HashMap::new();

        for (&(peer, txid), ann) in &self.announcements {
            assert_eq!((peer, txid), (ann.peer, ann.txid));
            assert!(self.by_peer.contains(&ann.by_peer_key()));
            assert!(self.by_txid.contains(&ann.by_txid_key(&self.computer)));
            assert!(self.by_time.contains(&ann.by_time_key()));

            let info = peers.entry(peer).or_default();
            info.total += 1;
            info.completed += (ann.state == State::Completed) as usize;
            info.requested += matches!(ann.state, State::Requested { .. }) as usize;

            let info = txids.entry(txid).or_default();
            match ann.state {
                State::CandidateDelayed { .. } => info.candidates += 1,
                State::CandidateReady { .. } => {
                    info.candidates += 1;
                    let priority = self.computer.priority(&ann.txid, ann.peer, ann.preferred);
                    info.top_ready_priority =
                        Some(info.top_ready_priority.map_or(priority, |top| top.max(priority)));
                }
                State::CandidateBest { .. } => {
                    info.selected += 1;
                    info.best_priority =
                        Some(self.computer.priority(&ann.txid, ann.peer, ann.preferred));
                }
                State::Requested { .. } => info.selected += 1,
                State::Completed => info.completed += 1,
            }
        }

        assert_eq!(peers, self.peer_info, "per-peer statistics diverged from the table");

        for (txid, info) in txids {
            // A transaction with only tombstones should have been erased.
            assert!(info.candidates + info.selected > 0, "stray tombstones for {txid}");
            // At most one selected announcement per transaction.
            assert!(info.selected <= 1, "multiple selected announcements for {txid}");
            // Ready candidates exist only alongside a selected announcement.
            if info.top_ready_priority.is_some() {
                assert_eq!(info.selected, 1, "ready candidates but no selection for {txid}");
            }
            // The candidate-best outranks every ready candidate.
            if let (Some(best), Some(top_ready)) = (info.best_priority, info.top_ready_priority) {
                assert!(best >= top_ready, "selected a non-best candidate for {txid}");
            }
        }
    }

    /// Asserts the time consistency that must hold right after
    /// [`get_requestable`](Self::get_requestable) returned for `now`: rows
    /// waiting on a timestamp have it in the future, requestable rows do not.
    pub fn post_get_requestable_sanity_check(&self, now: Timestamp) {
        for ann in self.announcements.values() {
            if ann.state.is_waiting() {
                assert!(ann.state.time() > now, "stale waiting announcement");
            } else if ann.state.is_selectable() {
                assert!(ann.state.time() <= now, "premature selectable announcement");
            }
        }
    }
}

/// Bounds covering every by-txid view entry of one transaction.
fn txid_range(txid: TxId) -> std::ops::RangeInclusive<ByTxIdKey> {
    (txid, StateRank::CandidateDelayed, Priority::MIN, PeerId::MIN)
        ..=(txid, StateRank::Completed, Priority::MAX, PeerId::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(fill: u8) -> TxId {
        TxId::new([fill; 32])
    }

    /// Finds a txid such that the given peers' priorities strictly decrease
    /// in the order listed, within one preference class.
    fn txid_favoring(tracker: &TxRequestTracker, order: &[PeerId]) -> TxId {
        (0..=u8::MAX)
            .map(txid)
            .find(|t| {
                order.windows(2).all(|pair| {
                    tracker.priority(t, pair[0], true) > tracker.priority(t, pair[1], true)
                })
            })
            .expect("a favorable txid among 256 candidates")
    }

    #[test]
    fn immediate_announcement_is_requestable_at_once() {
        let mut tracker = TxRequestTracker::new(true);
        tracker.received_inv(1, txid(0xaa), false, 0);
        assert_eq!(tracker.get_requestable(1, 1_000, None), vec![txid(0xaa)]);
        tracker.sanity_check();
    }

    #[test]
    fn delayed_announcement_waits_for_its_ready_time() {
        let mut tracker = TxRequestTracker::new(true);
        let t = txid(0xaa);
        tracker.received_inv(1, t, false, 5_000_000);

        assert_eq!(tracker.get_requestable(1, 0, None), Vec::<TxId>::new());
        assert_eq!(tracker.get_requestable(1, 4_999_999, None), Vec::<TxId>::new());
        assert_eq!(tracker.get_requestable(1, 5_000_000, None), vec![t]);
        tracker.sanity_check();
        tracker.post_get_requestable_sanity_check(5_000_000);
    }

    #[test]
    fn only_the_higher_priority_peer_is_offered_the_txid() {
        let mut tracker = TxRequestTracker::new(true);
        let t = txid_favoring(&tracker, &[2, 1]);

        tracker.received_inv(1, t, true, 0);
        tracker.received_inv(2, t, true, 0);

        assert_eq!(tracker.get_requestable(1, 10, None), Vec::<TxId>::new());
        assert_eq!(tracker.get_requestable(2, 10, None), vec![t]);
        tracker.sanity_check();

        // Once the winner disconnects, the loser is offered it immediately.
        tracker.disconnected_peer(2);
        assert_eq!(tracker.get_requestable(1, 10, None), vec![t]);
        tracker.sanity_check();
    }

    #[test]
    fn preferred_peer_wins_regardless_of_priority() {
        let mut tracker = TxRequestTracker::new(true);
        // Peer 2 wins the pseudorandom tie-break, but peer 1 is preferred.
        let t = txid_favoring(&tracker, &[2, 1]);

        tracker.received_inv(1, t, true, 0);
        tracker.received_inv(2, t, false, 0);

        assert_eq!(tracker.get_requestable(1, 10, None), vec![t]);
        assert_eq!(tracker.get_requestable(2, 10, None), Vec::<TxId>::new());
        tracker.sanity_check();
    }

    #[test]
    fn output_follows_announcement_order_not_readiness_order() {
        let mut tracker = TxRequestTracker::new(true);
        let t1 = txid(1);
        let t2 = txid(2);

        // t1 announced first but ready later.
        tracker.received_inv(1, t1, false, 20_000_000);
        tracker.received_inv(1, t2, false, 10_000_000);

        assert_eq!(tracker.get_requestable(1, 10_000_000, None), vec![t2]);
        assert_eq!(tracker.get_requestable(1, 20_000_000, None), vec![t1, t2]);
        tracker.sanity_check();
    }

    #[test]
    fn expired_request_moves_to_the_remaining_candidate() {
        let mut tracker = TxRequestTracker::new(true);
        let t = txid_favoring(&tracker, &[1, 2]);

        tracker.received_inv(1, t, true, 0);
        tracker.received_inv(2, t, true, 0);
        assert_eq!(tracker.get_requestable(1, 0, None), vec![t]);
        tracker.requested_tx(1, t, 30_000_000);
        assert_eq!(tracker.count_in_flight(1), 1);

        let mut expired = Vec::new();
        assert_eq!(tracker.get_requestable(1, 30_000_000, Some(&mut expired)), Vec::<TxId>::new());
        assert_eq!(expired, vec![(1, t)]);
        assert_eq!(tracker.count_in_flight(1), 0);
        assert_eq!(tracker.get_requestable(2, 30_000_000, None), vec![t]);
        tracker.sanity_check();
    }

    #[test]
    fn forgetting_is_idempotent() {
        let mut tracker = TxRequestTracker::new(true);
        let t = txid(3);

        tracker.forget_txid(t);
        tracker.received_inv(1, t, false, 0);
        tracker.forget_txid(t);
        tracker.forget_txid(t);

        assert!(tracker.is_empty());
        assert_eq!(tracker.count(1), 0);
        tracker.sanity_check();
    }

    #[test]
    fn duplicate_announcement_is_ignored_not_refreshed() {
        let mut tracker = TxRequestTracker::new(true);
        let t = txid(4);

        tracker.received_inv(1, t, false, 10);
        // Same pair again with an earlier ready time; must not take effect.
        tracker.received_inv(1, t, false, 0);

        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get_requestable(1, 9, None), Vec::<TxId>::new());
        assert_eq!(tracker.get_requestable(1, 10, None), vec![t]);
        tracker.sanity_check();
    }

    #[test]
    fn delayed_candidate_can_be_requested_eagerly() {
        // Requesting a pair that is still delayed converts it straight to
        // requested, bypassing the readiness delay.
        let mut tracker = TxRequestTracker::new(true);
        let t = txid(5);

        tracker.received_inv(1, t, false, 1_000_000);
        tracker.requested_tx(1, t, 2_000_000);

        assert_eq!(tracker.count_in_flight(1), 1);
        assert_eq!(tracker.count_candidates(1), 0);
        tracker.sanity_check();
    }

    #[test]
    fn second_request_supersedes_an_outstanding_one() {
        let mut tracker = TxRequestTracker::new(true);
        let t = txid_favoring(&tracker, &[1, 2]);

        tracker.received_inv(1, t, true, 0);
        tracker.received_inv(2, t, true, 0);
        assert_eq!(tracker.get_requestable(1, 0, None), vec![t]);
        tracker.requested_tx(1, t, u64::MAX);

        // The caller requests from the other peer anyway; the first request
        // completes so only one stays outstanding.
        tracker.requested_tx(2, t, u64::MAX);
        assert_eq!(tracker.count_in_flight(1), 0);
        assert_eq!(tracker.count(1), 1);
        assert_eq!(tracker.count_in_flight(2), 1);
        tracker.sanity_check();
    }

    #[test]
    fn tombstone_blocks_reannouncement_until_siblings_are_gone() {
        let mut tracker = TxRequestTracker::new(true);
        let t = txid(6);

        tracker.received_inv(1, t, true, 0);
        tracker.received_inv(2, t, true, 0);
        let winner = if tracker.get_requestable(1, 0, None).is_empty() { 2 } else { 1 };
        let loser = 3 - winner;

        tracker.requested_tx(winner, t, 100);
        let _ = tracker.get_requestable(winner, 100, None); // expire it
        assert_eq!(tracker.count(winner), 1, "tombstone retained");

        // The tombstone blocks a fresh announcement by the same peer.
        tracker.received_inv(winner, t, true, 0);
        assert_eq!(tracker.count_candidates(winner), 0);

        // Once the last sibling concludes, everything is erased and the pair
        // may be announced again.
        tracker.received_response(loser, t);
        assert!(tracker.is_empty());
        tracker.received_inv(winner, t, true, 0);
        assert_eq!(tracker.get_requestable(winner, 200, None), vec![t]);
        tracker.sanity_check();
    }

    #[test]
    fn counters_track_each_lifecycle_stage() {
        let mut tracker = TxRequestTracker::new(true);
        let t1 = txid(7);
        let t2 = txid(8);

        tracker.received_inv(1, t1, false, 0);
        tracker.received_inv(1, t2, false, 0);
        assert_eq!((tracker.count(1), tracker.count_candidates(1)), (2, 2));
        assert_eq!(tracker.count_in_flight(1), 0);

        assert_eq!(tracker.get_requestable(1, 0, None), vec![t1, t2]);
        tracker.requested_tx(1, t1, 100);
        assert_eq!((tracker.count(1), tracker.count_candidates(1)), (2, 1));
        assert_eq!(tracker.count_in_flight(1), 1);

        tracker.received_response(1, t1);
        assert_eq!((tracker.count(1), tracker.count_candidates(1)), (1, 1));
        assert_eq!(tracker.count_in_flight(1), 0);

        tracker.disconnected_peer(1);
        assert_eq!(tracker.count(1), 0);
        assert!(tracker.is_empty());
        tracker.sanity_check();
    }

    #[test]
    fn backward_time_suspends_readiness() {
        let mut tracker = TxRequestTracker::new(true);
        let t = txid(9);

        tracker.received_inv(1, t, false, 1_000);
        assert_eq!(tracker.get_requestable(1, 1_000, None), vec![t]);

        // The clock moves back a microsecond: no longer requestable.
        assert_eq!(tracker.get_requestable(1, 999, None), Vec::<TxId>::new());
        tracker.post_get_requestable_sanity_check(999);

        // And forward again: requestable once more.
        assert_eq!(tracker.get_requestable(1, 1_000, None), vec![t]);
        tracker.sanity_check();
    }
}
