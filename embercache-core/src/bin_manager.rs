//! Bin table and placement engine.
//!
//! The manager maps a fixed table of [`BIN_COUNT`] bins onto the current set
//! of storage locations, keeping the assignment near-balanced under
//! incremental membership changes. Replaced assignments become tombstones
//! rather than vanishing, so content routed before a membership change stays
//! reachable until a prune pass drops it.
//!
//! All operations run on a single logical caller; nothing here suspends,
//! blocks, or touches I/O. Lookup results are copied out by value.

use crate::clock::Clock;
use crate::codec::{BinAssignment, BinMappings};
use crate::error::{EmberError, Result};
use crate::location::{Assignment, AssignmentId, LocationId, LocationRecord};
use crate::ordering::BalanceOrdering;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Number of bins in the table. A content hash selects a bin through its low
/// 16 bits, so the table size is fixed at 2^16.
pub const BIN_COUNT: usize = 1 << 16;

/// One bin: the assignments claiming it (live and tombstoned) plus a cached
/// count of the live ones.
#[derive(Debug, Default, Clone)]
struct Bin {
    assignments: Vec<AssignmentId>,
    active: u32,
}

/// Arena owning every assignment. Bins and location records refer into it
/// through stable [`AssignmentId`] handles; slots are recycled only after a
/// prune drops the assignment they held.
#[derive(Debug, Default)]
struct AssignmentArena {
    slots: Vec<Option<Assignment>>,
    free: Vec<u32>,
}

impl AssignmentArena {
    fn insert(&mut self, assignment: Assignment) -> AssignmentId {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(assignment);
                AssignmentId(slot)
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Some(assignment));
                AssignmentId(slot)
            }
        }
    }

    fn remove(&mut self, id: AssignmentId) -> Assignment {
        let removed = self.slots[id.0 as usize]
            .take()
            .expect("assignment slot already vacated");
        self.free.push(id.0);
        removed
    }

    fn contains(&self, id: AssignmentId) -> bool {
        self.slots
            .get(id.0 as usize)
            .map_or(false, Option::is_some)
    }

    fn get(&self, id: AssignmentId) -> &Assignment {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("stale assignment handle")
    }

    fn get_mut(&mut self, id: AssignmentId) -> &mut Assignment {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("stale assignment handle")
    }
}

/// The placement engine: bin table, location index, and balance ordering.
///
/// Single-threaded by design; callers serialize access externally (one
/// dedicated worker in practice). Precondition violations on the mutators
/// are programmer errors and panic, as documented per method; nothing else
/// fails at runtime once an engine is constructed.
pub struct BinManager {
    locations_per_bin: u32,
    bins: Vec<Bin>,
    arena: AssignmentArena,
    locations: HashMap<LocationId, LocationRecord>,
    ordering: BalanceOrdering,
    clock: Arc<dyn Clock>,
}

impl BinManager {
    /// Builds a fresh engine from a membership list.
    ///
    /// With fewer locations than `locations_per_bin`, every location is
    /// assigned to every bin. Otherwise each bin draws its members from the
    /// least-loaded locations, which lands every location within one
    /// assignment of every other.
    pub fn new(
        locations_per_bin: u32,
        initial_locations: impl IntoIterator<Item = LocationId>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut engine = Self::empty(locations_per_bin, clock)?;

        let ids: BTreeSet<LocationId> = initial_locations.into_iter().collect();
        for id in &ids {
            engine
                .locations
                .insert(id.clone(), LocationRecord::new(id.clone()));
            engine.ordering.insert(0, id.clone());
        }

        engine.fill_initial();
        tracing::debug!(
            "Built bin table for {} locations ({} per bin)",
            ids.len(),
            locations_per_bin
        );
        Ok(engine)
    }

    /// Rehydrates an engine from a decoded snapshot, carrying every
    /// tombstone over with its original expiry.
    ///
    /// The snapshot's own replication factor is read from its first bin and
    /// may differ from `locations_per_bin`: a smaller prior factor is topped
    /// up from the least-loaded locations, a larger one is capped at
    /// `locations_per_bin` per bin and then rebalanced until every location
    /// is within one assignment of every other.
    pub fn from_snapshot(
        locations_per_bin: u32,
        snapshot: &BinMappings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut engine = Self::empty(locations_per_bin, clock)?;

        if snapshot.bins().len() != BIN_COUNT {
            return Err(EmberError::CorruptSnapshot(format!(
                "snapshot holds {} bins, expected {}",
                snapshot.bins().len(),
                BIN_COUNT
            )));
        }

        let prior_factor = snapshot
            .bins()
            .first()
            .map(|bin| bin.iter().filter(|a| a.is_active()).count() as u32)
            .unwrap_or(0);

        if prior_factor > locations_per_bin {
            engine.replay(snapshot, Some(locations_per_bin))?;
            let now = engine.clock.utc_now();
            engine.prune(now);
            engine.rebalance_after_shrink(now);
        } else {
            engine.replay(snapshot, None)?;
            if prior_factor < locations_per_bin {
                engine.top_up(prior_factor);
            }
        }

        tracing::info!(
            "Restored bin table from snapshot: {} locations ({} active), prior factor {}, target {}",
            engine.locations.len(),
            engine.ordering.len(),
            prior_factor,
            locations_per_bin
        );
        Ok(engine)
    }

    fn empty(locations_per_bin: u32, clock: Arc<dyn Clock>) -> Result<Self> {
        if locations_per_bin == 0 {
            return Err(EmberError::InvalidRequest(
                "locations_per_bin must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            locations_per_bin,
            bins: vec![Bin::default(); BIN_COUNT],
            arena: AssignmentArena::default(),
            locations: HashMap::new(),
            ordering: BalanceOrdering::new(),
            clock,
        })
    }

    /// Target number of active locations per bin.
    pub fn locations_per_bin(&self) -> u32 {
        self.locations_per_bin
    }

    /// Known location records, including tombstone-only ones pending prune.
    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    /// Locations currently participating in placement.
    pub fn active_location_count(&self) -> usize {
        self.ordering.len()
    }

    /// Number of active assignments held by `id`, or `None` for an unknown
    /// location. Removed locations report zero until pruned away.
    pub fn active_count(&self, id: &LocationId) -> Option<u32> {
        self.locations.get(id).map(|record| record.active)
    }

    pub fn is_active(&self, id: &LocationId) -> bool {
        self.locations
            .get(id)
            .map_or(false, |record| self.ordering.contains(record.active, id))
    }

    /// Resolves a content hash to the active locations owning its bin.
    ///
    /// The result holds at most `locations_per_bin` entries and may be empty
    /// while the membership is still bootstrapping. Order is stable for a
    /// given engine state.
    ///
    /// # Panics
    ///
    /// Panics if `hash` is shorter than two bytes.
    pub fn lookup(&self, hash: &[u8]) -> Vec<LocationId> {
        let bin = bin_for_hash(hash);
        self.bins[bin as usize]
            .assignments
            .iter()
            .filter_map(|&aid| {
                let assignment = self.arena.get(aid);
                assignment
                    .is_active()
                    .then(|| assignment.location.clone())
            })
            .collect()
    }

    /// Every assignment currently recorded for `bin`, tombstones included.
    pub fn bin_assignments(&self, bin: u16) -> Vec<BinAssignment> {
        self.bins[bin as usize]
            .assignments
            .iter()
            .map(|&aid| {
                let assignment = self.arena.get(aid);
                BinAssignment {
                    location: assignment.location.clone(),
                    expires_at: assignment.expires_at,
                }
            })
            .collect()
    }

    /// Copies the full bin table out for persistence.
    pub fn snapshot(&self) -> BinMappings {
        let bins = (0..BIN_COUNT)
            .map(|bin| self.bin_assignments(bin as u16))
            .collect();
        BinMappings::from_bins(bins)
    }

    /// Brings a location into placement and rebalances toward it.
    ///
    /// Bins below the replication factor take the new location outright;
    /// after that, assignments move over from the most loaded locations
    /// (each move tombstoning the donor's assignment) until the newcomer is
    /// within one assignment of the maximum.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already active. Re-adding a removed location whose
    /// tombstones have not yet been pruned is allowed and produces fresh
    /// assignments.
    pub fn add_location(&mut self, id: LocationId) {
        if let Some(record) = self.locations.get(&id) {
            if self.ordering.contains(record.active, &id) {
                panic!("location {} is already active", id);
            }
            debug_assert_eq!(record.active, 0, "inactive location with live assignments");
        }
        self.locations
            .entry(id.clone())
            .or_insert_with(|| LocationRecord::new(id.clone()));
        self.ordering.insert(0, id.clone());

        let mut filled = 0u32;
        for bin in 0..BIN_COUNT {
            if self.bins[bin].active < self.locations_per_bin {
                self.assign(&id, bin as u16);
                filled += 1;
            }
        }
        let after_fill = self.locations[&id].active;
        self.ordering.update(&id, 0, after_fill);

        let moved = self.rebalance_toward(&id);
        tracing::debug!(
            "Added location {}: filled {} underfull bins, moved {} assignments",
            id,
            filled,
            moved
        );
    }

    /// Retires a location, handing each of its assignments to the
    /// least-loaded valid replacement.
    ///
    /// Every active assignment of `id` becomes a tombstone stamped with the
    /// clock's current instant; where another location can legally take the
    /// bin (fewer than the replication factor present there), a fresh active
    /// assignment is created in its place. The record itself stays in the
    /// index until its tombstones are pruned.
    ///
    /// # Panics
    ///
    /// Panics if `id` is unknown or not currently active.
    pub fn remove_location(&mut self, id: &LocationId) {
        let active = match self.locations.get(id) {
            Some(record) => record.active,
            None => panic!("location {} is not known", id),
        };
        if !self.ordering.remove(active, id) {
            panic!("location {} is not active", id);
        }

        let victims: Vec<AssignmentId> = self.locations[id]
            .assignments
            .iter()
            .copied()
            .filter(|&aid| self.arena.get(aid).is_active())
            .collect();

        let now = self.clock.utc_now();
        let mut replaced = 0usize;
        let mut unreplaced = 0usize;
        for victim in victims {
            let bin = self.arena.get(victim).bin;
            let replacement = self.take_min_valid_for_bin(bin);
            self.expire(victim, now);
            match replacement {
                Some((count, location)) => {
                    self.assign(&location, bin);
                    self.ordering.insert(count + 1, location);
                    replaced += 1;
                }
                None => unreplaced += 1,
            }
        }

        tracing::debug!(
            "Removed location {}: {} assignments replaced, {} expired without replacement",
            id,
            replaced,
            unreplaced
        );
    }

    /// Drops assignments whose expiry is at or before `now`, then purges
    /// location records left with nothing (all tombstones in the past).
    ///
    /// Active assignments, future-dated tombstones, and active locations
    /// are untouched. Idempotent for a fixed `now`. Tombstones created by
    /// [`Self::remove_location`] carry the removal instant itself, so a
    /// caller wanting a grace period passes `now - grace` as the horizon.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let mut dropped = 0usize;
        let mut touched: HashSet<LocationId> = HashSet::new();

        for bin in 0..BIN_COUNT {
            let assignments = std::mem::take(&mut self.bins[bin].assignments);
            let mut kept = Vec::with_capacity(assignments.len());
            for aid in assignments {
                let due = matches!(self.arena.get(aid).expires_at, Some(at) if at <= now);
                if due {
                    let assignment = self.arena.remove(aid);
                    touched.insert(assignment.location);
                    dropped += 1;
                } else {
                    kept.push(aid);
                }
            }
            self.bins[bin].assignments = kept;
        }

        let arena = &self.arena;
        for id in &touched {
            let record = self
                .locations
                .get_mut(id)
                .expect("pruned assignment without a location record");
            record.assignments.retain(|&aid| arena.contains(aid));
        }

        let ordering = &self.ordering;
        let before = self.locations.len();
        self.locations.retain(|id, record| {
            !record.assignments.is_empty() || ordering.contains(record.active, id)
        });
        let purged = before - self.locations.len();

        if dropped > 0 || purged > 0 {
            tracing::debug!(
                "Pruned {} expired assignments, purged {} location records",
                dropped,
                purged
            );
        }
    }

    // ── construction internals ──────────────────────────────────

    fn fill_initial(&mut self) {
        let count = self.ordering.len();
        if count == 0 {
            return;
        }

        if count <= self.locations_per_bin as usize {
            let ids: Vec<LocationId> = self.ordering.iter().map(|(_, id)| id.clone()).collect();
            for bin in 0..BIN_COUNT {
                for id in &ids {
                    self.assign(id, bin as u16);
                }
            }
            for id in ids {
                self.ordering.update(&id, 0, BIN_COUNT as u32);
            }
            return;
        }

        let mut drawn = Vec::with_capacity(self.locations_per_bin as usize);
        for bin in 0..BIN_COUNT {
            for _ in 0..self.locations_per_bin {
                drawn.push(
                    self.ordering
                        .pop_min()
                        .expect("ordering drained below the replication factor"),
                );
            }
            for (count, id) in drawn.drain(..) {
                self.assign(&id, bin as u16);
                self.ordering.insert(count + 1, id);
            }
        }
    }

    fn replay(&mut self, snapshot: &BinMappings, cap: Option<u32>) -> Result<()> {
        let mut known_active: BTreeSet<LocationId> = BTreeSet::new();

        for (bin_index, assignments) in snapshot.bins().iter().enumerate() {
            let bin = bin_index as u16;
            let mut inserted = 0u32;
            for assignment in assignments {
                self.locations
                    .entry(assignment.location.clone())
                    .or_insert_with(|| LocationRecord::new(assignment.location.clone()));

                match assignment.expires_at {
                    Some(at) => self.insert_tombstone(&assignment.location, bin, at),
                    None => {
                        known_active.insert(assignment.location.clone());
                        if self.locations[&assignment.location].bins.contains(&bin) {
                            return Err(EmberError::CorruptSnapshot(format!(
                                "bin {} holds two active assignments for {}",
                                bin, assignment.location
                            )));
                        }
                        if cap.map_or(true, |cap| inserted < cap) {
                            self.assign(&assignment.location, bin);
                            inserted += 1;
                        }
                    }
                }
            }
        }

        for id in known_active {
            let active = self.locations[&id].active;
            self.ordering.insert(active, id);
        }
        Ok(())
    }

    /// Raises every bin from a smaller prior replication factor toward the
    /// current one, drawing from the least-loaded locations.
    fn top_up(&mut self, prior_factor: u32) {
        let active_locations = self.ordering.len() as u32;
        if active_locations <= prior_factor {
            return;
        }

        if active_locations >= self.locations_per_bin {
            for bin in 0..BIN_COUNT {
                while self.bins[bin].active < self.locations_per_bin {
                    match self.take_min_valid_for_bin(bin as u16) {
                        Some((count, id)) => {
                            self.assign(&id, bin as u16);
                            self.ordering.insert(count + 1, id);
                        }
                        None => break,
                    }
                }
            }
            return;
        }

        // Fewer active locations than the new factor: every bin simply takes
        // every active location it does not already hold.
        let entries: Vec<(u32, LocationId)> = self.ordering.iter().cloned().collect();
        for (_, id) in &entries {
            for bin in 0..BIN_COUNT {
                if !self.locations[id].bins.contains(&(bin as u16)) {
                    self.assign(id, bin as u16);
                }
            }
        }
        for (old_count, id) in entries {
            let new_count = self.locations[&id].active;
            if new_count != old_count {
                self.ordering.update(&id, old_count, new_count);
            }
        }
    }

    /// Restores near-balance after a snapshot restore capped bins below the
    /// prior replication factor, by walking assignments from the most to the
    /// least loaded location.
    fn rebalance_after_shrink(&mut self, now: DateTime<Utc>) {
        let mut moved = 0usize;
        loop {
            let max = match self.ordering.max() {
                Some(entry) => entry.clone(),
                None => break,
            };
            let min = match self.ordering.min() {
                Some(entry) => entry.clone(),
                None => break,
            };
            let (max_count, max_id) = max;
            let (min_count, min_id) = min;
            if max_count <= min_count + 1 {
                break;
            }

            let bin = {
                let donor = &self.locations[&max_id];
                let receiver = &self.locations[&min_id];
                donor.bins.difference(&receiver.bins).next().copied()
            };
            let bin = match bin {
                Some(bin) => bin,
                None => break,
            };

            let victim = self.active_assignment_in_bin(&max_id, bin);
            self.expire(victim, now);
            self.assign(&min_id, bin);
            self.ordering.update(&max_id, max_count, max_count - 1);
            self.ordering.update(&min_id, min_count, min_count + 1);
            moved += 1;
        }
        if moved > 0 {
            tracing::debug!("Rebalanced {} assignments after factor shrink", moved);
        }
    }

    // ── mutation internals ──────────────────────────────────────

    /// Moves assignments from the most loaded locations onto `id` until it
    /// sits within one assignment of the maximum. Returns the number of
    /// assignments moved.
    fn rebalance_toward(&mut self, id: &LocationId) -> usize {
        let sparse = {
            let own = self.locations[id].active;
            match self.ordering.max() {
                // Few locations each owning many bins: per-donor eligible
                // sets keep the walk near-linear.
                Some((max_count, max_id)) if max_id != id => {
                    own == 0 && *max_count > self.ordering.len() as u32
                }
                _ => false,
            }
        };

        let now = self.clock.utc_now();
        let mut eligible: HashMap<LocationId, BTreeSet<u16>> = HashMap::new();
        let mut moved = 0usize;

        loop {
            let (max_count, donor) = match self.ordering.max() {
                Some(entry) => entry.clone(),
                None => break,
            };
            let own = self.locations[id].active;
            if own + 1 >= max_count || donor == *id {
                break;
            }

            let bin = if sparse {
                let donor_bins = &self.locations[&donor].bins;
                let receiver_bins = &self.locations[id].bins;
                let set = eligible
                    .entry(donor.clone())
                    .or_insert_with(|| donor_bins.difference(receiver_bins).copied().collect());
                let bin = *set
                    .iter()
                    .next()
                    .expect("donor has no bin to hand over");
                for set in eligible.values_mut() {
                    set.remove(&bin);
                }
                bin
            } else {
                let donor_bins = &self.locations[&donor].bins;
                let receiver_bins = &self.locations[id].bins;
                donor_bins
                    .difference(receiver_bins)
                    .next()
                    .copied()
                    .expect("donor has no bin to hand over")
            };

            let victim = self.active_assignment_in_bin(&donor, bin);
            self.expire(victim, now);
            self.assign(id, bin);
            self.ordering.update(&donor, max_count, max_count - 1);
            self.ordering.update(id, own, own + 1);
            moved += 1;
        }

        moved
    }

    /// Pops the least-loaded location that is not already active in `bin`,
    /// leaving it out of the ordering for the caller to reinsert with its
    /// new count. Colliding entries are stashed and restored.
    fn take_min_valid_for_bin(&mut self, bin: u16) -> Option<(u32, LocationId)> {
        let mut stash = Vec::new();
        let mut found = None;
        while let Some((count, candidate)) = self.ordering.pop_min() {
            if self.locations[&candidate].bins.contains(&bin) {
                stash.push((count, candidate));
            } else {
                found = Some((count, candidate));
                break;
            }
        }
        for (count, candidate) in stash {
            self.ordering.insert(count, candidate);
        }
        found
    }

    /// Creates an active assignment and wires both cross-references. The
    /// ordering is the caller's to update.
    fn assign(&mut self, location: &LocationId, bin: u16) -> AssignmentId {
        let aid = self.arena.insert(Assignment {
            location: location.clone(),
            bin,
            expires_at: None,
        });
        let slot = &mut self.bins[bin as usize];
        slot.assignments.push(aid);
        slot.active += 1;

        let record = self
            .locations
            .get_mut(location)
            .expect("assignment for unknown location");
        record.assignments.push(aid);
        record.active += 1;
        let first = record.bins.insert(bin);
        debug_assert!(first, "location {} already active in bin {}", location, bin);
        aid
    }

    /// Expires an active assignment in place and unwinds the active-side
    /// cross-references. The ordering is the caller's to update.
    fn expire(&mut self, aid: AssignmentId, now: DateTime<Utc>) {
        let assignment = self.arena.get_mut(aid);
        debug_assert!(assignment.is_active(), "assignment expired twice");
        assignment.expires_at = Some(now);
        let bin = assignment.bin;
        let location = assignment.location.clone();

        self.bins[bin as usize].active -= 1;
        let record = self
            .locations
            .get_mut(&location)
            .expect("assignment for unknown location");
        record.active -= 1;
        record.bins.remove(&bin);
    }

    /// Rehydrates a serialized tombstone without touching active-side state.
    fn insert_tombstone(&mut self, location: &LocationId, bin: u16, at: DateTime<Utc>) {
        let aid = self.arena.insert(Assignment {
            location: location.clone(),
            bin,
            expires_at: Some(at),
        });
        self.bins[bin as usize].assignments.push(aid);
        self.locations
            .get_mut(location)
            .expect("tombstone for unknown location")
            .assignments
            .push(aid);
    }

    fn active_assignment_in_bin(&self, location: &LocationId, bin: u16) -> AssignmentId {
        self.bins[bin as usize]
            .assignments
            .iter()
            .copied()
            .find(|&aid| {
                let assignment = self.arena.get(aid);
                assignment.is_active() && assignment.location == *location
            })
            .expect("active assignment missing from its bin")
    }
}

/// Maps a content hash to its bin: the first two bytes read little-endian.
///
/// # Panics
///
/// Panics if `hash` is shorter than two bytes.
pub fn bin_for_hash(hash: &[u8]) -> u16 {
    assert!(
        hash.len() >= 2,
        "content hash must be at least 2 bytes, got {}",
        hash.len()
    );
    u16::from(hash[0]) | (u16::from(hash[1]) << 8)
}

/// Maps an object key to its bin via SHA-256.
pub fn bin_for_key(key: &str) -> u16 {
    let digest = Sha256::digest(key.as_bytes());
    bin_for_hash(&digest)
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that data matches the expected hash
pub fn verify_hash(data: &[u8], expected_hash: &str) -> Result<()> {
    let actual_hash = compute_hash(data);
    if actual_hash != expected_hash {
        return Err(EmberError::HashMismatch {
            expected: expected_hash.to_string(),
            actual: actual_hash,
        });
    }
    Ok(())
}
