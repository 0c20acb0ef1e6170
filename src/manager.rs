// Copyright (c) 2024-present, arana-db Community.  All rights reserved.
//
// Licensed to the Apache Software Foundation (ASF) under one or more
// contributor license agreements.  See the NOTICE file distributed with
// this work for additional information regarding copyright ownership.
// The ASF licenses this file to You under the Apache License, Version 2.0
// (the "License"); you may not use this file except in compliance with
// the License.  You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The lock manager: a hash-partitioned registry of per-resource lock heads
//! implementing the grant policy.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::Result;
use crate::locker::{LockerId, LockerInner};
use crate::mode::{LockMode, ModeMask, MODE_COUNT};
use crate::options::LockManagerOptions;
use crate::request::{LockRequest, LockResult, RequestStatus};
use crate::resource::ResourceId;

/// Outcome of cancelling a locker's wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
    /// The locker had no queued request; a racing grant may have landed.
    NotWaiting,
    /// A pending first-acquire request was removed outright.
    PendingRemoved(ResourceId),
    /// A conversion was rolled back; the previously granted mode is kept.
    ConversionCancelled(ResourceId),
}

/// Per-resource lock state: who holds it, who is strengthening, who is
/// queued for a first grant, plus the mode aggregates that make the
/// compatibility checks O(1).
///
/// Every request on the resource sits on exactly one of the three lists.
/// Requests on `granted` and `conversion` both hold their `mode`; only
/// `pending` requests hold nothing yet.
struct LockHead {
    granted: Vec<LockerId>,
    conversion: VecDeque<LockerId>,
    pending: VecDeque<LockerId>,
    requests: HashMap<LockerId, LockRequest>,

    granted_counts: [u32; MODE_COUNT],
    granted_modes: ModeMask,
    conflict_counts: [u32; MODE_COUNT],
    conflict_modes: ModeMask,
}

impl LockHead {
    fn new() -> LockHead {
        LockHead {
            granted: Vec::new(),
            conversion: VecDeque::new(),
            pending: VecDeque::new(),
            requests: HashMap::new(),
            granted_counts: [0; MODE_COUNT],
            granted_modes: ModeMask::empty(),
            conflict_counts: [0; MODE_COUNT],
            conflict_modes: ModeMask::empty(),
        }
    }

    fn incr_granted(&mut self, mode: LockMode) {
        self.granted_counts[mode as usize] += 1;
        self.granted_modes |= ModeMask::from(mode);
    }

    fn decr_granted(&mut self, mode: LockMode) {
        let count = &mut self.granted_counts[mode as usize];
        debug_assert!(*count > 0);
        *count -= 1;
        if *count == 0 {
            self.granted_modes.remove(ModeMask::from(mode));
        }
    }

    fn incr_conflict(&mut self, mode: LockMode) {
        self.conflict_counts[mode as usize] += 1;
        self.conflict_modes |= ModeMask::from(mode);
    }

    fn decr_conflict(&mut self, mode: LockMode) {
        let count = &mut self.conflict_counts[mode as usize];
        debug_assert!(*count > 0);
        *count -= 1;
        if *count == 0 {
            self.conflict_modes.remove(ModeMask::from(mode));
        }
    }

    /// Aggregate of held modes with one locker's own contribution removed.
    /// Used to decide whether that locker's conversion can be granted.
    fn granted_modes_excluding(&self, locker_id: LockerId) -> ModeMask {
        let held = self.requests[&locker_id].mode;
        let mut counts = self.granted_counts;
        counts[held as usize] -= 1;
        let mut mask = ModeMask::empty();
        for (i, &count) in counts.iter().enumerate().skip(1) {
            if count > 0 {
                mask |= ModeMask::from_bits_retain(1 << i as u32);
            }
        }
        mask
    }

    /// Re-examine the waiters after any state change. Conversions are scanned
    /// first and strictly FIFO; the pending list is only considered once the
    /// conversion list has drained, also strictly FIFO. The scan stops at the
    /// first request in a list that cannot be granted.
    fn grant_scan(&mut self) {
        while let Some(&id) = self.conversion.front() {
            let (held, target) = {
                let req = &self.requests[&id];
                (req.mode, req.convert_mode)
            };
            if !target.compatible_with(self.granted_modes_excluding(id)) {
                break;
            }
            self.conversion.pop_front();
            self.granted.push(id);
            self.decr_granted(held);
            self.incr_granted(target);
            self.decr_conflict(target);
            let req = self.requests.get_mut(&id).unwrap();
            req.mode = target;
            req.convert_mode = LockMode::None;
            req.status = RequestStatus::Granted;
            req.locker.end_wait();
            req.locker.notify(LockResult::Ok);
        }

        if !self.conversion.is_empty() {
            return;
        }

        while let Some(&id) = self.pending.front() {
            let mode = self.requests[&id].mode;
            if !mode.compatible_with(self.granted_modes) {
                break;
            }
            self.pending.pop_front();
            self.granted.push(id);
            self.incr_granted(mode);
            self.decr_conflict(mode);
            let req = self.requests.get_mut(&id).unwrap();
            req.status = RequestStatus::Granted;
            req.locker.end_wait();
            req.locker.notify(LockResult::Ok);
        }
    }
}

type PartitionMap = HashMap<ResourceId, LockHead>;

/// Hash-partitioned lock manager. Each partition's mutex guards every lock
/// head hashed into it; a thread holds at most one partition mutex at a time.
pub struct LockManager {
    partitions: Vec<Mutex<PartitionMap>>,
    request_cnt: AtomicI64,
    options: LockManagerOptions,
}

static GLOBAL_LOCK_MANAGER: OnceCell<Arc<LockManager>> = OnceCell::new();

/// Process-wide lock manager, created on first use with default options.
pub fn global_lock_manager() -> Arc<LockManager> {
    GLOBAL_LOCK_MANAGER
        .get_or_init(|| Arc::new(LockManager::new()))
        .clone()
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> LockManager {
        Self::with_options(LockManagerOptions::default()).expect("default options are valid")
    }

    pub fn with_options(options: LockManagerOptions) -> Result<LockManager> {
        options.validate()?;
        info!(
            "lock manager initialized with {} partitions",
            options.num_partitions
        );
        Ok(LockManager {
            partitions: (0..options.num_partitions)
                .map(|_| Mutex::new(PartitionMap::new()))
                .collect(),
            request_cnt: AtomicI64::new(0),
            options,
        })
    }

    pub(crate) fn options(&self) -> &LockManagerOptions {
        &self.options
    }

    #[inline]
    fn partition_for(&self, res_id: ResourceId) -> &Mutex<PartitionMap> {
        &self.partitions[res_id.raw() as usize % self.partitions.len()]
    }

    #[inline]
    fn has_quota(&self) -> bool {
        if self.options.max_requests <= 0 {
            return true;
        }
        self.request_cnt.load(Ordering::Acquire) < self.options.max_requests
    }

    /// Acquire `res_id` in `mode` on behalf of `locker`, or queue the request.
    /// Never blocks; `Waiting` means the locker must park on its notification
    /// until the grant scan promotes it.
    pub(crate) fn lock(
        &self,
        locker: &Arc<LockerInner>,
        res_id: ResourceId,
        mode: LockMode,
    ) -> LockResult {
        if mode == LockMode::None {
            return LockResult::Ok;
        }
        assert!(
            res_id.is_valid(),
            "locker {} attempted to lock the reserved zero resource id",
            locker.id()
        );

        let mut heads = self.partition_for(res_id).lock();

        if let Some(head) = heads.get_mut(&res_id) {
            if head.requests.contains_key(&locker.id()) {
                return Self::relock(head, locker, res_id, mode);
            }
        }

        if !self.has_quota() {
            return LockResult::FailedToAllocate;
        }
        self.request_cnt.fetch_add(1, Ordering::SeqCst);

        let head = heads.entry(res_id).or_insert_with(LockHead::new);
        if head.conversion.is_empty()
            && head.pending.is_empty()
            && mode.compatible_with(head.granted_modes)
        {
            head.requests.insert(
                locker.id(),
                LockRequest::new(Arc::clone(locker), mode, RequestStatus::Granted),
            );
            head.granted.push(locker.id());
            head.incr_granted(mode);
            LockResult::Ok
        } else {
            head.requests.insert(
                locker.id(),
                LockRequest::new(Arc::clone(locker), mode, RequestStatus::Waiting),
            );
            head.pending.push_back(locker.id());
            head.incr_conflict(mode);
            assert!(
                locker.waiting_resource().is_none(),
                "locker {} enqueued on {:?} while already waiting on another resource",
                locker.id(),
                res_id
            );
            locker.begin_wait(res_id);
            debug!("locker {} waiting for {:?} in mode {}", locker.id(), res_id, mode);
            LockResult::Waiting
        }
    }

    /// Second and later acquires of a resource the locker already has a
    /// request on: recursive acquire, conversion, or coalescing into a
    /// conversion already in flight.
    fn relock(
        head: &mut LockHead,
        locker: &Arc<LockerInner>,
        res_id: ResourceId,
        mode: LockMode,
    ) -> LockResult {
        let id = locker.id();
        let (status, held, convert) = {
            let req = &head.requests[&id];
            (req.status, req.mode, req.convert_mode)
        };

        match status {
            RequestStatus::Granted => {
                let target = held.join(mode);
                if target == held {
                    // Recursive acquire at a covered mode.
                    head.requests.get_mut(&id).unwrap().recursive_count += 1;
                    return LockResult::Ok;
                }

                if target.compatible_with(head.granted_modes_excluding(id)) {
                    // Conversions may overtake queued requests; only the
                    // other holders matter.
                    head.decr_granted(held);
                    head.incr_granted(target);
                    let req = head.requests.get_mut(&id).unwrap();
                    req.mode = target;
                    req.recursive_count += 1;
                    return LockResult::Ok;
                }

                let pos = head
                    .granted
                    .iter()
                    .position(|&g| g == id)
                    .expect("granted request missing from granted list");
                head.granted.remove(pos);
                head.conversion.push_back(id);
                head.incr_conflict(target);
                let req = head.requests.get_mut(&id).unwrap();
                req.status = RequestStatus::Converting;
                req.convert_mode = target;
                req.recursive_count += 1;
                assert!(
                    locker.waiting_resource().is_none(),
                    "locker {} converting {:?} while already waiting on another resource",
                    id,
                    res_id
                );
                locker.begin_wait(res_id);
                debug!(
                    "locker {} converting {:?} from {} to {}",
                    id, res_id, held, target
                );
                LockResult::Waiting
            }
            RequestStatus::Converting => {
                // Coalesce into the conversion already in flight; the request
                // keeps its queue position.
                let target = convert.join(mode);
                if target != convert {
                    head.decr_conflict(convert);
                    head.incr_conflict(target);
                }
                let req = head.requests.get_mut(&id).unwrap();
                req.convert_mode = target;
                req.recursive_count += 1;
                LockResult::Waiting
            }
            RequestStatus::Waiting => panic!(
                "locker {} re-locked {:?} while its first acquire is still pending",
                id, res_id
            ),
        }
    }

    /// Release one reference to `res_id`. Returns true iff the lock was fully
    /// released. Unlocking a resource the locker has no request on is fatal.
    pub(crate) fn unlock(&self, locker_id: LockerId, res_id: ResourceId) -> bool {
        let mut heads = self.partition_for(res_id).lock();
        let head = heads.get_mut(&res_id).unwrap_or_else(|| {
            panic!("locker {} unlocked {:?} which it does not hold", locker_id, res_id)
        });
        let (status, count, held, target, locker) = {
            let req = head.requests.get_mut(&locker_id).unwrap_or_else(|| {
                panic!("locker {} unlocked {:?} which it does not hold", locker_id, res_id)
            });
            assert!(
                req.recursive_count > 0,
                "locker {} over-released {:?}",
                locker_id,
                res_id
            );
            req.recursive_count -= 1;
            (
                req.status,
                req.recursive_count,
                req.mode,
                req.convert_mode,
                Arc::clone(&req.locker),
            )
        };

        match status {
            RequestStatus::Granted => {
                if count > 0 {
                    return false;
                }
                head.requests.remove(&locker_id);
                head.granted.retain(|&g| g != locker_id);
                head.decr_granted(held);
                self.request_cnt.fetch_sub(1, Ordering::SeqCst);
                head.grant_scan();
                if head.requests.is_empty() {
                    heads.remove(&res_id);
                }
                true
            }
            RequestStatus::Waiting => {
                // Withdrawing a first acquire that was never granted.
                assert_eq!(
                    count, 0,
                    "locker {} pending request on {:?} had stacked references",
                    locker_id, res_id
                );
                head.requests.remove(&locker_id);
                head.pending.retain(|&p| p != locker_id);
                head.decr_conflict(held);
                self.request_cnt.fetch_sub(1, Ordering::SeqCst);
                locker.end_wait();
                head.grant_scan();
                if head.requests.is_empty() {
                    heads.remove(&res_id);
                }
                true
            }
            RequestStatus::Converting => {
                // A lock only moves from Granted to Converting, so rolling the
                // conversion back restores the previously granted mode.
                head.conversion.retain(|&c| c != locker_id);
                head.granted.push(locker_id);
                head.decr_conflict(target);
                let req = head.requests.get_mut(&locker_id).unwrap();
                req.status = RequestStatus::Granted;
                req.convert_mode = LockMode::None;
                locker.end_wait();
                head.grant_scan();
                false
            }
        }
    }

    /// Withdraw `locker`'s queued request, if any, waking followers it was
    /// blocking and notifying the locker with `Cancelled`. Loses what the
    /// locker asked for, keeps what it already held.
    pub(crate) fn cancel_wait(&self, locker: &Arc<LockerInner>) -> CancelOutcome {
        let Some(res_id) = locker.waiting_resource() else {
            return CancelOutcome::NotWaiting;
        };
        let id = locker.id();
        let mut heads = self.partition_for(res_id).lock();
        let Some(head) = heads.get_mut(&res_id) else {
            return CancelOutcome::NotWaiting;
        };
        let Some(req) = head.requests.get(&id) else {
            return CancelOutcome::NotWaiting;
        };

        match req.status {
            // The grant raced ahead of the cancellation; the caller keeps it.
            RequestStatus::Granted => CancelOutcome::NotWaiting,
            RequestStatus::Waiting => {
                let mode = req.mode;
                head.requests.remove(&id);
                head.pending.retain(|&p| p != id);
                head.decr_conflict(mode);
                self.request_cnt.fetch_sub(1, Ordering::SeqCst);
                locker.end_wait();
                locker.notify(LockResult::Cancelled);
                head.grant_scan();
                if head.requests.is_empty() {
                    heads.remove(&res_id);
                }
                debug!("locker {} cancelled pending acquire of {:?}", id, res_id);
                CancelOutcome::PendingRemoved(res_id)
            }
            RequestStatus::Converting => {
                let target = req.convert_mode;
                head.conversion.retain(|&c| c != id);
                head.granted.push(id);
                head.decr_conflict(target);
                let req = head.requests.get_mut(&id).unwrap();
                req.status = RequestStatus::Granted;
                req.convert_mode = LockMode::None;
                req.recursive_count -= 1;
                locker.end_wait();
                locker.notify(LockResult::Cancelled);
                head.grant_scan();
                debug!("locker {} cancelled conversion of {:?}", id, res_id);
                CancelOutcome::ConversionCancelled(res_id)
            }
        }
    }

    /// Weaken a granted lock. Legal only for a `Granted` request and a mode
    /// covered by the held one; weakening can only unblock others, so the
    /// grant scan runs afterwards.
    pub(crate) fn downgrade(&self, locker_id: LockerId, res_id: ResourceId, new_mode: LockMode) {
        let mut heads = self.partition_for(res_id).lock();
        let head = heads.get_mut(&res_id).unwrap_or_else(|| {
            panic!("locker {} downgraded {:?} which it does not hold", locker_id, res_id)
        });
        let (status, held) = {
            let req = head.requests.get(&locker_id).unwrap_or_else(|| {
                panic!("locker {} downgraded {:?} which it does not hold", locker_id, res_id)
            });
            (req.status, req.mode)
        };
        assert!(
            status == RequestStatus::Granted,
            "locker {} downgraded {:?} while not granted",
            locker_id,
            res_id
        );
        assert!(
            new_mode != LockMode::None && held.covers(new_mode),
            "locker {} illegal downgrade of {:?} from {} to {}",
            locker_id,
            res_id,
            held,
            new_mode
        );
        if new_mode == held {
            return;
        }
        head.decr_granted(held);
        head.incr_granted(new_mode);
        head.requests.get_mut(&locker_id).unwrap().mode = new_mode;
        head.grant_scan();
    }

    /// Lockers that `waiter`, queued on `res_id`, currently waits for: holders
    /// of a conflicting granted mode and queue members ahead of it asking for
    /// a conflicting mode. Each target is returned with the resource it is
    /// itself waiting on, if any. Takes only this resource's partition mutex.
    pub(crate) fn conflict_targets(
        &self,
        waiter: LockerId,
        res_id: ResourceId,
    ) -> Vec<(LockerId, Option<ResourceId>)> {
        let heads = self.partition_for(res_id).lock();
        let Some(head) = heads.get(&res_id) else {
            return Vec::new();
        };
        let Some(wreq) = head.requests.get(&waiter) else {
            return Vec::new();
        };
        let mode = match wreq.status {
            RequestStatus::Granted => return Vec::new(),
            RequestStatus::Waiting => wreq.mode,
            RequestStatus::Converting => wreq.convert_mode,
        };

        let mut targets: Vec<LockerId> = Vec::new();

        // Holders of a conflicting mode. Converting requests still hold
        // their previously granted mode.
        for &id in head.granted.iter().chain(head.conversion.iter()) {
            if id == waiter {
                continue;
            }
            let req = &head.requests[&id];
            if req.holds_lock() && mode.conflicts_with(req.mode) && !targets.contains(&id) {
                targets.push(id);
            }
        }

        // Conversions queued ahead block with their target mode. For a
        // pending waiter the whole conversion list is ahead.
        for &id in &head.conversion {
            if id == waiter {
                break;
            }
            let req = &head.requests[&id];
            if mode.conflicts_with(req.convert_mode) && !targets.contains(&id) {
                targets.push(id);
            }
        }

        if wreq.status == RequestStatus::Waiting {
            for &id in &head.pending {
                if id == waiter {
                    break;
                }
                let req = &head.requests[&id];
                if mode.conflicts_with(req.mode) && !targets.contains(&id) {
                    targets.push(id);
                }
            }
        }

        targets
            .into_iter()
            .map(|id| (id, head.requests[&id].locker.waiting_resource()))
            .collect()
    }

    /// Log every lock head with its three queues. Debugging aid only.
    pub fn dump(&self) {
        info!("=== lock manager dump ===");
        for partition in &self.partitions {
            let heads = partition.lock();
            for (res_id, head) in heads.iter() {
                info!(
                    "{:?}: granted {:?} conflict {:?}",
                    res_id, head.granted_modes, head.conflict_modes
                );
                for &id in &head.granted {
                    let req = &head.requests[&id];
                    info!(
                        "    granted: locker {} mode {} count {}",
                        id, req.mode, req.recursive_count
                    );
                }
                for &id in &head.conversion {
                    let req = &head.requests[&id];
                    info!(
                        "    converting: locker {} held {} -> {}",
                        id, req.mode, req.convert_mode
                    );
                }
                for &id in &head.pending {
                    let req = &head.requests[&id];
                    info!("    pending: locker {} mode {}", id, req.mode);
                }
            }
        }
    }

    /// Verify the bookkeeping of one lock head. Test-only.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self, res_id: ResourceId) {
        let heads = self.partition_for(res_id).lock();
        let Some(head) = heads.get(&res_id) else {
            return;
        };

        let mut held_mask = ModeMask::empty();
        for req in head.requests.values() {
            if req.holds_lock() {
                held_mask |= ModeMask::from(req.mode);
            }
        }
        assert_eq!(held_mask, head.granted_modes);

        for &a in &head.granted {
            for &b in &head.granted {
                if a != b {
                    let ma = head.requests[&a].mode;
                    let mb = head.requests[&b].mode;
                    assert!(!ma.conflicts_with(mb), "incompatible grants {ma} and {mb}");
                }
            }
        }

        let listed = head.granted.len() + head.conversion.len() + head.pending.len();
        assert_eq!(listed, head.requests.len());
        for (&id, req) in &head.requests {
            let on_list = match req.status {
                RequestStatus::Granted => head.granted.contains(&id),
                RequestStatus::Converting => head.conversion.contains(&id),
                RequestStatus::Waiting => head.pending.contains(&id),
            };
            assert!(on_list, "request for locker {id} on the wrong list");
        }

        if !head.conversion.is_empty() || !head.pending.is_empty() {
            assert!(!head.conflict_modes.is_empty());
        }
    }

    #[cfg(test)]
    pub(crate) fn head_exists(&self, res_id: ResourceId) -> bool {
        self.partition_for(res_id).lock().contains_key(&res_id)
    }
}
