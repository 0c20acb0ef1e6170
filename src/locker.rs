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

//! Per-actor lock handle

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::Mutex;

use crate::deadlock::DeadlockDetector;
use crate::manager::{global_lock_manager, CancelOutcome, LockManager};
use crate::mode::LockMode;
use crate::request::{GrantNotification, LockResult};
use crate::resource::ResourceId;

/// Unique identifier of a locker (a thread or transaction).
pub type LockerId = u64;

/// The half of a locker the manager and the deadlock detector share: its id,
/// the resource it currently waits on (raw id, 0 when idle) and the grant
/// mailbox. Every queued [`crate::request::LockRequest`] keeps an `Arc` to
/// its owner's inner, so a grant can be delivered from any thread.
pub(crate) struct LockerInner {
    id: LockerId,
    waiting_on: AtomicU64,
    notification: GrantNotification,
}

impl LockerInner {
    pub fn new(id: LockerId) -> LockerInner {
        LockerInner {
            id,
            waiting_on: AtomicU64::new(0),
            notification: GrantNotification::new(),
        }
    }

    pub fn id(&self) -> LockerId {
        self.id
    }

    /// Arm the mailbox and record the resource. Called under the partition
    /// mutex of the resource's lock head.
    pub fn begin_wait(&self, res_id: ResourceId) {
        self.notification.clear();
        self.waiting_on.store(res_id.raw(), Ordering::Release);
    }

    pub fn end_wait(&self) {
        self.waiting_on.store(0, Ordering::Release);
    }

    pub fn waiting_resource(&self) -> Option<ResourceId> {
        match self.waiting_on.load(Ordering::Acquire) {
            0 => None,
            raw => Some(ResourceId::from_raw(raw)),
        }
    }

    pub fn notify(&self, result: LockResult) {
        self.notification.notify(result);
    }

    fn wait(&self) -> LockResult {
        self.notification.wait()
    }

    fn wait_for(&self, timeout: Duration) -> Option<LockResult> {
        self.notification.wait_for(timeout)
    }
}

/// Per-actor handle through which all lock operations run. Tracks every
/// resource the locker has a request on so `unlock_all` can unwind in
/// reverse acquisition order. The handle may be shared across threads (to
/// cancel a blocked wait or run the deadlock detector against it), but lock
/// and unlock calls are meant to come from its owner.
pub struct Locker {
    inner: Arc<LockerInner>,
    manager: Arc<LockManager>,
    /// Resources with an outstanding request, in acquisition order.
    held: Mutex<Vec<ResourceId>>,
}

impl Locker {
    /// A locker bound to the process-wide manager.
    pub fn new(id: LockerId) -> Locker {
        Locker::with_manager(id, global_lock_manager())
    }

    pub fn with_manager(id: LockerId, manager: Arc<LockManager>) -> Locker {
        Locker {
            inner: Arc::new(LockerInner::new(id)),
            manager,
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> LockerId {
        self.inner.id()
    }

    pub fn manager(&self) -> &Arc<LockManager> {
        &self.manager
    }

    /// Enqueue an acquire without blocking. `Waiting` means the request was
    /// queued; follow up with [`Locker::lock`] semantics by parking on the
    /// grant, or withdraw it via [`Locker::cancel_wait`] or `unlock`.
    pub fn lock_begin(&self, res_id: ResourceId, mode: LockMode) -> LockResult {
        let result = self.manager.lock(&self.inner, res_id, mode);
        if matches!(result, LockResult::Ok | LockResult::Waiting) && mode != LockMode::None {
            self.remember(res_id);
        }
        result
    }

    /// Acquire, blocking until granted. While blocked, probes for deadlock
    /// every `deadlock_timeout`; if this locker turns out to sit on a cycle
    /// the wait is cancelled and `Deadlock` is returned.
    pub fn lock(&self, res_id: ResourceId, mode: LockMode) -> LockResult {
        self.lock_complete(res_id, mode, None)
    }

    /// Acquire with an upper bound on the wait. Expiry cancels the wait and
    /// returns `Cancelled`; a grant that races the expiry wins.
    pub fn lock_timeout(
        &self,
        res_id: ResourceId,
        mode: LockMode,
        timeout: Duration,
    ) -> LockResult {
        self.lock_complete(res_id, mode, Some(timeout))
    }

    fn lock_complete(
        &self,
        res_id: ResourceId,
        mode: LockMode,
        limit: Option<Duration>,
    ) -> LockResult {
        let converting = self.holds(res_id);
        let result = self.lock_begin(res_id, mode);
        if result != LockResult::Waiting {
            return result;
        }

        let probe = self.manager.options().deadlock_timeout;
        let deadline = limit.map(|d| Instant::now() + d);
        loop {
            let slice = match deadline {
                Some(dl) => probe.min(dl.saturating_duration_since(Instant::now())),
                None => probe,
            };
            if let Some(outcome) = self.inner.wait_for(slice) {
                return self.finish_wait(res_id, outcome, converting);
            }

            if DeadlockDetector::new(&self.manager, self).check().has_cycle() {
                warn!(
                    "locker {} blocked on {:?} is part of a deadlock cycle",
                    self.id(),
                    res_id
                );
                return self.withdraw(res_id, LockResult::Deadlock, converting);
            }

            if matches!(deadline, Some(dl) if Instant::now() >= dl) {
                return self.withdraw(res_id, LockResult::Cancelled, converting);
            }
        }
    }

    /// Withdraw our own blocked request, resolving the race against a grant
    /// that may land first: the grant wins.
    fn withdraw(&self, res_id: ResourceId, outcome: LockResult, converting: bool) -> LockResult {
        match self.manager.cancel_wait(&self.inner) {
            CancelOutcome::NotWaiting => self.finish_wait(res_id, self.inner.wait(), converting),
            CancelOutcome::PendingRemoved(res) => {
                self.forget(res);
                outcome
            }
            CancelOutcome::ConversionCancelled(_) => outcome,
        }
    }

    fn finish_wait(&self, res_id: ResourceId, outcome: LockResult, converting: bool) -> LockResult {
        if outcome == LockResult::Cancelled && !converting {
            self.forget(res_id);
        }
        outcome
    }

    /// Acquire only if it can be granted right now.
    pub fn try_lock(&self, res_id: ResourceId, mode: LockMode) -> bool {
        let converting = self.holds(res_id);
        match self.lock_begin(res_id, mode) {
            LockResult::Ok => true,
            LockResult::Waiting => match self.manager.cancel_wait(&self.inner) {
                // The grant beat the withdrawal; keep the lock.
                CancelOutcome::NotWaiting => {
                    self.finish_wait(res_id, self.inner.wait(), converting) == LockResult::Ok
                }
                CancelOutcome::PendingRemoved(res) => {
                    self.forget(res);
                    false
                }
                CancelOutcome::ConversionCancelled(_) => false,
            },
            _ => false,
        }
    }

    /// Release one reference. Returns true iff the resource was fully
    /// released. Releasing a resource this locker has no request on is fatal.
    pub fn unlock(&self, res_id: ResourceId) -> bool {
        let released = self.manager.unlock(self.id(), res_id);
        if released {
            self.forget(res_id);
        }
        released
    }

    /// Release everything, in reverse acquisition order, unwinding recursive
    /// references and pending conversions along the way.
    pub fn unlock_all(&self) {
        loop {
            let Some(res_id) = self.held.lock().last().copied() else {
                break;
            };
            while !self.unlock(res_id) {}
        }
    }

    /// Cancel this locker's blocked wait from any thread. The blocked
    /// `lock` call observes `Cancelled`. Returns false if the locker was not
    /// waiting (e.g. the grant already landed).
    pub fn cancel_wait(&self) -> bool {
        match self.manager.cancel_wait(&self.inner) {
            CancelOutcome::NotWaiting => false,
            CancelOutcome::PendingRemoved(res) => {
                self.forget(res);
                true
            }
            CancelOutcome::ConversionCancelled(_) => true,
        }
    }

    /// Weaken a held lock, waking any waiters the stronger mode was blocking.
    pub fn downgrade(&self, res_id: ResourceId, new_mode: LockMode) {
        self.manager.downgrade(self.id(), res_id, new_mode);
    }

    pub fn waiting_resource(&self) -> Option<ResourceId> {
        self.inner.waiting_resource()
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting_resource().is_some()
    }

    /// Whether this locker has an outstanding request on `res_id`.
    pub fn holds(&self, res_id: ResourceId) -> bool {
        self.held.lock().contains(&res_id)
    }

    /// Resources with an outstanding request, in acquisition order.
    pub fn held_resources(&self) -> Vec<ResourceId> {
        self.held.lock().clone()
    }

    fn remember(&self, res_id: ResourceId) {
        let mut held = self.held.lock();
        if !held.contains(&res_id) {
            held.push(res_id);
        }
    }

    fn forget(&self, res_id: ResourceId) {
        self.held.lock().retain(|&r| r != res_id);
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        let held = self.held.get_mut();
        if !held.is_empty() && !std::thread::panicking() {
            panic!(
                "locker {} destroyed while holding requests on {:?}",
                self.inner.id(),
                held
            );
        }
    }
}

/// Scope-bound lock: acquires on construction, releases one reference on
/// drop.
pub struct ScopedLock<'a> {
    locker: &'a Locker,
    res_id: ResourceId,
}

impl<'a> ScopedLock<'a> {
    /// Blocking acquire. `None` if the wait ended in cancellation or
    /// deadlock.
    pub fn new(locker: &'a Locker, res_id: ResourceId, mode: LockMode) -> Option<ScopedLock<'a>> {
        match locker.lock(res_id, mode) {
            LockResult::Ok => Some(ScopedLock { locker, res_id }),
            _ => None,
        }
    }

    /// Non-blocking acquire.
    pub fn try_new(
        locker: &'a Locker,
        res_id: ResourceId,
        mode: LockMode,
    ) -> Option<ScopedLock<'a>> {
        if locker.try_lock(res_id, mode) {
            Some(ScopedLock { locker, res_id })
        } else {
            None
        }
    }

    pub fn resource(&self) -> ResourceId {
        self.res_id
    }
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        self.locker.unlock(self.res_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceType;

    fn manager() -> Arc<LockManager> {
        Arc::new(LockManager::new())
    }

    fn db(name: &str) -> ResourceId {
        ResourceId::new(ResourceType::Database, name)
    }

    #[test]
    fn test_lock_unlock_roundtrip() {
        let mgr = manager();
        let locker = Locker::with_manager(1, mgr);
        let res = db("A");

        assert_eq!(locker.lock(res, LockMode::X), LockResult::Ok);
        assert!(locker.holds(res));
        assert!(locker.unlock(res));
        assert!(!locker.holds(res));
    }

    #[test]
    fn test_try_lock_contended() {
        let mgr = manager();
        let l1 = Locker::with_manager(1, Arc::clone(&mgr));
        let l2 = Locker::with_manager(2, mgr);
        let res = db("A");

        assert_eq!(l1.lock(res, LockMode::X), LockResult::Ok);
        assert!(!l2.try_lock(res, LockMode::S));
        assert!(!l2.holds(res));
        assert!(!l2.is_waiting());

        l1.unlock(res);
        assert!(l2.try_lock(res, LockMode::S));
        l2.unlock(res);
    }

    #[test]
    fn test_try_lock_withdrawal_unblocks_queue() {
        let mgr = manager();
        let l1 = Locker::with_manager(1, Arc::clone(&mgr));
        let l2 = Locker::with_manager(2, mgr);
        let res = db("A");

        assert_eq!(l1.lock(res, LockMode::S), LockResult::Ok);
        assert!(!l2.try_lock(res, LockMode::X));

        // The withdrawn X must not linger and block compatible requests.
        assert!(l2.try_lock(res, LockMode::S));
        l1.unlock(res);
        l2.unlock(res);
    }

    #[test]
    fn test_unlock_all_reverse_order() {
        let mgr = manager();
        let locker = Locker::with_manager(1, mgr);
        let a = db("A");
        let b = db("B");
        let c = db("C");

        locker.lock(a, LockMode::IS);
        locker.lock(b, LockMode::IX);
        locker.lock(c, LockMode::X);
        locker.lock(b, LockMode::IX); // recursive
        assert_eq!(locker.held_resources(), vec![a, b, c]);

        locker.unlock_all();
        assert!(locker.held_resources().is_empty());
    }

    #[test]
    fn test_recursive_release_is_counted() {
        let mgr = manager();
        let locker = Locker::with_manager(1, mgr);
        let res = db("A");

        assert_eq!(locker.lock(res, LockMode::S), LockResult::Ok);
        assert_eq!(locker.lock(res, LockMode::S), LockResult::Ok);
        assert!(!locker.unlock(res));
        assert!(locker.holds(res));
        assert!(locker.unlock(res));
        assert!(!locker.holds(res));
    }

    #[test]
    fn test_scoped_lock_releases_on_drop() {
        let mgr = manager();
        let l1 = Locker::with_manager(1, Arc::clone(&mgr));
        let l2 = Locker::with_manager(2, mgr);
        let res = db("A");

        {
            let guard = ScopedLock::new(&l1, res, LockMode::X).unwrap();
            assert_eq!(guard.resource(), res);
            assert!(ScopedLock::try_new(&l2, res, LockMode::S).is_none());
        }
        assert!(ScopedLock::try_new(&l2, res, LockMode::S).is_some());
        assert!(!l2.holds(res));
    }

    #[test]
    #[should_panic(expected = "destroyed while holding")]
    fn test_dropping_nonempty_locker_is_fatal() {
        let mgr = manager();
        let locker = Locker::with_manager(1, mgr);
        locker.lock(db("A"), LockMode::S);
        drop(locker);
    }
}
