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

//! Per-(locker, resource) request state and the grant notification primitive

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::locker::LockerInner;
use crate::mode::LockMode;

/// Outcome of a lock operation. Contention outcomes, not errors: the caller
/// decides whether to wait, retry or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// The request is granted.
    Ok,
    /// The request was queued; the locker must wait for the grant.
    Waiting,
    /// The wait was cancelled (victim abort, timeout or explicit cancel).
    Cancelled,
    /// The blocked acquire detected that its owner participates in a cycle.
    Deadlock,
    /// The manager refused to create a new request (request quota exhausted).
    FailedToAllocate,
}

impl fmt::Display for LockResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockResult::Ok => "OK",
            LockResult::Waiting => "WAITING",
            LockResult::Cancelled => "CANCELLED",
            LockResult::Deadlock => "DEADLOCK",
            LockResult::FailedToAllocate => "FAILED_TO_ALLOCATE",
        };
        f.write_str(name)
    }
}

/// Which of the lock head's lists a request currently sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// On the granted list, holding `mode`.
    Granted,
    /// On the pending list, waiting for a first grant of `mode`.
    Waiting,
    /// On the conversion list, holding `mode` and waiting to strengthen to
    /// `convert_mode`.
    Converting,
}

/// State of one locker's request on one resource. At most one exists per
/// (locker, resource); repeated acquires bump `recursive_count` and repeated
/// conversions coalesce into `convert_mode`. All fields are guarded by the
/// partition mutex of the owning lock head.
pub(crate) struct LockRequest {
    pub locker: Arc<LockerInner>,
    pub status: RequestStatus,
    /// Held mode once granted; the requested mode while status is `Waiting`.
    pub mode: LockMode,
    /// Conversion target while status is `Converting`, `None` otherwise.
    pub convert_mode: LockMode,
    pub recursive_count: u32,
}

impl LockRequest {
    pub fn new(locker: Arc<LockerInner>, mode: LockMode, status: RequestStatus) -> LockRequest {
        LockRequest {
            locker,
            status,
            mode,
            convert_mode: LockMode::None,
            recursive_count: 1,
        }
    }

    /// The mode this request is asking for: the conversion target while
    /// converting, the queued mode otherwise.
    pub fn requested_mode(&self) -> LockMode {
        match self.status {
            RequestStatus::Converting => self.convert_mode,
            _ => self.mode,
        }
    }

    /// Whether the request currently holds its `mode` on the resource.
    pub fn holds_lock(&self) -> bool {
        matches!(
            self.status,
            RequestStatus::Granted | RequestStatus::Converting
        )
    }
}

/// One-slot grant mailbox. The manager deposits the outcome under its own
/// mutex and signals; the blocked locker thread consumes it. Cleared before
/// every new wait so a stale outcome can never satisfy a later one.
pub(crate) struct GrantNotification {
    slot: Mutex<Option<LockResult>>,
    cond: Condvar,
}

impl GrantNotification {
    pub fn new() -> GrantNotification {
        GrantNotification {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }

    pub fn notify(&self, result: LockResult) {
        let mut slot = self.slot.lock();
        *slot = Some(result);
        self.cond.notify_one();
    }

    /// Block until an outcome is deposited.
    pub fn wait(&self) -> LockResult {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.cond.wait(&mut slot);
        }
    }

    /// Block for at most `timeout`. Returns `None` on expiry.
    pub fn wait_for(&self, timeout: Duration) -> Option<LockResult> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return Some(result);
            }
            if self.cond.wait_until(&mut slot, deadline).timed_out() {
                return slot.take();
            }
        }
    }
}
