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

//! Hierarchical resource lock manager with wait-for-graph deadlock
//! detection.
//!
//! Lockers acquire named resources in multi-granularity modes (`IS`, `IX`,
//! `S`, `SIX`, `X`); the manager arbitrates grants against a fixed
//! compatibility matrix, queues conflicting requests FIFO with
//! conversion-before-pending priority, and parks waiters on per-locker
//! condition variables. A blocked locker (or any interested thread) can run
//! the [`DeadlockDetector`] to find out whether it sits on a wait-for cycle
//! and pick a victim to cancel.
//!
//! ```
//! use lockmgr::{LockMode, Locker, ResourceId, ResourceType};
//!
//! let locker = Locker::new(1);
//! let orders = ResourceId::new(ResourceType::Collection, "orders");
//! locker.lock(orders, LockMode::IX);
//! // ... write under the intent lock ...
//! locker.unlock(orders);
//! ```

mod deadlock;
mod error;
mod locker;
mod manager;
mod mode;
mod options;
mod request;
mod resource;

pub use deadlock::{DeadlockDetector, DeadlockReport};
pub use error::{Error, Result};
pub use locker::{Locker, LockerId, ScopedLock};
pub use manager::{global_lock_manager, LockManager};
pub use mode::{LockMode, ModeMask, MODE_COUNT};
pub use options::{LockManagerOptions, DEFAULT_DEADLOCK_TIMEOUT, DEFAULT_NUM_PARTITIONS};
pub use request::LockResult;
pub use resource::{ResourceId, ResourceType};
