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

//! Lock manager options and configuration

use std::time::Duration;

use crate::error::{InvalidOptionsSnafu, Result};

/// Number of hash partitions the lock head registry is split across.
pub const DEFAULT_NUM_PARTITIONS: usize = 128;

/// How long a blocked acquire waits before probing for a deadlock.
pub const DEFAULT_DEADLOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Lock manager options
#[derive(Debug, Clone)]
pub struct LockManagerOptions {
    /// Number of partitions guarding the lock head registry
    pub num_partitions: usize,
    /// Maximum number of outstanding lock requests, -1 means no limit
    pub max_requests: i64,
    /// Interval between deadlock probes while an acquire is blocked
    pub deadlock_timeout: Duration,
}

impl Default for LockManagerOptions {
    fn default() -> Self {
        Self {
            num_partitions: DEFAULT_NUM_PARTITIONS,
            max_requests: -1,
            deadlock_timeout: DEFAULT_DEADLOCK_TIMEOUT,
        }
    }
}

impl LockManagerOptions {
    pub fn validate(&self) -> Result<()> {
        if self.num_partitions == 0 {
            return InvalidOptionsSnafu {
                message: "num_partitions must be non-zero",
            }
            .fail();
        }
        if self.deadlock_timeout.is_zero() {
            return InvalidOptionsSnafu {
                message: "deadlock_timeout must be non-zero",
            }
            .fail();
        }
        Ok(())
    }
}
