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

//! Wait-for-graph traversal for deadlock detection

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::locker::{Locker, LockerId};
use crate::manager::LockManager;

/// Result of one detector pass. The cycle, when present, lists the lockers
/// in wait order starting with the locker the detector was run for.
#[derive(Debug, Clone)]
pub struct DeadlockReport {
    cycle: Vec<LockerId>,
}

impl DeadlockReport {
    pub fn has_cycle(&self) -> bool {
        !self.cycle.is_empty()
    }

    pub fn members(&self) -> &[LockerId] {
        &self.cycle
    }
}

/// Walks the implicit wait-for graph outward from one locker and reports
/// whether that locker sits on a cycle. The graph is never materialized:
/// edges are recomputed from the lock heads' queues, one partition mutex at
/// a time, and no request condition is ever waited on. Each inspected head
/// is therefore a point-in-time snapshot, which is sound: a stuck locker's
/// wait edges can only disappear, never appear, until it is woken.
///
/// The report is advisory. The detector breaks nothing; the caller picks a
/// victim and cancels its wait.
pub struct DeadlockDetector<'a> {
    manager: &'a LockManager,
    locker: &'a Locker,
}

impl<'a> DeadlockDetector<'a> {
    pub fn new(manager: &'a LockManager, locker: &'a Locker) -> DeadlockDetector<'a> {
        DeadlockDetector { manager, locker }
    }

    /// Iterative DFS bounded by the number of waiting lockers. A locker only
    /// participates in a cycle if some chain of conflicts leads back to it;
    /// merely waiting behind a cycle (no back edge to the start) is not a
    /// deadlock for the starting locker.
    pub fn check(&self) -> DeadlockReport {
        let start = self.locker.id();
        let Some(start_res) = self.locker.waiting_resource() else {
            return DeadlockReport { cycle: Vec::new() };
        };

        let mut visited: HashSet<LockerId> = HashSet::from([start]);
        let mut parent: HashMap<LockerId, LockerId> = HashMap::new();
        let mut stack = vec![(start, start_res)];

        while let Some((current, res_id)) = stack.pop() {
            for (target, target_res) in self.manager.conflict_targets(current, res_id) {
                if target == start {
                    let mut cycle = vec![current];
                    let mut node = current;
                    while node != start {
                        node = parent[&node];
                        cycle.push(node);
                    }
                    cycle.reverse();
                    debug!("wait-for cycle from locker {}: {:?}", start, cycle);
                    return DeadlockReport { cycle };
                }
                if visited.insert(target) {
                    parent.insert(target, current);
                    if let Some(r) = target_res {
                        stack.push((target, r));
                    }
                }
            }
        }

        DeadlockReport { cycle: Vec::new() }
    }
}
