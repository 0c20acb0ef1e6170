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

//! Lock modes, the multi-granularity compatibility matrix and the
//! conversion (join) table.

use std::fmt;

use bitflags::bitflags;

/// Number of lock modes, including `None`.
pub const MODE_COUNT: usize = 6;

/// Multi-granularity lock modes, ordered by strength. `None` is weaker than
/// everything; `IS`/`IX` and `S`/`SIX` are incomparable pairs; `X` is the
/// strongest.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(clippy::upper_case_acronyms)]
pub enum LockMode {
    /// No lock. Compatible with everything; requesting it is a no-op.
    #[default]
    None = 0,
    /// Intent shared
    IS = 1,
    /// Intent exclusive
    IX = 2,
    /// Shared
    S = 3,
    /// Shared with intent exclusive
    SIX = 4,
    /// Exclusive
    X = 5,
}

bitflags! {
    /// Set of lock modes, used for the granted and conflict aggregates of a
    /// lock head.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModeMask: u32 {
        const IS = 1 << 1;
        const IX = 1 << 2;
        const S = 1 << 3;
        const SIX = 1 << 4;
        const X = 1 << 5;
    }
}

impl From<LockMode> for ModeMask {
    fn from(mode: LockMode) -> ModeMask {
        match mode {
            LockMode::None => ModeMask::empty(),
            m => ModeMask::from_bits_retain(1 << m as u32),
        }
    }
}

const fn m(mode: LockMode) -> ModeMask {
    ModeMask::from_bits_retain(1 << mode as u32)
}

/// For each requested mode, the set of granted modes it conflicts with.
/// Indexed by `LockMode as usize`.
static CONFLICT_TABLE: [ModeMask; MODE_COUNT] = [
    // None
    ModeMask::empty(),
    // IS
    m(LockMode::X),
    // IX
    m(LockMode::S).union(m(LockMode::SIX)).union(m(LockMode::X)),
    // S
    m(LockMode::IX).union(m(LockMode::SIX)).union(m(LockMode::X)),
    // SIX
    m(LockMode::IX)
        .union(m(LockMode::S))
        .union(m(LockMode::SIX))
        .union(m(LockMode::X)),
    // X
    m(LockMode::IS)
        .union(m(LockMode::IX))
        .union(m(LockMode::S))
        .union(m(LockMode::SIX))
        .union(m(LockMode::X)),
];

/// Least upper bound of two modes. `CONVERSION_TABLE[held][requested]` is the
/// weakest mode at least as strong as both; conversions always target this.
#[rustfmt::skip]
static CONVERSION_TABLE: [[LockMode; MODE_COUNT]; MODE_COUNT] = {
    use LockMode::{IS, IX, None, S, SIX, X};
    [
        // None
        [None, IS,  IX,  S,   SIX, X],
        // IS
        [IS,   IS,  IX,  S,   SIX, X],
        // IX
        [IX,   IX,  IX,  SIX, SIX, X],
        // S
        [S,    S,   SIX, S,   SIX, X],
        // SIX
        [SIX,  SIX, SIX, SIX, SIX, X],
        // X
        [X,    X,   X,   X,   X,   X],
    ]
};

impl LockMode {
    /// Whether a request for `self` can be granted alongside the aggregate of
    /// already granted modes.
    pub fn compatible_with(self, granted: ModeMask) -> bool {
        !CONFLICT_TABLE[self as usize].intersects(granted)
    }

    /// Whether a request for `self` conflicts with a single held mode.
    pub fn conflicts_with(self, held: LockMode) -> bool {
        CONFLICT_TABLE[self as usize].intersects(held.into())
    }

    /// Least mode at least as strong as both `self` and `other`.
    pub fn join(self, other: LockMode) -> LockMode {
        CONVERSION_TABLE[self as usize][other as usize]
    }

    /// Whether `self` is at least as strong as `other`.
    pub fn covers(self, other: LockMode) -> bool {
        self.join(other) == self
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::None => "NONE",
            LockMode::IS => "IS",
            LockMode::IX => "IX",
            LockMode::S => "S",
            LockMode::SIX => "SIX",
            LockMode::X => "X",
        };
        f.write_str(name)
    }
}
