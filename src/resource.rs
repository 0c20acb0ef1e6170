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

//! Lockable resource identifiers

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Kind of entity a [`ResourceId`] names. The tag occupies the top bits of
/// the id, so two resources of different kinds never collide.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Invalid = 0,
    Global = 1,
    /// The storage-engine flush resource. Behaves like any other resource;
    /// it only has its own tag so flush locks never alias database locks.
    Flush = 2,
    Database = 3,
    Collection = 4,
}

impl ResourceType {
    fn from_tag(tag: u64) -> ResourceType {
        match tag {
            1 => ResourceType::Global,
            2 => ResourceType::Flush,
            3 => ResourceType::Database,
            4 => ResourceType::Collection,
            _ => ResourceType::Invalid,
        }
    }
}

const TYPE_SHIFT: u32 = 60;
const KEY_MASK: u64 = (1 << TYPE_SHIFT) - 1;

/// Compact identifier for a lockable resource: a 4-bit type tag over a
/// 60-bit key. String keys are hashed; integer keys are embedded directly
/// (truncated to 60 bits). Equality and hashing are on the raw 64-bit value,
/// so two strings that hash alike share a lock head, which is safe, merely
/// pessimistic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// The reserved all-zero id. Never names a real resource.
    pub const INVALID: ResourceId = ResourceId(0);

    pub fn new(rtype: ResourceType, name: &str) -> ResourceId {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        ResourceId::compose(rtype, hasher.finish())
    }

    pub fn from_key(rtype: ResourceType, key: u64) -> ResourceId {
        ResourceId::compose(rtype, key)
    }

    fn compose(rtype: ResourceType, key: u64) -> ResourceId {
        ResourceId(((rtype as u64) << TYPE_SHIFT) | (key & KEY_MASK))
    }

    pub fn resource_type(&self) -> ResourceType {
        ResourceType::from_tag(self.0 >> TYPE_SHIFT)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Raw 64-bit value. Zero iff the id is [`ResourceId::INVALID`].
    pub fn raw(&self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> ResourceId {
        ResourceId(raw)
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{:x}", self.resource_type(), self.0 & KEY_MASK)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_is_recoverable() {
        let id = ResourceId::new(ResourceType::Database, "accounts");
        assert_eq!(id.resource_type(), ResourceType::Database);

        let id = ResourceId::from_key(ResourceType::Flush, 1);
        assert_eq!(id.resource_type(), ResourceType::Flush);
    }

    #[test]
    fn test_same_name_same_id() {
        let a = ResourceId::new(ResourceType::Collection, "users");
        let b = ResourceId::new(ResourceType::Collection, "users");
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_types_never_alias() {
        let a = ResourceId::from_key(ResourceType::Database, 42);
        let b = ResourceId::from_key(ResourceType::Collection, 42);
        assert_ne!(a, b);
    }

    #[test]
    fn test_int_key_embedded() {
        let id = ResourceId::from_key(ResourceType::Database, 7);
        assert_eq!(id.raw() & KEY_MASK, 7);
    }

    #[test]
    fn test_int_key_truncated_to_key_bits() {
        let id = ResourceId::from_key(ResourceType::Global, u64::MAX);
        assert_eq!(id.resource_type(), ResourceType::Global);
        assert_eq!(id.raw() & KEY_MASK, KEY_MASK);
    }

    #[test]
    fn test_zero_id_reserved() {
        assert!(!ResourceId::INVALID.is_valid());
        assert_eq!(ResourceId::INVALID.resource_type(), ResourceType::Invalid);

        // Any constructed id carries a non-zero tag and so is valid.
        assert!(ResourceId::from_key(ResourceType::Global, 0).is_valid());
        assert!(ResourceId::new(ResourceType::Database, "").is_valid());
    }
}
