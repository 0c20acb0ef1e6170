use std::sync::Arc;

use lockmgr::{
    DeadlockDetector, LockManager, LockMode, LockResult, Locker, ResourceId, ResourceType,
};

fn has_cycle(mgr: &LockManager, locker: &Locker) -> bool {
    DeadlockDetector::new(mgr, locker).check().has_cycle()
}

#[test]
fn test_no_deadlock() {
    let mgr = Arc::new(LockManager::new());
    let res = ResourceId::new(ResourceType::Database, "A");

    let locker1 = Locker::with_manager(1, Arc::clone(&mgr));
    let locker2 = Locker::with_manager(2, Arc::clone(&mgr));

    assert_eq!(locker1.lock_begin(res, LockMode::S), LockResult::Ok);
    assert_eq!(locker2.lock_begin(res, LockMode::S), LockResult::Ok);

    assert!(!has_cycle(&mgr, &locker1));
    assert!(!has_cycle(&mgr, &locker2));

    locker1.unlock_all();
    locker2.unlock_all();
}

#[test]
fn test_simple_deadlock() {
    let mgr = Arc::new(LockManager::new());
    let res_a = ResourceId::new(ResourceType::Database, "A");
    let res_b = ResourceId::new(ResourceType::Database, "B");

    let locker1 = Locker::with_manager(1, Arc::clone(&mgr));
    let locker2 = Locker::with_manager(2, Arc::clone(&mgr));

    assert_eq!(locker1.lock_begin(res_a, LockMode::X), LockResult::Ok);
    assert_eq!(locker2.lock_begin(res_b, LockMode::X), LockResult::Ok);

    // 1 -> 2
    assert_eq!(locker1.lock_begin(res_b, LockMode::X), LockResult::Waiting);
    // 2 -> 1
    assert_eq!(locker2.lock_begin(res_a, LockMode::X), LockResult::Waiting);

    assert!(has_cycle(&mgr, &locker1));
    assert!(has_cycle(&mgr, &locker2));

    let report = DeadlockDetector::new(&mgr, &locker1).check();
    assert_eq!(report.members(), &[1, 2]);

    locker1.unlock_all();
    locker2.unlock_all();
}

#[test]
fn test_upgrade_deadlock() {
    let mgr = Arc::new(LockManager::new());
    let res = ResourceId::new(ResourceType::Database, "A");

    let locker1 = Locker::with_manager(1, Arc::clone(&mgr));
    let locker2 = Locker::with_manager(2, Arc::clone(&mgr));

    // Both acquire in intent mode.
    assert_eq!(locker1.lock_begin(res, LockMode::IX), LockResult::Ok);
    assert_eq!(locker2.lock_begin(res, LockMode::IX), LockResult::Ok);

    // Both try to upgrade; each is blocked by the other's intent lock.
    assert_eq!(locker1.lock_begin(res, LockMode::X), LockResult::Waiting);
    assert_eq!(locker2.lock_begin(res, LockMode::X), LockResult::Waiting);

    assert!(has_cycle(&mgr, &locker1));
    assert!(has_cycle(&mgr, &locker2));

    locker1.unlock_all();
    locker2.unlock_all();
}

#[test]
fn test_indirect_waiter_not_in_cycle() {
    let mgr = Arc::new(LockManager::new());
    let res_a = ResourceId::new(ResourceType::Database, "A");
    let res_b = ResourceId::new(ResourceType::Database, "B");

    let locker1 = Locker::with_manager(1, Arc::clone(&mgr));
    let locker2 = Locker::with_manager(2, Arc::clone(&mgr));
    let indirect = Locker::with_manager(3, Arc::clone(&mgr));

    assert_eq!(locker1.lock_begin(res_a, LockMode::X), LockResult::Ok);
    assert_eq!(locker2.lock_begin(res_b, LockMode::X), LockResult::Ok);

    // 1 -> 2
    assert_eq!(locker1.lock_begin(res_b, LockMode::X), LockResult::Waiting);
    // 2 -> 1
    assert_eq!(locker2.lock_begin(res_a, LockMode::X), LockResult::Waiting);
    // 3 -> 2
    assert_eq!(indirect.lock_begin(res_a, LockMode::X), LockResult::Waiting);

    assert!(has_cycle(&mgr, &locker1));
    assert!(has_cycle(&mgr, &locker2));

    // The indirect locker waits on the cycle's members but no chain of
    // conflicts leads back to it.
    assert!(!has_cycle(&mgr, &indirect));

    locker1.unlock_all();
    locker2.unlock_all();
    indirect.unlock_all();
}

#[test]
fn test_indirect_deadlock_with_upgrade() {
    let mgr = Arc::new(LockManager::new());
    let res_flush = ResourceId::from_key(ResourceType::Flush, 1);
    let res_db = ResourceId::from_key(ResourceType::Database, 2);

    let flush = Locker::with_manager(1, Arc::clone(&mgr));
    let reader = Locker::with_manager(2, Arc::clone(&mgr));
    let writer = Locker::with_manager(3, Arc::clone(&mgr));

    // The sequence the storage-engine flush produces.
    assert_eq!(writer.lock_begin(res_flush, LockMode::IX), LockResult::Ok);
    assert_eq!(writer.lock_begin(res_db, LockMode::X), LockResult::Ok);

    assert_eq!(reader.lock_begin(res_flush, LockMode::IS), LockResult::Ok);

    // R -> W
    assert_eq!(reader.lock_begin(res_db, LockMode::S), LockResult::Waiting);

    // R -> W
    // F -> W
    assert_eq!(flush.lock_begin(res_flush, LockMode::S), LockResult::Waiting);

    // W yields its flush lock, so now F is granted in mode S.
    //
    // R -> W
    assert!(writer.unlock(res_flush));
    assert!(!flush.is_waiting());

    // The flush locker upgrades S -> X in order to remap.
    //
    // R -> W
    // F -> R
    assert_eq!(flush.lock_begin(res_flush, LockMode::X), LockResult::Waiting);

    // W comes back from its commit and re-acquires the flush lock.
    //
    // R -> W
    // F -> R
    // W -> F
    assert_eq!(writer.lock_begin(res_flush, LockMode::IX), LockResult::Waiting);

    // Every participant sees the cycle.
    assert!(has_cycle(&mgr, &flush));
    assert!(has_cycle(&mgr, &reader));
    assert!(has_cycle(&mgr, &writer));

    flush.unlock_all();
    writer.unlock_all();
    reader.unlock_all();
}

#[test]
fn test_detector_after_cycle_broken() {
    let mgr = Arc::new(LockManager::new());
    let res_a = ResourceId::new(ResourceType::Database, "A");
    let res_b = ResourceId::new(ResourceType::Database, "B");

    let locker1 = Locker::with_manager(1, Arc::clone(&mgr));
    let locker2 = Locker::with_manager(2, Arc::clone(&mgr));

    assert_eq!(locker1.lock_begin(res_a, LockMode::X), LockResult::Ok);
    assert_eq!(locker2.lock_begin(res_b, LockMode::X), LockResult::Ok);
    assert_eq!(locker1.lock_begin(res_b, LockMode::X), LockResult::Waiting);
    assert_eq!(locker2.lock_begin(res_a, LockMode::X), LockResult::Waiting);
    assert!(has_cycle(&mgr, &locker1));

    // Aborting one participant withdraws its request and dissolves the cycle.
    assert!(locker2.cancel_wait());
    assert!(!has_cycle(&mgr, &locker1));

    locker1.unlock_all();
    locker2.unlock_all();
}
