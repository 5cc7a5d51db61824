//! Poison-tolerant lock helpers.
//!
//! The guarded state in this crate (idle pool slots, in-memory objects) stays
//! consistent across a panicking holder, so a poisoned lock is logged and
//! recovered rather than propagated.

use std::sync::{LockResult, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recover<G>(result: LockResult<G>, owner: &'static str, field: &'static str, kind: &'static str) -> G {
    result.unwrap_or_else(|poisoned| {
        warn!(
            target = owner,
            field,
            lock_kind = kind,
            result = "poisoned_recovered",
            "Lock holder panicked; continuing with inner state"
        );
        poisoned.into_inner()
    })
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    field: &'static str,
) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), owner, field, "read")
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    field: &'static str,
) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), owner, field, "write")
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    owner: &'static str,
    field: &'static str,
) -> MutexGuard<'a, T> {
    recover(lock.lock(), owner, field, "mutex")
}
