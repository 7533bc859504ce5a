// Lock helpers: a poisoned lock means a call panicked half way through a
// mutation, so the state behind it is reported instead of trusted.

use crate::error::{QuotaError, QuotaResult};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> QuotaResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| QuotaError::Storage(format!("{} lock poisoned", what)))
}

pub(crate) fn read<'a, T>(rw: &'a RwLock<T>, what: &str) -> QuotaResult<RwLockReadGuard<'a, T>> {
    rw.read()
        .map_err(|_| QuotaError::Storage(format!("{} lock poisoned", what)))
}

pub(crate) fn write<'a, T>(rw: &'a RwLock<T>, what: &str) -> QuotaResult<RwLockWriteGuard<'a, T>> {
    rw.write()
        .map_err(|_| QuotaError::Storage(format!("{} lock poisoned", what)))
}
