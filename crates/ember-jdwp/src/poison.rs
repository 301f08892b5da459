use std::panic::Location;
use std::sync::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[track_caller]
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, context: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(err) => {
            let loc = Location::caller();
            tracing::error!(
              target = "ember.jdwp",
              context,
              file = loc.file(),
              line = loc.line(),
              error = %err,
              "mutex poisoned; continuing with recovered guard"
            );
            err.into_inner()
        }
    }
}

#[track_caller]
pub(crate) fn wait<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    context: &'static str,
) -> MutexGuard<'a, T> {
    match cond.wait(guard) {
        Ok(guard) => guard,
        Err(err) => {
            let loc = Location::caller();
            tracing::error!(
              target = "ember.jdwp",
              context,
              file = loc.file(),
              line = loc.line(),
              error = %err,
              "condvar wait poisoned; continuing with recovered guard"
            );
            err.into_inner()
        }
    }
}

#[track_caller]
pub(crate) fn read<'a, T>(lock: &'a RwLock<T>, context: &'static str) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(err) => {
            let loc = Location::caller();
            tracing::error!(
              target = "ember.jdwp",
              context,
              file = loc.file(),
              line = loc.line(),
              error = %err,
              "rwlock poisoned; continuing with recovered guard"
            );
            err.into_inner()
        }
    }
}

#[track_caller]
pub(crate) fn write<'a, T>(lock: &'a RwLock<T>, context: &'static str) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(err) => {
            let loc = Location::caller();
            tracing::error!(
              target = "ember.jdwp",
              context,
              file = loc.file(),
              line = loc.line(),
              error = %err,
              "rwlock poisoned; continuing with recovered guard"
            );
            err.into_inner()
        }
    }
}
