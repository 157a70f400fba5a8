//! The lock guarding a device's topology (its attach info, volume table and the like).
//!
//! Normal I/O holds it shared; anything that rebuilds the topology, like a rescan, holds it
//! exclusively. The underlying [parking_lot::RwLock] is fair: once a maintenance operation is
//! waiting, new normal holders queue behind it, so a steady stream of I/O cannot starve it.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub struct TopologyLock<T> {
    inner: RwLock<T>,
}

impl<T> TopologyLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Shared access, for ordinary I/O
    pub fn normal(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    /// Exclusive access, for changing the topology
    pub fn maintenance(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    /// Exclusive access if nobody else holds the lock
    pub fn try_maintenance(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.inner.try_write()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_shared_and_exclusive() {
        let lock = TopologyLock::new(5u32);
        {
            let a = lock.normal();
            let b = lock.normal();
            assert_eq!(*a + *b, 10);
            assert!(lock.try_maintenance().is_none());
        }
        *lock.maintenance() += 1;
        assert_eq!(lock.into_inner(), 6);
    }

    #[test]
    fn test_maintenance_waits_for_readers() {
        let lock = Arc::new(TopologyLock::new(Vec::<u32>::new()));
        let done = Arc::new(AtomicBool::new(false));

        let reader = lock.normal();
        let writer = {
            let lock = lock.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                lock.maintenance().push(1);
                done.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));
        assert!(reader.is_empty());
        drop(reader);

        writer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(*lock.normal(), [1]);
    }
}
