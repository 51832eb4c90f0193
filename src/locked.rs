//! Lock-scoped mutable state.
//!
//! Every piece of shared mutable state in the session (a resource's saved and
//! edited values, a domain's tracked host sets) lives inside a `Locked<T>`.
//! The only way in is a closure that runs while the lock is held, so the
//! critical section ends when the closure returns and callers never pair
//! acquire/release by hand. Keep the closures short: fetch anything that
//! touches the network before calling in.

use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct Locked<T> {
    inner: Mutex<T>,
}

impl<T> Locked<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Run `f` with shared access to the value.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.guard())
    }

    /// Run `f` with exclusive access to the value.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.guard())
    }

    // A panic inside a closure leaves the value as the closure left it; the
    // state types stored here stay valid after any partial update.
    fn guard(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Locked<T> {
    /// Clone the value out so it can be inspected without holding the lock.
    pub fn snapshot(&self) -> T {
        self.guard().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_is_visible_to_read() {
        let locked = Locked::new(vec![1, 2]);
        locked.update(|v| v.push(3));
        assert_eq!(locked.read(|v| v.len()), 3);
        assert_eq!(locked.snapshot(), vec![1, 2, 3]);
    }

    #[test]
    fn survives_poisoning() {
        let locked = std::sync::Arc::new(Locked::new(0u32));
        let cloned = locked.clone();
        let _ = std::thread::spawn(move || {
            cloned.update(|v| {
                *v = 7;
                panic!("boom");
            })
        })
        .join();
        assert_eq!(locked.snapshot(), 7);
    }
}
