//! Weak-cached singleton holder.

use std::sync::{Arc, Mutex, Weak};

/// Process-wide instance holder keeping only a weak reference.
///
/// The same instance is returned until the last strong reference is
/// released; the next access creates a fresh one. This keeps on-demand
/// services (timer processor, file processor) alive exactly as long as
/// someone uses them.
///
/// Re-entrancy hazard: if `get_or_create` runs while the previous
/// instance's destructor is still executing on another thread, the old
/// weak reference is already dead and a second instance is created. The
/// new instance may briefly coexist with the tail of the old one's
/// teardown, so constructors must not assume process-wide exclusivity.
pub struct Singleton<T> {
    instance: Mutex<Option<Weak<T>>>,
}

impl<T> Singleton<T> {
    pub const fn new() -> Self {
        Self {
            instance: Mutex::new(None),
        }
    }

    /// Get the cached instance or create a new one with `create`.
    pub fn get_or_create<F>(&self, create: F) -> Arc<T>
    where
        F: FnOnce() -> Arc<T>,
    {
        let mut slot = self.instance.lock().unwrap();
        if let Some(weak) = slot.as_ref() {
            if let Some(instance) = weak.upgrade() {
                return instance;
            }
        }
        let instance = create();
        *slot = Some(Arc::downgrade(&instance));
        instance
    }

    /// Get the cached instance if it is still alive.
    pub fn get(&self) -> Option<Arc<T>> {
        self.instance.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }
}

impl<T> Default for Singleton<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_instance_while_alive() {
        let singleton: Singleton<u32> = Singleton::new();
        let a = singleton.get_or_create(|| Arc::new(7));
        let b = singleton.get_or_create(|| Arc::new(8));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, 7);
    }

    #[test]
    fn test_recreated_after_last_release() {
        let singleton: Singleton<u32> = Singleton::new();
        let a = singleton.get_or_create(|| Arc::new(1));
        drop(a);
        assert!(singleton.get().is_none());
        let b = singleton.get_or_create(|| Arc::new(2));
        assert_eq!(*b, 2);
    }

    #[test]
    fn test_get_does_not_create() {
        let singleton: Singleton<u32> = Singleton::new();
        assert!(singleton.get().is_none());
        let a = singleton.get_or_create(|| Arc::new(3));
        assert!(singleton.get().is_some());
        drop(a);
    }
}
