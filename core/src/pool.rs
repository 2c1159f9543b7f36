//! Free lists for per-call objects, so a steady request rate allocates nothing per call.

use std::sync::{Arc, Mutex};

/// An object that can be recycled through a [Pool]
pub trait Poolable: Default + Send + Sync {
    /// Clear the object for the next user.
    fn reset(&mut self);
}

/// A bounded free list of shared objects.
///
/// `get()` never blocks on an empty pool, it creates a fresh object instead.
/// `put()` only recycles an object nobody else holds a reference to.
pub struct Pool<T: Poolable> {
    free: Mutex<Vec<Arc<T>>>,
    capacity: usize,
}

impl<T: Poolable> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        Self { free: Mutex::new(Vec::with_capacity(capacity.min(1024))), capacity }
    }

    #[inline]
    pub fn get(&self) -> Arc<T> {
        if let Ok(mut free) = self.free.lock() {
            if let Some(item) = free.pop() {
                return item;
            }
        }
        Arc::new(T::default())
    }

    /// Take an object and fill it with `init` before sharing it
    #[inline]
    pub fn get_with<F: FnOnce(&mut T)>(&self, init: F) -> Arc<T> {
        let mut item = self.get();
        match Arc::get_mut(&mut item) {
            Some(inner) => {
                init(inner);
                item
            }
            None => {
                let mut obj = T::default();
                init(&mut obj);
                Arc::new(obj)
            }
        }
    }

    #[inline]
    pub fn put(&self, mut item: Arc<T>) {
        match Arc::get_mut(&mut item) {
            Some(inner) => inner.reset(),
            None => return,
        }
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.capacity {
                free.push(item);
            }
        }
    }

    /// Objects ready for reuse
    pub fn len(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}
