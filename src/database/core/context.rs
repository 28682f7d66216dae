//! Execution-context local storage
//!
//! `ContextLocal<T>` gives every thread its own independent slot for a value,
//! keyed by the owning object rather than by a `static`. This lets each
//! engine keep one connection per thread and each database keep one session
//! per thread, while the owners themselves stay `Send + Sync`.
//!
//! Values are dropped when their thread exits. Dropping a `ContextLocal`
//! only clears the slot of the thread doing the drop; slots left on other
//! threads are released when those threads end.

use anyhow::Result;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SLOT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static SLOTS: RefCell<HashMap<u64, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

/// A value slot that is private to each execution context (thread)
pub struct ContextLocal<T: 'static> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> ContextLocal<T> {
    pub fn new() -> Self {
        Self {
            id: NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }

    /// Clone of the current context's value, if one is set
    pub fn get(&self) -> Option<T> {
        SLOTS.with(|slots| {
            slots
                .borrow()
                .get(&self.id)
                .and_then(|value| value.downcast_ref::<T>())
                .cloned()
        })
    }

    /// Store a value for the current context, returning the one it replaces
    pub fn set(&self, value: T) -> Option<T> {
        let previous = SLOTS.with(|slots| slots.borrow_mut().insert(self.id, Box::new(value)));
        previous.and_then(|value| value.downcast::<T>().ok().map(|boxed| *boxed))
    }

    /// Remove and return the current context's value
    pub fn take(&self) -> Option<T> {
        let previous = SLOTS.with(|slots| slots.borrow_mut().remove(&self.id));
        previous.and_then(|value| value.downcast::<T>().ok().map(|boxed| *boxed))
    }

    /// Return the current context's value, creating it with `init` if absent
    ///
    /// `init` runs without any slot borrowed, so it may use other
    /// `ContextLocal`s freely.
    pub fn get_or_try_insert_with<F>(&self, init: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.get() {
            return Ok(value);
        }
        let value = init()?;
        self.set(value.clone());
        Ok(value)
    }

    pub fn is_set(&self) -> bool {
        SLOTS.with(|slots| slots.borrow().contains_key(&self.id))
    }
}

impl<T: Clone + 'static> Default for ContextLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Drop for ContextLocal<T> {
    fn drop(&mut self) {
        // The thread's storage may already be gone during thread teardown
        let removed = SLOTS
            .try_with(|slots| slots.try_borrow_mut().ok().and_then(|mut s| s.remove(&self.id)))
            .ok()
            .flatten();
        drop(removed);
    }
}

impl<T: 'static> std::fmt::Debug for ContextLocal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLocal").field("id", &self.id).finish()
    }
}
