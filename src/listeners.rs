use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Handle returned by every subscription API. Delivery continues until
/// [`unsubscribe`](Subscription::unsubscribe) is called; dropping the handle
/// keeps the listener registered.
#[derive(Debug)]
pub struct Subscription {
	active: Arc<AtomicBool>,
}

impl Subscription {
	/// Stops delivery to the listener. Events already being dispatched may
	/// still reach it once.
	pub fn unsubscribe(self) {
		self.active.store(false, Ordering::SeqCst);
	}

	/// Returns `true` until `unsubscribe` has been called.
	pub fn is_active(&self) -> bool {
		self.active.load(Ordering::SeqCst)
	}
}

struct Entry<T: ?Sized> {
	active: Arc<AtomicBool>,
	listener: Arc<T>,
}

/// A list of listeners that can be snapshotted and invoked without holding
/// the list lock, so listeners may subscribe or unsubscribe re-entrantly.
pub(crate) struct Registry<T: ?Sized> {
	entries: Arc<Mutex<Vec<Entry<T>>>>,
}

impl<T: ?Sized> Clone for Registry<T> {
	fn clone(&self) -> Self {
		Self {
			entries: Arc::clone(&self.entries),
		}
	}
}

impl<T: ?Sized> Registry<T> {
	pub(crate) fn new() -> Self {
		Self {
			entries: Arc::new(Mutex::new(Vec::new())),
		}
	}

	pub(crate) fn add(&self, listener: Box<T>) -> Subscription {
		let active = Arc::new(AtomicBool::new(true));
		let entry = Entry {
			active: Arc::clone(&active),
			listener: Arc::from(listener),
		};
		match self.entries.lock() {
			Ok(mut entries) => entries.push(entry),
			Err(poisoned) => poisoned.into_inner().push(entry),
		}
		Subscription { active }
	}

	/// Active listeners, pruning the ones that have been unsubscribed.
	pub(crate) fn active(&self) -> Vec<Arc<T>> {
		let mut entries = match self.entries.lock() {
			Ok(entries) => entries,
			Err(poisoned) => poisoned.into_inner(),
		};
		entries.retain(|e| e.active.load(Ordering::SeqCst));
		entries.iter().map(|e| Arc::clone(&e.listener)).collect()
	}

	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.active().len()
	}
}

/// Runs a user callback, logging instead of unwinding into the store if it
/// panics.
pub(crate) fn guarded(context: &str, callback: impl FnOnce()) {
	if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
		let message = panic
			.downcast_ref::<&str>()
			.map(|s| s.to_string())
			.or_else(|| panic.downcast_ref::<String>().cloned())
			.unwrap_or_else(|| "unknown panic".to_string());
		tracing::warn!("Error in {} callback: {}", context, message);
	}
}
