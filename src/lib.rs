mod auth;
mod config;
mod document;
mod error;
mod field_value;
mod forge;
mod listeners;
mod memory;
mod query;
mod schema;

#[cfg(all(feature = "web", target_arch = "wasm32"))]
mod web;

pub use auth::Auth;
pub use config::ForgeConfig;
pub use document::{
	CollectionRef, DocumentChange, DocumentRef, DocumentSnapshot, Firestore, QuerySnapshot,
};
pub use error::{ForgeError, Result};
pub use field_value::FieldValue;
pub use forge::{
	level_for, level_progress, xp_for_next_level, AchievementCandidate, ShotForge, XP_PER_LEVEL,
};
pub use listeners::Subscription;
pub use memory::{MemoryConfig, MemoryStorage};
pub use query::{Direction, Filter, Operator, Query};
pub use schema::{Achievement, Challenge, Identity, User, UserStats};

#[cfg(all(feature = "web", target_arch = "wasm32"))]
pub use web::{LocalStorage, PersistenceState};

// MaybeSend trait - allows Send bound on native, but is a no-op on WASM
// since WASM is single-threaded and doesn't need Send.
//
// This lets LocalStorage (which holds a web_sys::Storage handle) sit behind
// the same shared substrate as MemoryStorage on WASM targets while still
// requiring Send on native targets where multi-threaded access is possible.

/// A trait that requires `Send` on native targets but is automatically
/// implemented for all types on WASM targets.
#[cfg(not(target_arch = "wasm32"))]
pub trait MaybeSend: Send {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Send + ?Sized> MaybeSend for T {}

#[cfg(target_arch = "wasm32")]
pub trait MaybeSend {}
#[cfg(target_arch = "wasm32")]
impl<T: ?Sized> MaybeSend for T {}

/// A change to the key-value substrate made by another context (another tab
/// over the same storage area).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageEvent {
	pub key: String,
	pub old_value: Option<String>,
	pub new_value: Option<String>,
}

/// Callback receiving [`StorageEvent`]s from other contexts.
#[cfg(not(target_arch = "wasm32"))]
pub type StorageListener = Box<dyn Fn(&StorageEvent) + Send + Sync>;
/// Callback receiving [`StorageEvent`]s from other contexts.
#[cfg(target_arch = "wasm32")]
pub type StorageListener = Box<dyn Fn(&StorageEvent)>;

/// Flat, string-keyed storage underneath the document store and auth
/// emulation. Mirrors the browser `Storage` interface: synchronous
/// get/set/remove, index-based key enumeration for prefix scans, and change
/// notification for writes made by other contexts.
///
/// This trait requires `MaybeSend`, which means:
/// - On native targets: implementations must be `Send` (thread-safe)
/// - On WASM targets: no restrictions (single-threaded environment)
pub trait KeyValueStore: MaybeSend {
	/// Returns the value stored under `key`, if any.
	fn get_item(&self, key: &str) -> Result<Option<String>>;

	/// Stores `value` under `key`. On failure (quota, storage blocked) the
	/// previous value is left untouched.
	fn set_item(&mut self, key: &str, value: &str) -> Result<()>;

	/// Removes `key`. Removing an absent key is not an error.
	fn remove_item(&mut self, key: &str) -> Result<()>;

	/// Number of stored keys.
	fn len(&self) -> Result<usize>;

	/// Returns `true` if nothing is stored.
	fn is_empty(&self) -> Result<bool> {
		Ok(self.len()? == 0)
	}

	/// Key at position `index`; the order is implementation-defined but
	/// stable while the store is not modified.
	fn key(&self, index: usize) -> Result<Option<String>>;

	/// Registers a listener for changes made by other contexts. Changes made
	/// through this handle are not reported to it.
	fn subscribe(&mut self, listener: StorageListener) -> Subscription;

	/// All keys starting with `prefix`.
	fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
		let mut keys = Vec::new();
		for index in 0..self.len()? {
			if let Some(key) = self.key(index)? {
				if key.starts_with(prefix) {
					keys.push(key);
				}
			}
		}
		Ok(keys)
	}
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Box<S> {
	fn get_item(&self, key: &str) -> Result<Option<String>> {
		(**self).get_item(key)
	}

	fn set_item(&mut self, key: &str, value: &str) -> Result<()> {
		(**self).set_item(key, value)
	}

	fn remove_item(&mut self, key: &str) -> Result<()> {
		(**self).remove_item(key)
	}

	fn len(&self) -> Result<usize> {
		(**self).len()
	}

	fn key(&self, index: usize) -> Result<Option<String>> {
		(**self).key(index)
	}

	fn subscribe(&mut self, listener: StorageListener) -> Subscription {
		(**self).subscribe(listener)
	}

	fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
		(**self).keys_with_prefix(prefix)
	}
}
