//! MemoryStorage - an in-process storage area shaped like browser
//! `localStorage`.
//!
//! One storage area can be opened by several contexts (see
//! [`MemoryStorage::new_context`]), the way several tabs of one origin share
//! `localStorage`. A write through one context is reported to listeners
//! registered through every *other* context, never to the writer.

use crate::config::ForgeConfig;
use crate::error::{ForgeError, Result};
use crate::listeners::{guarded, Registry, Subscription};
use crate::{KeyValueStore, StorageEvent, StorageListener};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(not(target_arch = "wasm32"))]
type ListenerFn = dyn Fn(&StorageEvent) + Send + Sync;
#[cfg(target_arch = "wasm32")]
type ListenerFn = dyn Fn(&StorageEvent);

/// Configuration for the in-memory storage area.
#[derive(Clone, Debug, Default)]
pub struct MemoryConfig {
	/// Maximum bytes (keys plus values) the area may hold. `None` is unbounded.
	pub quota_bytes: Option<usize>,
}

struct StorageArea {
	entries: BTreeMap<String, String>,
	used_bytes: usize,
	quota_bytes: Option<usize>,
	next_context: u64,
	contexts: Vec<(u64, Registry<ListenerFn>)>,
}

/// A handle to a shared in-memory storage area.
pub struct MemoryStorage {
	area: Arc<Mutex<StorageArea>>,
	context: u64,
	listeners: Registry<ListenerFn>,
}

impl MemoryStorage {
	/// Creates a fresh storage area and returns the first context over it.
	///
	/// # Panics
	/// * If `quota_bytes` is `Some(0)`
	///
	/// # Examples
	/// ```
	/// use shotforge::{KeyValueStore, MemoryConfig, MemoryStorage};
	///
	/// let mut storage = MemoryStorage::new(MemoryConfig { quota_bytes: Some(1024) });
	/// storage.set_item("greeting", "hello").unwrap();
	/// assert_eq!(storage.get_item("greeting").unwrap().as_deref(), Some("hello"));
	/// ```
	pub fn new(config: MemoryConfig) -> Self {
		if config.quota_bytes == Some(0) {
			panic!("quota_bytes = 0? Use None if you want no quota, not a store that refuses everything.");
		}
		let listeners = Registry::new();
		let area = StorageArea {
			entries: BTreeMap::new(),
			used_bytes: 0,
			quota_bytes: config.quota_bytes,
			next_context: 1,
			contexts: vec![(0, listeners.clone())],
		};
		Self {
			area: Arc::new(Mutex::new(area)),
			context: 0,
			listeners,
		}
	}

	/// Creates a storage area using the quota of a [`ForgeConfig`].
	pub fn from_config(config: &ForgeConfig) -> Self {
		Self::new(MemoryConfig {
			quota_bytes: config.quota_bytes,
		})
	}

	/// Opens another context over the same storage area, like a second tab
	/// of the same origin.
	pub fn new_context(&self) -> Result<Self> {
		let listeners = Registry::new();
		let mut area = self.lock()?;
		let context = area.next_context;
		area.next_context += 1;
		area.contexts.push((context, listeners.clone()));
		drop(area);

		Ok(Self {
			area: Arc::clone(&self.area),
			context,
			listeners,
		})
	}

	/// Bytes currently used by keys and values.
	pub fn used_bytes(&self) -> Result<usize> {
		Ok(self.lock()?.used_bytes)
	}

	fn lock(&self) -> Result<MutexGuard<'_, StorageArea>> {
		self.area
			.lock()
			.map_err(|_| ForgeError::Substrate("storage area lock poisoned".into()))
	}

	/// Delivers `event` to every other context. Must be called without the
	/// area lock held.
	fn broadcast(&self, targets: Vec<Registry<ListenerFn>>, event: StorageEvent) {
		for registry in targets {
			for listener in registry.active() {
				guarded("storage event", || listener(&event));
			}
		}
	}

	fn other_contexts(&self, area: &StorageArea) -> Vec<Registry<ListenerFn>> {
		area.contexts
			.iter()
			.filter(|(id, _)| *id != self.context)
			.map(|(_, registry)| registry.clone())
			.collect()
	}
}

impl Drop for MemoryStorage {
	fn drop(&mut self) {
		if let Ok(mut area) = self.area.lock() {
			area.contexts.retain(|(id, _)| *id != self.context);
		}
	}
}

impl KeyValueStore for MemoryStorage {
	fn get_item(&self, key: &str) -> Result<Option<String>> {
		Ok(self.lock()?.entries.get(key).cloned())
	}

	fn set_item(&mut self, key: &str, value: &str) -> Result<()> {
		let mut area = self.lock()?;
		let previous = area.entries.get(key).cloned();
		let freed = previous.as_ref().map_or(0, |old| key.len() + old.len());
		let needed = area.used_bytes - freed + key.len() + value.len();

		if let Some(quota) = area.quota_bytes {
			if needed > quota {
				return Err(ForgeError::QuotaExceeded {
					key: key.to_string(),
					detail: format!("{} bytes needed, {} allowed", needed, quota),
				});
			}
		}

		area.entries.insert(key.to_string(), value.to_string());
		area.used_bytes = needed;
		let targets = self.other_contexts(&area);
		drop(area);

		self.broadcast(
			targets,
			StorageEvent {
				key: key.to_string(),
				old_value: previous,
				new_value: Some(value.to_string()),
			},
		);
		Ok(())
	}

	fn remove_item(&mut self, key: &str) -> Result<()> {
		let mut area = self.lock()?;
		let Some(previous) = area.entries.remove(key) else {
			return Ok(());
		};
		area.used_bytes -= key.len() + previous.len();
		let targets = self.other_contexts(&area);
		drop(area);

		self.broadcast(
			targets,
			StorageEvent {
				key: key.to_string(),
				old_value: Some(previous),
				new_value: None,
			},
		);
		Ok(())
	}

	fn len(&self) -> Result<usize> {
		Ok(self.lock()?.entries.len())
	}

	fn key(&self, index: usize) -> Result<Option<String>> {
		Ok(self.lock()?.entries.keys().nth(index).cloned())
	}

	fn subscribe(&mut self, listener: StorageListener) -> Subscription {
		self.listeners.add(listener)
	}

	fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
		let area = self.lock()?;
		Ok(area
			.entries
			.range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
			.map(|(k, _)| k)
			.take_while(|k| k.starts_with(prefix))
			.cloned()
			.collect())
	}
}
