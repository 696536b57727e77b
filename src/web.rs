//! LocalStorage - the browser `localStorage` substrate.
//!
//! Reads and writes go straight to `window.localStorage`. Changes made by
//! other tabs arrive through the window `storage` event, which browsers fire
//! only in tabs other than the writer, so listeners never see their own
//! writes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    LocalStorage                       │
//! │                                                       │
//! │  get/set/remove ─────────────► window.localStorage    │
//! │                                                       │
//! │  other tab writes ──► "storage" event ──► Registry    │
//! │                        (installed on first subscribe) │
//! └──────────────────────────────────────────────────────┘
//! ```

use crate::config::ForgeConfig;
use crate::error::{ForgeError, Result};
use crate::listeners::{guarded, Registry, Subscription};
use crate::memory::MemoryStorage;
use crate::{KeyValueStore, StorageEvent, StorageListener};
use wasm_bindgen::prelude::*;

type ListenerFn = dyn Fn(&StorageEvent);

const PROBE_KEY: &str = "__shotforge_probe__";

/// Whether data written through the substrate survives a page reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceState {
	/// `localStorage` is available and accepted a probe write.
	Persisted,
	/// `localStorage` is unavailable (private browsing, blocked by policy,
	/// sandboxed iframe). Everything is held in memory and lost on reload.
	MemoryOnly,
}

/// A [`KeyValueStore`] over the browser's `localStorage`.
///
/// # Third-Party Context Warning
///
/// Browsers restrict storage in third-party iframes (Safari ITP, Firefox
/// strict mode). There [`open`](Self::open) fails and
/// [`open_or_fallback`](Self::open_or_fallback) degrades to memory.
pub struct LocalStorage {
	storage: web_sys::Storage,
	listeners: Registry<ListenerFn>,
	handler: Option<Closure<dyn FnMut(web_sys::StorageEvent)>>,
}

impl LocalStorage {
	/// Opens `window.localStorage` and verifies it accepts writes.
	pub fn open() -> Result<Self> {
		let window = web_sys::window().ok_or_else(|| ForgeError::Substrate("No window object".into()))?;
		let storage = window
			.local_storage()
			.map_err(|e| ForgeError::Substrate(format!("localStorage blocked: {:?}", e)))?
			.ok_or_else(|| ForgeError::Substrate("localStorage not available".into()))?;

		storage
			.set_item(PROBE_KEY, PROBE_KEY)
			.map_err(|e| js_error(PROBE_KEY, e))?;
		storage
			.remove_item(PROBE_KEY)
			.map_err(|e| js_error(PROBE_KEY, e))?;

		Ok(Self {
			storage,
			listeners: Registry::new(),
			handler: None,
		})
	}

	/// Opens `localStorage`, or falls back to an in-memory area sized by
	/// `config.quota_bytes` and warns on the console.
	///
	/// # Example
	///
	/// ```ignore
	/// let config = ForgeConfig::default();
	/// let (storage, state) = LocalStorage::open_or_fallback(&config);
	/// if state == PersistenceState::MemoryOnly {
	///     show_banner("Progress will not be saved in this browser window");
	/// }
	/// let forge = ShotForge::new(storage, &config)?;
	/// ```
	pub fn open_or_fallback(config: &ForgeConfig) -> (Box<dyn KeyValueStore>, PersistenceState) {
		match Self::open() {
			Ok(storage) => (Box::new(storage), PersistenceState::Persisted),
			Err(e) => {
				web_sys::console::warn_1(
					&format!(
						"localStorage unavailable ({}), falling back to memory-only storage. \
                         Progress will not persist across page refreshes.",
						e
					)
					.into(),
				);
				tracing::warn!("localStorage unavailable: {}", e);
				(
					Box::new(MemoryStorage::from_config(config)),
					PersistenceState::MemoryOnly,
				)
			}
		}
	}

	/// Adds the window `storage` listener the first time anyone subscribes.
	fn install_handler(&mut self) -> Result<()> {
		if self.handler.is_some() {
			return Ok(());
		}
		let window = web_sys::window().ok_or_else(|| ForgeError::Substrate("No window object".into()))?;

		let area = self.storage.clone();
		let listeners = self.listeners.clone();
		let handler = Closure::<dyn FnMut(web_sys::StorageEvent)>::new(
			move |event: web_sys::StorageEvent| {
				// sessionStorage fires the same event.
				if event.storage_area().as_ref() != Some(&area) {
					return;
				}
				// A null key means another tab called clear().
				let Some(key) = event.key() else {
					tracing::debug!("Ignoring localStorage.clear() from another tab");
					return;
				};
				let change = StorageEvent {
					key,
					old_value: event.old_value(),
					new_value: event.new_value(),
				};
				for listener in listeners.active() {
					guarded("storage", || listener(&change));
				}
			},
		);

		window
			.add_event_listener_with_callback("storage", handler.as_ref().unchecked_ref())
			.map_err(|e| ForgeError::Substrate(format!("Failed to listen for storage events: {:?}", e)))?;
		self.handler = Some(handler);
		Ok(())
	}
}

impl Drop for LocalStorage {
	fn drop(&mut self) {
		let Some(handler) = self.handler.take() else { return };
		if let Some(window) = web_sys::window() {
			let _ = window.remove_event_listener_with_callback("storage", handler.as_ref().unchecked_ref());
		}
	}
}

/// Maps a rejected `Storage` call, recognising the quota errors browsers
/// throw under different names.
fn js_error(key: &str, error: JsValue) -> ForgeError {
	let name = js_sys::Reflect::get(&error, &JsValue::from_str("name"))
		.ok()
		.and_then(|n| n.as_string())
		.unwrap_or_default();
	match name.as_str() {
		"QuotaExceededError" | "NS_ERROR_DOM_QUOTA_REACHED" => ForgeError::QuotaExceeded {
			key: key.to_string(),
			detail: name,
		},
		_ => ForgeError::Substrate(format!("localStorage error on '{}': {:?}", key, error)),
	}
}

impl KeyValueStore for LocalStorage {
	fn get_item(&self, key: &str) -> Result<Option<String>> {
		self.storage.get_item(key).map_err(|e| js_error(key, e))
	}

	fn set_item(&mut self, key: &str, value: &str) -> Result<()> {
		self.storage.set_item(key, value).map_err(|e| js_error(key, e))
	}

	fn remove_item(&mut self, key: &str) -> Result<()> {
		self.storage.remove_item(key).map_err(|e| js_error(key, e))
	}

	fn len(&self) -> Result<usize> {
		self.storage
			.length()
			.map(|n| n as usize)
			.map_err(|e| js_error("<length>", e))
	}

	fn key(&self, index: usize) -> Result<Option<String>> {
		self.storage
			.key(index as u32)
			.map_err(|e| js_error("<key>", e))
	}

	fn subscribe(&mut self, listener: StorageListener) -> Subscription {
		if let Err(e) = self.install_handler() {
			web_sys::console::warn_1(&format!("Cross-tab updates disabled: {}", e).into());
		}
		self.listeners.add(listener)
	}
}

#[cfg(all(test, target_arch = "wasm32"))]
mod tests {
	use super::*;
	use wasm_bindgen_test::*;

	wasm_bindgen_test_configure!(run_in_browser);

	fn unique(prefix: &str) -> String {
		format!("{}_{}_", prefix, js_sys::Math::random().to_bits())
	}

	#[wasm_bindgen_test]
	fn test_basic_operations() {
		let mut store = LocalStorage::open().expect("localStorage in test browser");
		let prefix = unique("basic");
		let key = format!("{}a", prefix);

		assert_eq!(store.get_item(&key).unwrap(), None);
		store.set_item(&key, "1").unwrap();
		store.set_item(&format!("{}b", prefix), "2").unwrap();
		assert_eq!(store.get_item(&key).unwrap().as_deref(), Some("1"));

		let mut keys = store.keys_with_prefix(&prefix).unwrap();
		keys.sort();
		assert_eq!(keys, vec![format!("{}a", prefix), format!("{}b", prefix)]);

		for k in keys {
			store.remove_item(&k).unwrap();
		}
		assert!(store.keys_with_prefix(&prefix).unwrap().is_empty());
		store.remove_item(&key).unwrap();
	}

	#[wasm_bindgen_test]
	fn test_persistence_state() {
		let (_store, state) = LocalStorage::open_or_fallback(&ForgeConfig::default());
		assert_eq!(state, PersistenceState::Persisted);
	}

	#[wasm_bindgen_test]
	fn test_subscribe_and_drop() {
		let mut store = LocalStorage::open().unwrap();
		let sub = store.subscribe(Box::new(|_| {}));
		assert!(sub.is_active());
		assert!(store.handler.is_some());
		sub.unsubscribe();
		drop(store);
	}
}
