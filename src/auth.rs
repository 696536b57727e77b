//! Email/password auth emulated on the key-value substrate.
//!
//! Accounts live in a single directory entry (`uid -> credentials`); the
//! signed-in user is a separate session pointer entry. Changes to the session
//! pointer made by other contexts arrive as storage events and are forwarded
//! to session subscribers.

use crate::config::ForgeConfig;
use crate::document::{lock_storage, DynStorage, SharedStorage};
use crate::error::{ForgeError, Result};
use crate::field_value::now_timestamp;
use crate::listeners::{guarded, Registry, Subscription};
use crate::schema::Identity;
use crate::{KeyValueStore, StorageEvent};
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[cfg(not(target_arch = "wasm32"))]
type SessionFn = dyn Fn(Option<&Identity>) + Send + Sync;
#[cfg(target_arch = "wasm32")]
type SessionFn = dyn Fn(Option<&Identity>);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryEntry {
	email: String,
	password_hash: String,
	salt: String,
	#[serde(default)]
	username: Option<String>,
	#[serde(default)]
	created_at: Option<String>,
}

type Directory = BTreeMap<String, DirectoryEntry>;

struct AuthInner {
	storage: SharedStorage,
	directory_key: String,
	session_key: String,
	current: Arc<Mutex<Option<Identity>>>,
	listeners: Registry<SessionFn>,
	storage_subscription: Mutex<Option<Subscription>>,
}

impl Drop for AuthInner {
	fn drop(&mut self) {
		if let Ok(mut subscription) = self.storage_subscription.lock() {
			if let Some(subscription) = subscription.take() {
				subscription.unsubscribe();
			}
		}
	}
}

/// Session state: anonymous until a sign-in or registration succeeds,
/// anonymous again after sign-out.
///
/// ```
/// # futures::executor::block_on(async {
/// use shotforge::{Auth, ForgeConfig, MemoryConfig, MemoryStorage};
///
/// let auth = Auth::new(MemoryStorage::new(MemoryConfig::default()), &ForgeConfig::default()).unwrap();
/// let me = auth.register("cue@example.com", "chalk-it-up", "Cue").await.unwrap();
/// assert_eq!(auth.current_user(), Some(me.clone()));
///
/// auth.sign_out().await.unwrap();
/// assert_eq!(auth.current_user(), None);
///
/// let again = auth.sign_in("cue@example.com", "chalk-it-up").await.unwrap();
/// assert_eq!(again.uid, me.uid);
/// # });
/// ```
#[derive(Clone)]
pub struct Auth {
	inner: Arc<AuthInner>,
}

impl Auth {
	pub fn new(storage: impl KeyValueStore + 'static, config: &ForgeConfig) -> Result<Self> {
		let boxed: Box<DynStorage> = Box::new(storage);
		Self::with_storage(Arc::new(Mutex::new(boxed)), config)
	}

	pub(crate) fn with_storage(storage: SharedStorage, config: &ForgeConfig) -> Result<Self> {
		let session_key = config.session_key.clone();
		let current = Arc::new(Mutex::new(None));
		let listeners: Registry<SessionFn> = Registry::new();

		let subscription = {
			let mut substrate = lock_storage(&storage)?;
			let saved = substrate.get_item(&session_key)?;
			*lock_current(&current) = saved.as_deref().and_then(parse_session);

			let key = session_key.clone();
			let current = Arc::clone(&current);
			let listeners = listeners.clone();
			substrate.subscribe(Box::new(move |event: &StorageEvent| {
				if event.key != key {
					return;
				}
				tracing::debug!("Session pointer changed in another context");
				let session = event.new_value.as_deref().and_then(parse_session);
				publish(&current, &listeners, session);
			}))
		};

		Ok(Self {
			inner: Arc::new(AuthInner {
				storage,
				directory_key: config.directory_key.clone(),
				session_key,
				current,
				listeners,
				storage_subscription: Mutex::new(Some(subscription)),
			}),
		})
	}

	/// The signed-in user, if any.
	pub fn current_user(&self) -> Option<Identity> {
		lock_current(&self.inner.current).clone()
	}

	/// Signs in with an exact (case-sensitive) email match. Unknown emails
	/// and wrong passwords fail the same way.
	pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity> {
		let mut storage = lock_storage(&self.inner.storage)?;
		let directory = self.read_directory(&**storage)?;

		let matched = directory
			.iter()
			.find(|(_, entry)| entry.email == email)
			.filter(|(_, entry)| hash_password(&entry.salt, password) == entry.password_hash);
		let Some((uid, entry)) = matched else {
			tracing::info!("Rejected sign-in attempt");
			return Err(ForgeError::InvalidCredential);
		};

		let identity = Identity {
			uid: uid.clone(),
			email: entry.email.clone(),
			display_name: entry.username.clone(),
		};
		self.write_session(&mut **storage, &identity)?;
		drop(storage);

		tracing::info!("Signed in {}", identity.uid);
		publish(&self.inner.current, &self.inner.listeners, Some(identity.clone()));
		Ok(identity)
	}

	/// Creates an account and signs it in. Fails with
	/// [`ForgeError::EmailInUse`] without touching the directory if the email
	/// is already registered.
	pub async fn register(&self, email: &str, password: &str, username: &str) -> Result<Identity> {
		if email.is_empty() || password.is_empty() {
			return Err(ForgeError::InvalidArgument(
				"email and password must not be empty".into(),
			));
		}

		let mut storage = lock_storage(&self.inner.storage)?;
		let mut directory = self.read_directory(&**storage)?;
		if directory.values().any(|entry| entry.email == email) {
			return Err(ForgeError::EmailInUse);
		}

		let uid = loop {
			let candidate = format!("user_{}_{}", Utc::now().timestamp_millis(), random_token(6));
			if !directory.contains_key(&candidate) {
				break candidate;
			}
		};
		let salt = random_token(16);
		let username = (!username.is_empty()).then(|| username.to_string());
		directory.insert(
			uid.clone(),
			DirectoryEntry {
				email: email.to_string(),
				password_hash: hash_password(&salt, password),
				salt,
				username: username.clone(),
				created_at: Some(now_timestamp()),
			},
		);
		storage.set_item(&self.inner.directory_key, &serde_json::to_string(&directory)?)?;

		let identity = Identity {
			uid,
			email: email.to_string(),
			display_name: username,
		};
		self.write_session(&mut **storage, &identity)?;
		drop(storage);

		tracing::info!("Registered {}", identity.uid);
		publish(&self.inner.current, &self.inner.listeners, Some(identity.clone()));
		Ok(identity)
	}

	/// Clears the session pointer.
	pub async fn sign_out(&self) -> Result<()> {
		lock_storage(&self.inner.storage)?.remove_item(&self.inner.session_key)?;
		if self.current_user().is_some() {
			tracing::info!("Signed out");
			publish(&self.inner.current, &self.inner.listeners, None);
		}
		Ok(())
	}

	/// Calls `callback` now with the current session, then after every
	/// session change made here or seen from another context.
	#[cfg(not(target_arch = "wasm32"))]
	pub fn on_session_changed(
		&self,
		callback: impl Fn(Option<&Identity>) + Send + Sync + 'static,
	) -> Subscription {
		self.subscribe(Box::new(callback))
	}

	/// Calls `callback` now with the current session, then after every
	/// session change made here or seen from another context.
	#[cfg(target_arch = "wasm32")]
	pub fn on_session_changed(&self, callback: impl Fn(Option<&Identity>) + 'static) -> Subscription {
		self.subscribe(Box::new(callback))
	}

	fn subscribe(&self, callback: Box<SessionFn>) -> Subscription {
		let current = self.current_user();
		guarded("auth state change", || callback(current.as_ref()));
		self.inner.listeners.add(callback)
	}

	fn read_directory(&self, storage: &DynStorage) -> Result<Directory> {
		let key = &self.inner.directory_key;
		match storage.get_item(key)? {
			None => Ok(Directory::new()),
			Some(raw) => serde_json::from_str(&raw).map_err(|e| ForgeError::malformed(key.as_str(), e)),
		}
	}

	fn write_session(&self, storage: &mut DynStorage, identity: &Identity) -> Result<()> {
		storage.set_item(&self.inner.session_key, &serde_json::to_string(identity)?)
	}
}

fn lock_current(current: &Mutex<Option<Identity>>) -> std::sync::MutexGuard<'_, Option<Identity>> {
	match current.lock() {
		Ok(guard) => guard,
		Err(poisoned) => poisoned.into_inner(),
	}
}

fn publish(current: &Mutex<Option<Identity>>, listeners: &Registry<SessionFn>, session: Option<Identity>) {
	*lock_current(current) = session.clone();
	for listener in listeners.active() {
		guarded("auth state change", || listener(session.as_ref()));
	}
}

fn parse_session(raw: &str) -> Option<Identity> {
	match serde_json::from_str(raw) {
		Ok(identity) => Some(identity),
		Err(e) => {
			tracing::warn!("Ignoring unreadable session pointer: {}", e);
			None
		}
	}
}

fn hash_password(salt: &str, password: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(salt.as_bytes());
	hasher.update(b":");
	hasher.update(password.as_bytes());
	hasher
		.finalize()
		.iter()
		.map(|byte| format!("{:02x}", byte))
		.collect()
}

fn random_token(len: usize) -> String {
	rand::thread_rng()
		.sample_iter(&Alphanumeric)
		.take(len)
		.map(char::from)
		.collect()
}
