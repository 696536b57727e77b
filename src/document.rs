//! Document store emulation over a flat key-value substrate.
//!
//! Every document is one substrate entry. A document at
//! `users/u1/challenges/c1` is stored under
//! `<document_prefix>users/u1/challenges/c1`, so a collection is the set of
//! keys sharing the collection prefix whose remainder contains no further
//! separator.

use crate::config::ForgeConfig;
use crate::error::{ForgeError, Result};
use crate::field_value::{now_timestamp, resolve_fields};
use crate::listeners::{guarded, Registry, Subscription};
use crate::query::{Direction, Operator, Query};
use crate::KeyValueStore;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};

const SEPARATOR: char = '/';
const MAX_ID_ATTEMPTS: usize = 8;

#[cfg(not(target_arch = "wasm32"))]
pub(crate) type DynStorage = dyn KeyValueStore + Send;
#[cfg(target_arch = "wasm32")]
pub(crate) type DynStorage = dyn KeyValueStore;

/// The substrate handle shared by the document store and auth emulation.
pub(crate) type SharedStorage = Arc<Mutex<Box<DynStorage>>>;

pub(crate) fn lock_storage(storage: &SharedStorage) -> Result<MutexGuard<'_, Box<DynStorage>>> {
	storage
		.lock()
		.map_err(|_| ForgeError::Substrate("storage lock poisoned".into()))
}

#[cfg(not(target_arch = "wasm32"))]
type ChangeFn = dyn Fn(&DocumentChange) + Send + Sync;
#[cfg(target_arch = "wasm32")]
type ChangeFn = dyn Fn(&DocumentChange);

/// A durable write made through a [`Firestore`].
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
	/// Path of the collection holding the document.
	pub collection: String,
	pub id: String,
	/// Previous contents; `None` if the document did not exist or was
	/// unreadable.
	pub before: Option<Map<String, Value>>,
	pub after: Map<String, Value>,
}

struct FirestoreInner {
	storage: SharedStorage,
	prefix: String,
	changes: Registry<ChangeFn>,
}

/// Entry point of the document store.
///
/// Cloning is cheap; clones share the substrate and change listeners.
///
/// ```
/// # futures::executor::block_on(async {
/// use serde_json::json;
/// use shotforge::{Firestore, ForgeConfig, MemoryConfig, MemoryStorage};
///
/// let db = Firestore::new(MemoryStorage::new(MemoryConfig::default()), &ForgeConfig::default());
/// let user = db.collection("users").doc("u1");
///
/// assert!(!user.get().await.unwrap().exists());
/// user.set(json!({"username": "shark", "points": 0})).await.unwrap();
///
/// let snapshot = user.get().await.unwrap();
/// assert!(snapshot.exists());
/// assert_eq!(snapshot.get("username"), Some(&json!("shark")));
/// # });
/// ```
#[derive(Clone)]
pub struct Firestore {
	inner: Arc<FirestoreInner>,
}

impl Firestore {
	/// Creates a document store over `storage`.
	pub fn new(storage: impl KeyValueStore + 'static, config: &ForgeConfig) -> Self {
		let boxed: Box<DynStorage> = Box::new(storage);
		Self::with_storage(Arc::new(Mutex::new(boxed)), config)
	}

	pub(crate) fn with_storage(storage: SharedStorage, config: &ForgeConfig) -> Self {
		Self {
			inner: Arc::new(FirestoreInner {
				storage,
				prefix: config.document_prefix.clone(),
				changes: Registry::new(),
			}),
		}
	}

	/// Returns a handle to the collection at `path`, which is either a name
	/// (`users`) or a `/`-separated path to a sub-collection
	/// (`users/u1/challenges`). Never fails; invalid paths are reported by
	/// the operations performed on the handle.
	pub fn collection(&self, path: &str) -> CollectionRef {
		CollectionRef {
			store: self.clone(),
			segments: path.split(SEPARATOR).map(str::to_owned).collect(),
		}
	}

	/// Invokes `callback` after every durable write made through this store
	/// (or its clones). Writes made by other contexts are not reported.
	#[cfg(not(target_arch = "wasm32"))]
	pub fn on_change(
		&self,
		callback: impl Fn(&DocumentChange) + Send + Sync + 'static,
	) -> Subscription {
		self.inner.changes.add(Box::new(callback))
	}

	/// Invokes `callback` after every durable write made through this store
	/// (or its clones). Writes made by other contexts are not reported.
	#[cfg(target_arch = "wasm32")]
	pub fn on_change(&self, callback: impl Fn(&DocumentChange) + 'static) -> Subscription {
		self.inner.changes.add(Box::new(callback))
	}

	fn lock(&self) -> Result<MutexGuard<'_, Box<DynStorage>>> {
		lock_storage(&self.inner.storage)
	}

	fn notify(&self, change: DocumentChange) {
		for listener in self.inner.changes.active() {
			guarded("document change", || listener(&change));
		}
	}
}

/// A collection of documents, possibly nested under a parent document.
#[derive(Clone)]
pub struct CollectionRef {
	store: Firestore,
	segments: Vec<String>,
}

impl CollectionRef {
	/// Last path segment, the collection's own name.
	pub fn id(&self) -> &str {
		self.segments.last().map(String::as_str).unwrap_or_default()
	}

	/// Full `/`-separated path.
	pub fn path(&self) -> String {
		self.segments.join("/")
	}

	/// Handle to the document `id` in this collection. The id is opaque but
	/// must be non-empty and free of `/`; that is checked when the handle is
	/// used.
	pub fn doc(&self, id: impl Into<String>) -> DocumentRef {
		DocumentRef {
			collection: self.clone(),
			id: id.into(),
		}
	}

	/// Starts a query with no conditions.
	pub fn query(&self) -> Query {
		Query::new(self.clone())
	}

	pub fn where_field(
		&self,
		field: impl Into<String>,
		op: Operator,
		value: impl Into<Value>,
	) -> Query {
		self.query().where_field(field, op, value)
	}

	pub fn order_by(&self, field: impl Into<String>, direction: Direction) -> Query {
		self.query().order_by(field, direction)
	}

	pub fn limit(&self, n: usize) -> Query {
		self.query().limit(n)
	}

	/// Every document directly in this collection.
	pub async fn get(&self) -> Result<QuerySnapshot> {
		Ok(QuerySnapshot::new(self.scan()?))
	}

	/// Writes `data` under a freshly generated id and returns its handle.
	pub async fn add(&self, data: Value) -> Result<DocumentRef> {
		for _ in 0..MAX_ID_ATTEMPTS {
			let doc = self.doc(generate_id());
			let key = doc.key()?;
			if self.store.lock()?.get_item(&key)?.is_some() {
				continue;
			}
			doc.set(data).await?;
			return Ok(doc);
		}
		Err(ForgeError::Substrate(format!(
			"could not allocate a free document id in {}",
			self.path()
		)))
	}

	fn validate(&self) -> Result<()> {
		for segment in &self.segments {
			validate_segment(segment)?;
		}
		if self.segments.len() % 2 == 0 {
			return Err(ForgeError::InvalidArgument(format!(
				"'{}' is a document path, not a collection path",
				self.path()
			)));
		}
		Ok(())
	}

	fn key_prefix(&self) -> String {
		format!("{}{}{}", self.store.inner.prefix, self.path(), SEPARATOR)
	}

	/// Reads every readable document directly in the collection. Entries
	/// that fail to parse are skipped so they cannot hide their siblings.
	pub(crate) fn scan(&self) -> Result<Vec<DocumentSnapshot>> {
		self.validate()?;
		let prefix = self.key_prefix();
		let storage = self.store.lock()?;

		let mut docs = Vec::new();
		for key in storage.keys_with_prefix(&prefix)? {
			let id = &key[prefix.len()..];
			if id.is_empty() || id.contains(SEPARATOR) {
				// Belongs to a nested sub-collection
				continue;
			}
			let Some(raw) = storage.get_item(&key)? else {
				continue;
			};
			match parse_document(&raw) {
				Ok(data) => docs.push(DocumentSnapshot {
					id: id.to_string(),
					path: format!("{}/{}", self.path(), id),
					data: Some(data),
				}),
				Err(reason) => {
					tracing::warn!("Skipping malformed document {}: {}", key, reason);
				}
			}
		}
		Ok(docs)
	}
}

/// A single document handle.
#[derive(Clone)]
pub struct DocumentRef {
	collection: CollectionRef,
	id: String,
}

impl DocumentRef {
	pub fn id(&self) -> &str {
		&self.id
	}

	/// Full `/`-separated path of the document.
	pub fn path(&self) -> String {
		format!("{}/{}", self.collection.path(), self.id)
	}

	/// The collection holding this document.
	pub fn parent(&self) -> &CollectionRef {
		&self.collection
	}

	/// Handle to a sub-collection of this document. `path` may itself be
	/// nested (`rounds/r1/shots`).
	pub fn collection(&self, path: &str) -> CollectionRef {
		let mut segments = self.collection.segments.clone();
		segments.push(self.id.clone());
		segments.extend(path.split(SEPARATOR).map(str::to_owned));
		CollectionRef {
			store: self.collection.store.clone(),
			segments,
		}
	}

	/// Reads the document. A missing or unreadable entry yields a snapshot
	/// with `exists() == false`; only substrate failures are errors.
	pub async fn get(&self) -> Result<DocumentSnapshot> {
		let key = self.key()?;
		let raw = self.collection.store.lock()?.get_item(&key)?;
		let data = match raw {
			None => None,
			Some(raw) => match parse_document(&raw) {
				Ok(data) => Some(data),
				Err(reason) => {
					tracing::warn!("Treating malformed document {} as absent: {}", key, reason);
					None
				}
			},
		};
		Ok(DocumentSnapshot {
			id: self.id.clone(),
			path: self.path(),
			data,
		})
	}

	/// Replaces the whole document with `data` (a JSON object), resolving
	/// field-value markers first.
	pub async fn set(&self, data: Value) -> Result<()> {
		let fields = into_fields(data)?;
		self.commit(|_, _| Ok(resolve_fields(fields, None, &now_timestamp())))
	}

	/// Shallow-merges `partial` into the stored document, creating it if it
	/// does not exist. Increment markers add to the stored value of their
	/// field. A stored entry that cannot be parsed is left untouched and the
	/// update fails with [`ForgeError::MalformedData`].
	pub async fn update(&self, partial: Value) -> Result<()> {
		let fields = into_fields(partial)?;
		self.commit(|key, raw| {
			let existing = match raw {
				None => None,
				Some(raw) => Some(parse_document(raw).map_err(|e| ForgeError::malformed(key, e))?),
			};
			let resolved = resolve_fields(fields, existing.as_ref(), &now_timestamp());
			let mut merged = existing.unwrap_or_default();
			merged.extend(resolved);
			Ok(merged)
		})
	}

	pub(crate) fn key(&self) -> Result<String> {
		self.collection.validate()?;
		validate_segment(&self.id)?;
		Ok(format!("{}{}", self.collection.key_prefix(), self.id))
	}

	/// Builds the new contents from the stored entry and writes them with a
	/// single substrate call, then reports the change.
	fn commit<F>(&self, build: F) -> Result<()>
	where
		F: FnOnce(&str, Option<&str>) -> Result<Map<String, Value>>,
	{
		let key = self.key()?;
		let store = &self.collection.store;
		let mut storage = store.lock()?;
		let raw = storage.get_item(&key)?;
		let after = build(&key, raw.as_deref())?;
		let encoded = serde_json::to_string(&after)?;
		storage.set_item(&key, &encoded)?;
		drop(storage);

		tracing::debug!("Wrote document {} ({} bytes)", key, encoded.len());
		store.notify(DocumentChange {
			collection: self.collection.path(),
			id: self.id.clone(),
			before: raw.and_then(|r| parse_document(&r).ok()),
			after,
		});
		Ok(())
	}
}

/// The result of reading one document.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
	id: String,
	path: String,
	data: Option<Map<String, Value>>,
}

impl DocumentSnapshot {
	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn path(&self) -> &str {
		&self.path
	}

	/// `false` when nothing readable is stored for the document. An existing
	/// document with no fields still reports `true`.
	pub fn exists(&self) -> bool {
		self.data.is_some()
	}

	pub fn data(&self) -> Option<&Map<String, Value>> {
		self.data.as_ref()
	}

	pub fn into_data(self) -> Option<Map<String, Value>> {
		self.data
	}

	/// A single top-level field.
	pub fn get(&self, field: &str) -> Option<&Value> {
		self.data.as_ref()?.get(field)
	}

	/// Deserializes the document into a typed record. `Ok(None)` when the
	/// document does not exist; [`ForgeError::MalformedData`] when the
	/// stored fields do not fit `T`.
	pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
		let Some(data) = &self.data else {
			return Ok(None);
		};
		serde_json::from_value(Value::Object(data.clone()))
			.map(Some)
			.map_err(|e| ForgeError::malformed(self.path.as_str(), e))
	}
}

/// The result of a collection read or query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuerySnapshot {
	docs: Vec<DocumentSnapshot>,
}

impl QuerySnapshot {
	pub(crate) fn new(docs: Vec<DocumentSnapshot>) -> Self {
		Self { docs }
	}

	pub fn size(&self) -> usize {
		self.docs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.docs.is_empty()
	}

	pub fn docs(&self) -> &[DocumentSnapshot] {
		&self.docs
	}

	pub fn iter(&self) -> std::slice::Iter<'_, DocumentSnapshot> {
		self.docs.iter()
	}

	pub fn for_each(&self, f: impl FnMut(&DocumentSnapshot)) {
		self.docs.iter().for_each(f)
	}

	/// Deserializes every document, failing on the first that does not fit.
	pub fn data_as<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
		self.docs
			.iter()
			.filter_map(|doc| doc.data_as::<T>().transpose())
			.collect()
	}
}

impl IntoIterator for QuerySnapshot {
	type Item = DocumentSnapshot;
	type IntoIter = std::vec::IntoIter<DocumentSnapshot>;

	fn into_iter(self) -> Self::IntoIter {
		self.docs.into_iter()
	}
}

impl<'a> IntoIterator for &'a QuerySnapshot {
	type Item = &'a DocumentSnapshot;
	type IntoIter = std::slice::Iter<'a, DocumentSnapshot>;

	fn into_iter(self) -> Self::IntoIter {
		self.docs.iter()
	}
}

fn validate_segment(segment: &str) -> Result<()> {
	if segment.is_empty() {
		return Err(ForgeError::InvalidArgument(
			"path segments and document ids must not be empty".into(),
		));
	}
	if segment.contains(SEPARATOR) {
		return Err(ForgeError::InvalidArgument(format!(
			"'{}' must not contain '{}'",
			segment, SEPARATOR
		)));
	}
	Ok(())
}

fn into_fields(data: Value) -> Result<Map<String, Value>> {
	match data {
		Value::Object(fields) => Ok(fields),
		other => Err(ForgeError::InvalidArgument(format!(
			"document data must be a JSON object, got {}",
			other
		))),
	}
}

fn parse_document(raw: &str) -> std::result::Result<Map<String, Value>, String> {
	match serde_json::from_str::<Value>(raw) {
		Ok(Value::Object(fields)) => Ok(fields),
		Ok(other) => Err(format!("expected a JSON object, found {}", other)),
		Err(e) => Err(e.to_string()),
	}
}

fn generate_id() -> String {
	let suffix: String = rand::thread_rng()
		.sample_iter(&Alphanumeric)
		.take(8)
		.map(char::from)
		.collect();
	format!("doc_{}_{}", Utc::now().timestamp_millis(), suffix)
}
