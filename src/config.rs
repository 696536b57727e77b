use crate::error::{ForgeError, Result};
use toml_edit::{DocumentMut, Item};

const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Key layout and limits shared by the document store, auth and storage
/// adapters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForgeConfig {
	/// Prefix of every document key. Documents live under
	/// `<document_prefix><collection>/<id>`.
	pub document_prefix: String,
	/// Key holding the credential directory.
	pub directory_key: String,
	/// Key holding the session pointer.
	pub session_key: String,
	/// Byte budget applied by [`MemoryStorage::from_config`](crate::MemoryStorage::from_config).
	/// `None` disables the quota.
	pub quota_bytes: Option<usize>,
}

impl Default for ForgeConfig {
	fn default() -> Self {
		Self {
			document_prefix: "pool_doc_".into(),
			directory_key: "pool_users".into(),
			session_key: "pool_current_user".into(),
			quota_bytes: Some(DEFAULT_QUOTA_BYTES),
		}
	}
}

impl ForgeConfig {
	/// Validates a hand-built configuration.
	///
	/// # Panics
	/// * If `document_prefix` is empty
	/// * If `directory_key` and `session_key` are the same key
	pub fn new(config: ForgeConfig) -> Self {
		if config.document_prefix.is_empty() {
			panic!("document_prefix is empty? Every document would collide with the auth keys.");
		}
		if config.directory_key == config.session_key {
			panic!("directory_key == session_key? Signing in would overwrite every account.");
		}
		config
	}

	/// Parses the `[storage]` table of a TOML document. Missing keys keep
	/// their defaults; `quota_bytes = 0` disables the quota.
	///
	/// ```
	/// use shotforge::ForgeConfig;
	///
	/// let config = ForgeConfig::from_toml_str(r#"
	/// [storage]
	/// document_prefix = "forge_"
	/// quota_bytes = 0
	/// "#).unwrap();
	///
	/// assert_eq!(config.document_prefix, "forge_");
	/// assert_eq!(config.quota_bytes, None);
	/// assert_eq!(config.session_key, "pool_current_user");
	/// ```
	pub fn from_toml_str(source: &str) -> Result<Self> {
		let doc = source
			.parse::<DocumentMut>()
			.map_err(|e| ForgeError::Config(e.to_string()))?;

		let mut config = ForgeConfig::default();
		let Some(storage) = doc.get("storage") else {
			return Ok(config);
		};
		let table = storage
			.as_table_like()
			.ok_or_else(|| ForgeError::Config("[storage] must be a table".into()))?;

		if let Some(item) = table.get("document_prefix") {
			config.document_prefix = string_value(item, "document_prefix")?;
		}
		if let Some(item) = table.get("directory_key") {
			config.directory_key = string_value(item, "directory_key")?;
		}
		if let Some(item) = table.get("session_key") {
			config.session_key = string_value(item, "session_key")?;
		}
		if let Some(item) = table.get("quota_bytes") {
			let quota = item
				.as_integer()
				.ok_or_else(|| ForgeError::Config("quota_bytes must be an integer".into()))?;
			config.quota_bytes = match quota {
				0 => None,
				q if q < 0 => {
					return Err(ForgeError::Config("quota_bytes must not be negative".into()))
				}
				q => Some(q as usize),
			};
		}

		if config.document_prefix.is_empty() {
			return Err(ForgeError::Config("document_prefix must not be empty".into()));
		}
		if config.directory_key == config.session_key {
			return Err(ForgeError::Config(
				"directory_key and session_key must differ".into(),
			));
		}
		Ok(config)
	}
}

fn string_value(item: &Item, name: &str) -> Result<String> {
	item.as_str()
		.map(str::to_owned)
		.ok_or_else(|| ForgeError::Config(format!("{} must be a string", name)))
}
