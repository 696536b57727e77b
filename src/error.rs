/// All errors surfaced by the store, auth and progression layers.
///
/// Every variant maps to a stable machine-readable [`code`](ForgeError::code)
/// so UI glue can branch on the reason without matching on messages.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
	#[error("Invalid email or password")]
	InvalidCredential,

	#[error("Email address is already in use")]
	EmailInUse,

	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	#[error("Not found: {0}")]
	NotFound(String),

	#[error("Malformed data under '{key}': {reason}")]
	MalformedData { key: String, reason: String },

	#[error("Storage quota exceeded writing '{key}': {detail}")]
	QuotaExceeded { key: String, detail: String },

	#[error("Storage error: {0}")]
	Substrate(String),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("Configuration error: {0}")]
	Config(String),
}

impl ForgeError {
	/// Machine-readable reason, modelled on the document-database error codes
	/// the UI layer already understands.
	pub fn code(&self) -> &'static str {
		match self {
			ForgeError::InvalidCredential => "auth/invalid-credential",
			ForgeError::EmailInUse => "auth/email-already-in-use",
			ForgeError::InvalidArgument(_) => "invalid-argument",
			ForgeError::NotFound(_) => "not-found",
			ForgeError::MalformedData { .. } => "data-loss",
			ForgeError::QuotaExceeded { .. } => "resource-exhausted",
			ForgeError::Substrate(_) => "unavailable",
			ForgeError::Serialization(_) => "internal",
			ForgeError::Config(_) => "invalid-config",
		}
	}

	pub(crate) fn malformed(key: impl Into<String>, reason: impl ToString) -> Self {
		ForgeError::MalformedData {
			key: key.into(),
			reason: reason.to_string(),
		}
	}
}

pub type Result<T> = std::result::Result<T, ForgeError>;
