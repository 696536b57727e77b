use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Key under which a marker is embedded in a JSON value.
const MARKER_KEY: &str = "__fieldValue__";

/// Write-time directives resolved by the store when a document is written.
///
/// Markers are plain JSON, so they can sit inside `json!` literals:
///
/// ```
/// use serde_json::json;
/// use shotforge::FieldValue;
///
/// let patch = json!({
///     "points": FieldValue::increment(150),
///     "updatedAt": FieldValue::server_timestamp(),
/// });
/// assert_eq!(
///     FieldValue::from_value(&patch["points"]),
///     Some(FieldValue::Increment { amount: 150.into() })
/// );
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FieldValue {
	/// Replaced by the time of the write.
	ServerTimestamp,
	/// Added to the current numeric value of the field (missing counts as 0).
	Increment { amount: Number },
}

impl FieldValue {
	pub fn server_timestamp() -> Value {
		FieldValue::ServerTimestamp.into()
	}

	pub fn increment(amount: i64) -> Value {
		FieldValue::Increment {
			amount: amount.into(),
		}
		.into()
	}

	/// Non-finite amounts increment by zero.
	pub fn increment_f64(amount: f64) -> Value {
		FieldValue::Increment {
			amount: Number::from_f64(amount).unwrap_or_else(|| 0.into()),
		}
		.into()
	}

	/// Recognises an embedded marker.
	pub fn from_value(value: &Value) -> Option<FieldValue> {
		let object = value.as_object()?;
		if object.len() != 1 {
			return None;
		}
		serde_json::from_value(object.get(MARKER_KEY)?.clone()).ok()
	}
}

impl From<FieldValue> for Value {
	fn from(marker: FieldValue) -> Self {
		let mut object = Map::new();
		// Serializing a unit/struct variant of this enum cannot fail.
		let inner = serde_json::to_value(&marker).unwrap_or(Value::Null);
		object.insert(MARKER_KEY.to_string(), inner);
		Value::Object(object)
	}
}

/// Current time in the format every stored timestamp uses.
pub(crate) fn now_timestamp() -> String {
	Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Resolves the top-level fields of a write against the document currently
/// stored (if any). Nested markers have no stored value to refer to.
pub(crate) fn resolve_fields(
	fields: Map<String, Value>,
	existing: Option<&Map<String, Value>>,
	now: &str,
) -> Map<String, Value> {
	fields
		.into_iter()
		.map(|(name, value)| {
			let current = existing.and_then(|doc| doc.get(&name));
			(name, resolve(value, current, now))
		})
		.collect()
}

fn resolve(value: Value, current: Option<&Value>, now: &str) -> Value {
	if let Some(marker) = FieldValue::from_value(&value) {
		return match marker {
			FieldValue::ServerTimestamp => Value::String(now.to_string()),
			FieldValue::Increment { amount } => {
				let base = match current {
					Some(Value::Number(n)) => Some(n),
					_ => None,
				};
				Value::Number(add(base, &amount))
			}
		};
	}
	match value {
		Value::Object(fields) => Value::Object(resolve_fields(fields, None, now)),
		Value::Array(items) => Value::Array(
			items
				.into_iter()
				.map(|item| resolve(item, None, now))
				.collect(),
		),
		other => other,
	}
}

fn add(base: Option<&Number>, amount: &Number) -> Number {
	let Some(base) = base else {
		return amount.clone();
	};
	if let (Some(a), Some(b)) = (base.as_i64(), amount.as_i64()) {
		if let Some(sum) = a.checked_add(b) {
			return sum.into();
		}
	}
	let sum = base.as_f64().unwrap_or(0.0) + amount.as_f64().unwrap_or(0.0);
	Number::from_f64(sum).unwrap_or_else(|| base.clone())
}
