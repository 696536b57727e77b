use crate::document::{CollectionRef, DocumentSnapshot, QuerySnapshot};
use crate::error::{ForgeError, Result};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Comparison applied by a [`Filter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
	Equal,
	NotEqual,
	GreaterThan,
	GreaterThanOrEqual,
	LessThan,
	LessThanOrEqual,
}

impl FromStr for Operator {
	type Err = ForgeError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"==" => Ok(Operator::Equal),
			"!=" => Ok(Operator::NotEqual),
			">" => Ok(Operator::GreaterThan),
			">=" => Ok(Operator::GreaterThanOrEqual),
			"<" => Ok(Operator::LessThan),
			"<=" => Ok(Operator::LessThanOrEqual),
			other => Err(ForgeError::InvalidArgument(format!(
				"unsupported query operator '{}'",
				other
			))),
		}
	}
}

impl fmt::Display for Operator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let symbol = match self {
			Operator::Equal => "==",
			Operator::NotEqual => "!=",
			Operator::GreaterThan => ">",
			Operator::GreaterThanOrEqual => ">=",
			Operator::LessThan => "<",
			Operator::LessThanOrEqual => "<=",
		};
		f.write_str(symbol)
	}
}

/// Sort direction for [`Query::order_by`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Direction {
	#[default]
	Ascending,
	Descending,
}

impl FromStr for Direction {
	type Err = ForgeError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"asc" | "ascending" => Ok(Direction::Ascending),
			"desc" | "descending" => Ok(Direction::Descending),
			other => Err(ForgeError::InvalidArgument(format!(
				"unsupported sort direction '{}'",
				other
			))),
		}
	}
}

/// A single `field <op> value` condition.
///
/// Values are compared without type coercion: a string never equals a number
/// and range comparisons across types never match. A missing field only
/// matches `!=`.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
	pub field: String,
	pub op: Operator,
	pub value: Value,
}

impl Filter {
	pub fn new(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
		Self {
			field: field.into(),
			op,
			value: value.into(),
		}
	}

	/// Evaluates the filter against a document's fields.
	pub fn matches(&self, doc: &Map<String, Value>) -> bool {
		let field = doc.get(&self.field);
		match self.op {
			Operator::Equal => field.is_some_and(|v| values_equal(v, &self.value)),
			Operator::NotEqual => !field.is_some_and(|v| values_equal(v, &self.value)),
			Operator::GreaterThan => self.ordered(field, |o| o == Ordering::Greater),
			Operator::GreaterThanOrEqual => self.ordered(field, |o| o != Ordering::Less),
			Operator::LessThan => self.ordered(field, |o| o == Ordering::Less),
			Operator::LessThanOrEqual => self.ordered(field, |o| o != Ordering::Greater),
		}
	}

	fn ordered(&self, field: Option<&Value>, accept: impl Fn(Ordering) -> bool) -> bool {
		field
			.and_then(|v| compare_scalars(v, &self.value))
			.is_some_and(accept)
	}
}

/// A filtered, ordered and limited read over one collection.
///
/// ```
/// # futures::executor::block_on(async {
/// use serde_json::json;
/// use shotforge::{Direction, Firestore, ForgeConfig, MemoryConfig, MemoryStorage, Operator};
///
/// let db = Firestore::new(MemoryStorage::new(MemoryConfig::default()), &ForgeConfig::default());
/// let challenges = db.collection("users/u1/challenges");
/// for (id, xp) in [("a", 50), ("b", 100), ("c", 150)] {
///     challenges.doc(id).set(json!({"xp": xp, "daily": true})).await.unwrap();
/// }
///
/// let top = challenges
///     .where_field("daily", Operator::Equal, true)
///     .order_by("xp", Direction::Descending)
///     .limit(2)
///     .get()
///     .await
///     .unwrap();
/// let ids: Vec<&str> = top.iter().map(|d| d.id()).collect();
/// assert_eq!(ids, ["c", "b"]);
/// # });
/// ```
#[derive(Clone)]
pub struct Query {
	collection: CollectionRef,
	filters: Vec<Filter>,
	order: Option<(String, Direction)>,
	limit: Option<usize>,
}

impl Query {
	pub(crate) fn new(collection: CollectionRef) -> Self {
		Self {
			collection,
			filters: Vec::new(),
			order: None,
			limit: None,
		}
	}

	/// Adds a condition; all conditions must hold.
	pub fn where_field(
		mut self,
		field: impl Into<String>,
		op: Operator,
		value: impl Into<Value>,
	) -> Self {
		self.filters.push(Filter::new(field, op, value));
		self
	}

	/// Orders results by `field`. Missing and null values come first in
	/// either direction. A later call replaces the earlier ordering.
	pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
		self.order = Some((field.into(), direction));
		self
	}

	/// Keeps at most `n` documents after ordering. `limit(0)` removes the
	/// limit.
	pub fn limit(mut self, n: usize) -> Self {
		self.limit = (n > 0).then_some(n);
		self
	}

	pub fn filters(&self) -> &[Filter] {
		&self.filters
	}

	pub fn collection(&self) -> &CollectionRef {
		&self.collection
	}

	/// Scans the collection and returns the matching documents.
	pub async fn get(&self) -> Result<QuerySnapshot> {
		let mut docs: Vec<DocumentSnapshot> = self
			.collection
			.scan()?
			.into_iter()
			.filter(|doc| {
				doc.data()
					.is_some_and(|data| self.filters.iter().all(|f| f.matches(data)))
			})
			.collect();

		if let Some((field, direction)) = &self.order {
			docs.sort_by(|a, b| {
				compare_for_sort(a.get(field), b.get(field), *direction)
			});
		}
		if let Some(limit) = self.limit {
			docs.truncate(limit);
		}

		tracing::debug!(
			"Query on {} with {} filter(s) matched {} document(s)",
			self.collection.path(),
			self.filters.len(),
			docs.len()
		);
		Ok(QuerySnapshot::new(docs))
	}
}

fn type_rank(value: Option<&Value>) -> u8 {
	match value {
		None | Some(Value::Null) => 0,
		Some(Value::Bool(_)) => 1,
		Some(Value::Number(_)) => 2,
		Some(Value::String(_)) => 3,
		Some(Value::Array(_)) => 4,
		Some(Value::Object(_)) => 5,
	}
}

/// Exact numeric order across integer and float representations, so that
/// sorting sees a consistent total order even beyond 2^53.
fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
	match (as_i128(a), as_i128(b)) {
		(Some(x), Some(y)) => Some(x.cmp(&y)),
		(Some(x), None) => compare_int_float(x, b.as_f64()?),
		(None, Some(y)) => compare_int_float(y, a.as_f64()?).map(Ordering::reverse),
		(None, None) => a.as_f64()?.partial_cmp(&b.as_f64()?),
	}
}

fn as_i128(n: &Number) -> Option<i128> {
	n.as_i64()
		.map(i128::from)
		.or_else(|| n.as_u64().map(i128::from))
}

fn compare_int_float(int: i128, float: f64) -> Option<Ordering> {
	const BOUND: f64 = 1.7014118346046923e38; // 2^127
	if float.is_nan() {
		return None;
	}
	if float >= BOUND {
		return Some(Ordering::Less);
	}
	if float < -BOUND {
		return Some(Ordering::Greater);
	}
	let whole = float.trunc();
	match int.cmp(&(whole as i128)) {
		Ordering::Equal => 0.0_f64.partial_cmp(&(float - whole)),
		other => Some(other),
	}
}

/// Orders two values of the same scalar type; anything else is incomparable.
fn compare_scalars(a: &Value, b: &Value) -> Option<Ordering> {
	match (a, b) {
		(Value::Null, Value::Null) => Some(Ordering::Equal),
		(Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
		(Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
		(Value::String(x), Value::String(y)) => Some(x.cmp(y)),
		_ => None,
	}
}

fn values_equal(a: &Value, b: &Value) -> bool {
	match (a, b) {
		(Value::Array(x), Value::Array(y)) => {
			x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_equal(p, q))
		}
		(Value::Object(x), Value::Object(y)) => {
			x.len() == y.len()
				&& x.iter()
					.all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
		}
		_ => compare_scalars(a, b) == Some(Ordering::Equal),
	}
}

fn compare_for_sort(a: Option<&Value>, b: Option<&Value>, direction: Direction) -> Ordering {
	let (rank_a, rank_b) = (type_rank(a), type_rank(b));
	match (rank_a == 0, rank_b == 0) {
		(true, true) => return Ordering::Equal,
		(true, false) => return Ordering::Less,
		(false, true) => return Ordering::Greater,
		(false, false) => {}
	}
	let ordering = if rank_a != rank_b {
		rank_a.cmp(&rank_b)
	} else {
		match (a, b) {
			(Some(x), Some(y)) => compare_scalars(x, y).unwrap_or(Ordering::Equal),
			_ => Ordering::Equal,
		}
	};
	match direction {
		Direction::Ascending => ordering,
		Direction::Descending => ordering.reverse(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn doc(value: Value) -> Map<String, Value> {
		value.as_object().cloned().unwrap()
	}

	#[test]
	fn test_operators_parse_and_display() {
		for symbol in ["==", "!=", ">", ">=", "<", "<="] {
			let op: Operator = symbol.parse().unwrap();
			assert_eq!(op.to_string(), symbol);
		}
		assert_eq!("=~".parse::<Operator>().unwrap_err().code(), "invalid-argument");
		assert_eq!("desc".parse::<Direction>().unwrap(), Direction::Descending);
		assert_eq!(Direction::default(), Direction::Ascending);
	}

	#[test]
	fn test_equality_does_not_coerce_types() {
		let d = doc(json!({"xp": 100, "level": "100", "done": true}));
		assert!(Filter::new("xp", Operator::Equal, 100).matches(&d));
		assert!(Filter::new("xp", Operator::Equal, 100.0).matches(&d));
		assert!(!Filter::new("xp", Operator::Equal, "100").matches(&d));
		assert!(!Filter::new("level", Operator::Equal, 100).matches(&d));
		assert!(!Filter::new("done", Operator::Equal, 1).matches(&d));
		assert!(Filter::new("done", Operator::NotEqual, 1).matches(&d));
	}

	#[test]
	fn test_missing_fields_only_match_not_equal() {
		let d = doc(json!({"a": 1}));
		assert!(!Filter::new("b", Operator::Equal, Value::Null).matches(&d));
		assert!(Filter::new("b", Operator::NotEqual, 1).matches(&d));
		assert!(!Filter::new("b", Operator::GreaterThan, 0).matches(&d));
		assert!(!Filter::new("b", Operator::LessThanOrEqual, 0).matches(&d));
	}

	#[test]
	fn test_ranges_compare_within_a_type() {
		let d = doc(json!({"xp": 150, "title": "Bank Shot"}));
		assert!(Filter::new("xp", Operator::GreaterThan, 100).matches(&d));
		assert!(Filter::new("xp", Operator::GreaterThanOrEqual, 150).matches(&d));
		assert!(Filter::new("xp", Operator::LessThan, 150.5).matches(&d));
		assert!(!Filter::new("xp", Operator::LessThan, "200").matches(&d));
		assert!(Filter::new("title", Operator::LessThan, "Break").matches(&d));
		assert!(!Filter::new("title", Operator::GreaterThan, 1).matches(&d));
	}

	#[test]
	fn test_composite_values_compare_structurally() {
		let d = doc(json!({"tags": ["break", "skill"], "stats": {"a": 1}}));
		assert!(Filter::new("tags", Operator::Equal, json!(["break", "skill"])).matches(&d));
		assert!(Filter::new("stats", Operator::Equal, json!({"a": 1.0})).matches(&d));
		assert!(!Filter::new("tags", Operator::GreaterThan, json!(["a"])).matches(&d));
	}

	#[test]
	fn test_sort_puts_missing_and_null_first_both_ways() {
		let values = [Some(json!(2)), None, Some(json!(1)), Some(Value::Null)];
		let mut asc: Vec<_> = values.iter().collect();
		asc.sort_by(|a, b| compare_for_sort(a.as_ref(), b.as_ref(), Direction::Ascending));
		assert_eq!(asc, [&None, &Some(Value::Null), &Some(json!(1)), &Some(json!(2))]);

		let mut desc: Vec<_> = values.iter().collect();
		desc.sort_by(|a, b| compare_for_sort(a.as_ref(), b.as_ref(), Direction::Descending));
		assert_eq!(desc, [&None, &Some(Value::Null), &Some(json!(2)), &Some(json!(1))]);
	}

	#[test]
	fn test_sort_ranks_mixed_types() {
		let mut values = [json!("b"), json!(3), json!(true), json!("a")];
		values.sort_by(|a, b| compare_for_sort(Some(a), Some(b), Direction::Ascending));
		assert_eq!(values, [json!(true), json!(3), json!("a"), json!("b")]);
	}

	#[test]
	fn test_numbers_near_i64_max_order_transitively() {
		let big = json!(9_223_372_036_854_775_808u64);
		let max = json!(i64::MAX);
		let float = json!(9.223372036854776e18);
		let cmp = |a: &Value, b: &Value| compare_for_sort(Some(a), Some(b), Direction::Ascending);

		assert_eq!(cmp(&big, &max), Ordering::Greater);
		assert_eq!(cmp(&max, &float), Ordering::Less);
		assert_eq!(cmp(&big, &float), Ordering::Equal);
		assert_eq!(cmp(&json!(2), &json!(2.5)), Ordering::Less);
		assert_eq!(cmp(&json!(-2), &json!(-2.5)), Ordering::Greater);
		assert!(Filter::new("n", Operator::Equal, 100).matches(&doc(json!({"n": 100.0}))));

		let mut values = vec![float.clone(), big.clone(), max.clone(), json!(-1), json!(u64::MAX)];
		values.sort_by(|a, b| cmp(a, b));
		assert_eq!(values[0], json!(-1));
		assert_eq!(values[1], max);
		assert_eq!(values[4], json!(u64::MAX));
	}
}
