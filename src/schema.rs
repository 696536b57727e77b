//! Typed records stored in the document store.
//!
//! Documents are read back through [`DocumentSnapshot::data_as`](crate::DocumentSnapshot::data_as),
//! so a stored shape that does not fit surfaces as
//! [`ForgeError::MalformedData`](crate::ForgeError::MalformedData) instead of
//! silently missing fields.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Who is signed in. This is the session pointer's contents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
	pub uid: String,
	pub email: String,
	#[serde(default)]
	pub display_name: Option<String>,
}

/// Profile document at `users/<uid>`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
	pub uid: String,
	pub email: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub username: Option<String>,
	#[serde(default)]
	pub points: i64,
	#[serde(default)]
	pub stats: UserStats,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub created_at: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
	#[serde(default)]
	pub completed_challenges: u64,
	#[serde(default)]
	pub daily_streak: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_challenge_date: Option<String>,
	/// Per-type and per-difficulty counters such as `breakChallenges` or
	/// `hardChallenges`.
	#[serde(flatten)]
	pub counters: BTreeMap<String, u64>,
}

/// Practice challenge at `users/<uid>/challenges/<id>`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
	#[serde(default)]
	pub id: String,
	pub title: String,
	#[serde(default)]
	pub description: String,
	pub difficulty: String,
	pub xp: i64,
	#[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
	#[serde(default)]
	pub daily: bool,
	#[serde(default)]
	pub completed: bool,
	#[serde(default)]
	pub archived: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub created_at: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub completed_at: Option<String>,
}

/// Earned achievement at `users/<uid>/achievements/<id>`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub description: String,
	#[serde(default)]
	pub icon: String,
	#[serde(default)]
	pub category: String,
	#[serde(default)]
	pub rarity: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub earned_at: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_user_reads_camel_case_and_keeps_counters() {
		let user: User = serde_json::from_value(json!({
			"uid": "user_1",
			"email": "a@b.c",
			"points": 350,
			"stats": {
				"completedChallenges": 4,
				"dailyStreak": 2,
				"breakChallenges": 1,
				"hardChallenges": 3
			}
		}))
		.unwrap();

		assert_eq!(user.points, 350);
		assert_eq!(user.stats.completed_challenges, 4);
		assert_eq!(user.stats.counters["hardChallenges"], 3);
		assert_eq!(user.username, None);

		let back = serde_json::to_value(&user).unwrap();
		assert_eq!(back["stats"]["breakChallenges"], json!(1));
		assert!(back.get("username").is_none());
	}

	#[test]
	fn test_challenge_type_field_is_renamed() {
		let challenge: Challenge = serde_json::from_value(json!({
			"title": "The Perfect Break",
			"difficulty": "Medium",
			"xp": 150,
			"type": "Break",
			"daily": true
		}))
		.unwrap();
		assert_eq!(challenge.kind.as_deref(), Some("Break"));
		assert!(!challenge.completed);
		assert_eq!(serde_json::to_value(&challenge).unwrap()["type"], json!("Break"));
	}

	#[test]
	fn test_wrong_shapes_fail() {
		assert!(serde_json::from_value::<Challenge>(json!({"title": "x", "difficulty": "Easy", "xp": "lots"})).is_err());
		assert!(serde_json::from_value::<Identity>(json!({"uid": 1, "email": "a"})).is_err());
	}
}
