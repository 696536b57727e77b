//! The application context and the progression flows built on the store:
//! profile creation, challenge completion, XP/levels and achievements.

use crate::auth::Auth;
use crate::config::ForgeConfig;
use crate::document::{CollectionRef, DocumentRef, DynStorage, Firestore};
use crate::error::{ForgeError, Result};
use crate::field_value::{now_timestamp, FieldValue};
use crate::query::Operator;
use crate::schema::{Achievement, Challenge, Identity, User, UserStats};
use crate::KeyValueStore;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

const USERS: &str = "users";
const CHALLENGES: &str = "challenges";
const ACHIEVEMENTS: &str = "achievements";

/// XP needed per level.
pub const XP_PER_LEVEL: i64 = 200;

/// Level reached with `points` XP. Everyone starts at level 1.
pub fn level_for(points: i64) -> i64 {
	points.max(0) / XP_PER_LEVEL + 1
}

/// Total XP at which `level` ends.
pub fn xp_for_next_level(level: i64) -> i64 {
	level * XP_PER_LEVEL
}

/// Progress through the current level, in percent.
pub fn level_progress(points: i64) -> f64 {
	let level_start = (level_for(points) - 1) * XP_PER_LEVEL;
	let progress = (points - level_start) as f64 / XP_PER_LEVEL as f64 * 100.0;
	progress.clamp(0.0, 100.0)
}

/// An achievement together with the condition that earns it.
#[derive(Clone)]
pub struct AchievementCandidate {
	pub achievement: Achievement,
	pub condition: fn(&User) -> bool,
}

/// Everything the UI layer needs, constructed once by the entry point and
/// passed to whoever needs storage or identity.
///
/// ```
/// # futures::executor::block_on(async {
/// use shotforge::{Challenge, ForgeConfig, MemoryStorage, ShotForge};
///
/// let config = ForgeConfig::default();
/// let forge = ShotForge::new(MemoryStorage::from_config(&config), &config).unwrap();
/// let me = forge.auth().register("cue@example.com", "chalk", "Cue").await.unwrap();
/// forge.create_profile(&me, "Cue").await.unwrap();
///
/// let challenge = forge.add_challenge(&me.uid, &Challenge {
///     title: "Stop Shot Series".into(),
///     difficulty: "Easy".into(),
///     xp: 100,
///     daily: true,
///     ..Default::default()
/// }).await.unwrap();
///
/// let user = forge.complete_challenge(&me.uid, &challenge.id).await.unwrap();
/// assert_eq!(user.points, 100);
/// assert_eq!(user.stats.completed_challenges, 1);
/// # });
/// ```
#[derive(Clone)]
pub struct ShotForge {
	db: Firestore,
	auth: Auth,
}

impl ShotForge {
	/// Builds the document store and auth over one shared substrate.
	pub fn new(storage: impl KeyValueStore + 'static, config: &ForgeConfig) -> Result<Self> {
		let boxed: Box<DynStorage> = Box::new(storage);
		let shared = Arc::new(Mutex::new(boxed));
		Ok(Self {
			db: Firestore::with_storage(Arc::clone(&shared), config),
			auth: Auth::with_storage(shared, config)?,
		})
	}

	pub fn db(&self) -> &Firestore {
		&self.db
	}

	pub fn auth(&self) -> &Auth {
		&self.auth
	}

	fn user_doc(&self, uid: &str) -> DocumentRef {
		self.db.collection(USERS).doc(uid)
	}

	fn challenges(&self, uid: &str) -> CollectionRef {
		self.user_doc(uid).collection(CHALLENGES)
	}

	fn achievements(&self, uid: &str) -> CollectionRef {
		self.user_doc(uid).collection(ACHIEVEMENTS)
	}

	/// Writes the profile document for a freshly registered account.
	pub async fn create_profile(&self, identity: &Identity, username: &str) -> Result<User> {
		let doc = self.user_doc(&identity.uid);
		doc.set(json!({
			"uid": identity.uid,
			"email": identity.email,
			"username": username,
			"points": 0,
			"stats": UserStats::default(),
			"createdAt": FieldValue::server_timestamp(),
		}))
		.await?;
		self.require_user(&identity.uid).await
	}

	/// The profile at `users/<uid>`, if present.
	pub async fn user(&self, uid: &str) -> Result<Option<User>> {
		self.user_doc(uid).get().await?.data_as()
	}

	async fn require_user(&self, uid: &str) -> Result<User> {
		self.user(uid)
			.await?
			.ok_or_else(|| ForgeError::NotFound(format!("user {}", uid)))
	}

	/// Stores a challenge for `uid`. An empty `id` gets a generated one.
	pub async fn add_challenge(&self, uid: &str, challenge: &Challenge) -> Result<Challenge> {
		let collection = self.challenges(uid);
		let mut data = serde_json::to_value(challenge)?;
		data["createdAt"] = FieldValue::server_timestamp();

		let doc = if challenge.id.is_empty() {
			collection.add(data).await?
		} else {
			let doc = collection.doc(challenge.id.as_str());
			doc.set(data).await?;
			doc
		};
		doc.update(json!({"id": doc.id()})).await?;
		doc.get()
			.await?
			.data_as()?
			.ok_or_else(|| ForgeError::NotFound(format!("challenge {}", doc.path())))
	}

	/// Daily challenges that have not been archived.
	pub async fn daily_challenges(&self, uid: &str) -> Result<Vec<Challenge>> {
		self.challenges(uid)
			.where_field("daily", Operator::Equal, true)
			.where_field("archived", Operator::NotEqual, true)
			.get()
			.await?
			.data_as()
	}

	/// Retires a challenge. Challenges are never physically removed.
	pub async fn archive_challenge(&self, uid: &str, challenge_id: &str) -> Result<()> {
		let doc = self.challenges(uid).doc(challenge_id);
		if !doc.get().await?.exists() {
			return Err(ForgeError::NotFound(format!("challenge {}", doc.path())));
		}
		doc.update(json!({"archived": true})).await
	}

	/// Marks a challenge completed and credits its XP and stats to the user.
	/// Completing an already completed challenge changes nothing.
	///
	/// The challenge and the user are separate documents written one after
	/// the other; there is no transaction spanning both. If crediting the user
	/// fails, the challenge is marked open again so a retry can complete it.
	pub async fn complete_challenge(&self, uid: &str, challenge_id: &str) -> Result<User> {
		self.complete_challenge_at(uid, challenge_id, Utc::now()).await
	}

	pub(crate) async fn complete_challenge_at(
		&self,
		uid: &str,
		challenge_id: &str,
		now: DateTime<Utc>,
	) -> Result<User> {
		let doc = self.challenges(uid).doc(challenge_id);
		let challenge: Challenge = doc
			.get()
			.await?
			.data_as()?
			.ok_or_else(|| ForgeError::NotFound(format!("challenge {}", doc.path())))?;
		let user = self.require_user(uid).await?;

		if challenge.completed {
			tracing::debug!("Challenge {} already completed", doc.path());
			return Ok(user);
		}

		doc.update(json!({
			"completed": true,
			"completedAt": FieldValue::server_timestamp(),
		}))
		.await?;

		let stats = next_stats(&user.stats, &challenge, now);
		let credited = self
			.user_doc(uid)
			.update(json!({
				"points": FieldValue::increment(challenge.xp),
				"stats": stats,
			}))
			.await;
		if let Err(e) = credited {
			tracing::warn!("Crediting {} for {} failed, reopening challenge: {}", uid, challenge_id, e);
			if let Err(rollback) = doc
				.update(json!({"completed": false, "completedAt": null}))
				.await
			{
				tracing::warn!("Could not reopen challenge {}: {}", doc.path(), rollback);
			}
			return Err(e);
		}

		tracing::info!(
			"User {} completed {} for {} XP",
			uid,
			challenge_id,
			challenge.xp
		);
		self.require_user(uid).await
	}

	/// Awards every candidate the user qualifies for and has not earned yet.
	/// Returns only the newly earned achievements, so repeated calls are
	/// no-ops.
	pub async fn award_achievements(
		&self,
		uid: &str,
		candidates: &[AchievementCandidate],
	) -> Result<Vec<Achievement>> {
		let user = self.require_user(uid).await?;
		let collection = self.achievements(uid);
		let mut earned: BTreeSet<String> = collection
			.get()
			.await?
			.iter()
			.map(|doc| doc.id().to_string())
			.collect();

		let mut awarded = Vec::new();
		for candidate in candidates {
			let id = &candidate.achievement.id;
			if earned.contains(id) || !(candidate.condition)(&user) {
				continue;
			}
			let achievement = Achievement {
				earned_at: Some(now_timestamp()),
				..candidate.achievement.clone()
			};
			collection
				.doc(id.as_str())
				.set(serde_json::to_value(&achievement)?)
				.await?;
			earned.insert(id.clone());
			awarded.push(achievement);
		}

		if !awarded.is_empty() {
			tracing::info!("User {} earned {} achievement(s)", uid, awarded.len());
		}
		Ok(awarded)
	}

	/// Achievements the user has earned so far.
	pub async fn achievements_of(&self, uid: &str) -> Result<Vec<Achievement>> {
		self.achievements(uid).get().await?.data_as()
	}
}

/// Stats after completing `challenge` at `now`. The daily streak counts
/// completions on the same UTC day and restarts at 1 on a new day.
fn next_stats(stats: &UserStats, challenge: &Challenge, now: DateTime<Utc>) -> UserStats {
	let mut next = stats.clone();
	next.completed_challenges += 1;

	let last_day = stats
		.last_challenge_date
		.as_deref()
		.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
		.map(|d| d.with_timezone(&Utc).date_naive());
	next.daily_streak = if last_day == Some(now.date_naive()) {
		stats.daily_streak + 1
	} else {
		1
	};
	next.last_challenge_date = Some(now.to_rfc3339_opts(SecondsFormat::Millis, true));

	for label in [challenge.kind.as_deref(), Some(challenge.difficulty.as_str())]
		.into_iter()
		.flatten()
		.filter(|l| !l.is_empty())
	{
		*next
			.counters
			.entry(format!("{}Challenges", label.to_lowercase()))
			.or_insert(0) += 1;
	}
	next
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::listeners::Subscription;
	use crate::memory::{MemoryConfig, MemoryStorage};
	use crate::StorageListener;
	use chrono::TimeZone;
	use futures::executor::block_on;

	fn forge() -> ShotForge {
		ShotForge::new(
			MemoryStorage::new(MemoryConfig::default()),
			&ForgeConfig::default(),
		)
		.unwrap()
	}

	async fn signed_up(forge: &ShotForge) -> Identity {
		let me = forge
			.auth()
			.register("player@pool.dev", "secret", "Player")
			.await
			.unwrap();
		forge.create_profile(&me, "Player").await.unwrap();
		me
	}

	/// Memory storage that rejects writes to one key while armed.
	struct FailingStorage {
		inner: MemoryStorage,
		fail_key: Arc<Mutex<Option<String>>>,
	}

	impl KeyValueStore for FailingStorage {
		fn get_item(&self, key: &str) -> Result<Option<String>> {
			self.inner.get_item(key)
		}

		fn set_item(&mut self, key: &str, value: &str) -> Result<()> {
			if self.fail_key.lock().unwrap().as_deref() == Some(key) {
				return Err(ForgeError::QuotaExceeded {
					key: key.to_string(),
					detail: "injected".into(),
				});
			}
			self.inner.set_item(key, value)
		}

		fn remove_item(&mut self, key: &str) -> Result<()> {
			self.inner.remove_item(key)
		}

		fn len(&self) -> Result<usize> {
			self.inner.len()
		}

		fn key(&self, index: usize) -> Result<Option<String>> {
			self.inner.key(index)
		}

		fn subscribe(&mut self, listener: StorageListener) -> Subscription {
			self.inner.subscribe(listener)
		}
	}

	fn challenge(title: &str, xp: i64, kind: &str, difficulty: &str) -> Challenge {
		Challenge {
			title: title.into(),
			difficulty: difficulty.into(),
			xp,
			kind: Some(kind.into()),
			daily: true,
			..Default::default()
		}
	}

	#[test]
	fn test_level_math() {
		assert_eq!(level_for(0), 1);
		assert_eq!(level_for(199), 1);
		assert_eq!(level_for(200), 2);
		assert_eq!(level_for(-50), 1);
		assert_eq!(xp_for_next_level(3), 600);
		assert_eq!(level_progress(300), 50.0);
		assert_eq!(level_progress(0), 0.0);
	}

	#[test]
	fn test_streak_counts_same_day_and_resets_on_new_day() {
		let morning = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
		let evening = Utc.with_ymd_and_hms(2026, 10, 19, 21, 0, 0).unwrap();
		let next_day = Utc.with_ymd_and_hms(2026, 10, 20, 8, 0, 0).unwrap();
		let c = challenge("Bank Shot Master", 200, "Skill", "Hard");

		let first = next_stats(&UserStats::default(), &c, morning);
		assert_eq!(first.daily_streak, 1);
		let second = next_stats(&first, &c, evening);
		assert_eq!(second.daily_streak, 2);
		assert_eq!(second.completed_challenges, 2);
		assert_eq!(second.counters["skillChallenges"], 2);
		assert_eq!(second.counters["hardChallenges"], 2);

		let third = next_stats(&second, &c, next_day);
		assert_eq!(third.daily_streak, 1);
		assert_eq!(third.completed_challenges, 3);
	}

	#[test]
	fn test_complete_challenge_credits_once() {
		block_on(async {
			let forge = forge();
			let me = signed_up(&forge).await;
			let added = forge
				.add_challenge(&me.uid, &challenge("The Perfect Break", 150, "Break", "Medium"))
				.await
				.unwrap();
			assert!(added.created_at.is_some());
			assert!(!added.id.is_empty());

			let user = forge.complete_challenge(&me.uid, &added.id).await.unwrap();
			assert_eq!(user.points, 150);
			assert_eq!(user.stats.counters["breakChallenges"], 1);

			let again = forge.complete_challenge(&me.uid, &added.id).await.unwrap();
			assert_eq!(again.points, 150);
			assert_eq!(again.stats.completed_challenges, 1);

			let stored: Challenge = forge
				.challenges(&me.uid)
				.doc(added.id.as_str())
				.get()
				.await
				.unwrap()
				.data_as()
				.unwrap()
				.unwrap();
			assert!(stored.completed);
			assert!(stored.completed_at.is_some());
		});
	}

	#[test]
	fn test_complete_missing_challenge_is_not_found() {
		block_on(async {
			let forge = forge();
			let me = signed_up(&forge).await;
			let err = forge.complete_challenge(&me.uid, "nope").await.unwrap_err();
			assert_eq!(err.code(), "not-found");
		});
	}

	#[test]
	fn test_archived_challenges_leave_the_daily_list() {
		block_on(async {
			let forge = forge();
			let me = signed_up(&forge).await;
			let keep = forge
				.add_challenge(&me.uid, &challenge("Follow Through", 100, "Technique", "Easy"))
				.await
				.unwrap();
			let retired = forge
				.add_challenge(&me.uid, &challenge("Jump Shot", 300, "Technique", "Expert"))
				.await
				.unwrap();

			forge.archive_challenge(&me.uid, &retired.id).await.unwrap();
			let daily = forge.daily_challenges(&me.uid).await.unwrap();
			assert_eq!(daily.len(), 1);
			assert_eq!(daily[0].id, keep.id);

			let err = forge.archive_challenge(&me.uid, "ghost").await.unwrap_err();
			assert_eq!(err.code(), "not-found");
		});
	}

	#[test]
	fn test_achievements_are_awarded_once() {
		block_on(async {
			let forge = forge();
			let me = signed_up(&forge).await;
			let c = forge
				.add_challenge(&me.uid, &challenge("Straight Shooter", 100, "Accuracy", "Easy"))
				.await
				.unwrap();
			forge.complete_challenge(&me.uid, &c.id).await.unwrap();

			let candidates = [
				AchievementCandidate {
					achievement: Achievement {
						id: "first_challenge".into(),
						name: "First Steps".into(),
						..Default::default()
					},
					condition: |u| u.stats.completed_challenges >= 1,
				},
				AchievementCandidate {
					achievement: Achievement {
						id: "level_5".into(),
						name: "Rising Star".into(),
						..Default::default()
					},
					condition: |u| level_for(u.points) >= 5,
				},
			];

			let earned = forge.award_achievements(&me.uid, &candidates).await.unwrap();
			assert_eq!(earned.len(), 1);
			assert_eq!(earned[0].id, "first_challenge");
			assert!(earned[0].earned_at.is_some());

			let again = forge.award_achievements(&me.uid, &candidates).await.unwrap();
			assert!(again.is_empty());
			assert_eq!(forge.achievements_of(&me.uid).await.unwrap().len(), 1);
		});
	}

	#[test]
	fn test_store_and_auth_share_one_substrate() {
		block_on(async {
			let forge = forge();
			let me = signed_up(&forge).await;
			let user = forge.user(&me.uid).await.unwrap().unwrap();
			assert_eq!(user.email, "player@pool.dev");
			assert_eq!(user.username.as_deref(), Some("Player"));
			assert!(user.created_at.is_some());
			assert_eq!(forge.auth().current_user(), Some(me));
		});
	}

	#[test]
	fn test_failed_credit_reopens_challenge_for_retry() {
		block_on(async {
			let fail_key = Arc::new(Mutex::new(None));
			let storage = FailingStorage {
				inner: MemoryStorage::new(MemoryConfig::default()),
				fail_key: Arc::clone(&fail_key),
			};
			let forge = ShotForge::new(storage, &ForgeConfig::default()).unwrap();
			let me = signed_up(&forge).await;
			let c = forge
				.add_challenge(&me.uid, &challenge("Bank Shot Master", 200, "Skill", "Hard"))
				.await
				.unwrap();

			*fail_key.lock().unwrap() = Some(format!("pool_doc_users/{}", me.uid));
			let err = forge.complete_challenge(&me.uid, &c.id).await.unwrap_err();
			assert_eq!(err.code(), "resource-exhausted");

			let reopened: Challenge = forge
				.challenges(&me.uid)
				.doc(c.id.as_str())
				.get()
				.await
				.unwrap()
				.data_as()
				.unwrap()
				.unwrap();
			assert!(!reopened.completed);
			assert_eq!(reopened.completed_at, None);

			*fail_key.lock().unwrap() = None;
			let user = forge.complete_challenge(&me.uid, &c.id).await.unwrap();
			assert_eq!(user.points, 200);
			assert_eq!(user.stats.completed_challenges, 1);
		});
	}

	#[test]
	fn test_streak_follows_completion_days() {
		block_on(async {
			let forge = forge();
			let me = signed_up(&forge).await;
			let mut ids = Vec::new();
			for title in ["Stop Shot Series", "Follow Through", "Rail First"] {
				let c = forge
					.add_challenge(&me.uid, &challenge(title, 100, "Control", "Easy"))
					.await
					.unwrap();
				ids.push(c.id);
			}

			let day = |d, h| Utc.with_ymd_and_hms(2026, 10, d, h, 0, 0).unwrap();
			forge.complete_challenge_at(&me.uid, &ids[0], day(19, 23)).await.unwrap();
			let same_day = forge.complete_challenge_at(&me.uid, &ids[1], day(19, 23)).await.unwrap();
			assert_eq!(same_day.stats.daily_streak, 2);

			let next_day = forge.complete_challenge_at(&me.uid, &ids[2], day(20, 0)).await.unwrap();
			assert_eq!(next_day.stats.daily_streak, 1);
			assert_eq!(next_day.stats.completed_challenges, 3);
			assert_eq!(next_day.points, 300);
		});
	}
}
