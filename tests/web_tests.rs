//! Browser tests for the store and auth running over `localStorage`.
//!
//! Each test uses its own key prefix so runs do not see each other's data.

#![cfg(all(target_arch = "wasm32", feature = "web"))]

use serde_json::json;
use shotforge::{ForgeConfig, KeyValueStore, LocalStorage, PersistenceState, ShotForge};
use wasm_bindgen_test::*;

wasm_bindgen_test_configure!(run_in_browser);

fn isolated_config(name: &str) -> ForgeConfig {
	let tag = format!("{}_{}", name, js_sys::Date::now() as u64);
	ForgeConfig {
		document_prefix: format!("{}_doc_", tag),
		directory_key: format!("{}_users", tag),
		session_key: format!("{}_session", tag),
		quota_bytes: None,
	}
}

fn cleanup(config: &ForgeConfig) {
	let mut storage = LocalStorage::open().unwrap();
	for key in storage.keys_with_prefix(&config.document_prefix).unwrap() {
		storage.remove_item(&key).unwrap();
	}
	storage.remove_item(&config.directory_key).unwrap();
	storage.remove_item(&config.session_key).unwrap();
}

#[wasm_bindgen_test]
async fn test_documents_persist_across_handles() {
	let config = isolated_config("persist");
	let forge = ShotForge::new(LocalStorage::open().unwrap(), &config).unwrap();
	forge
		.db()
		.collection("tables")
		.doc("t1")
		.set(json!({"pockets": 6}))
		.await
		.unwrap();
	drop(forge);

	let reopened = ShotForge::new(LocalStorage::open().unwrap(), &config).unwrap();
	let snap = reopened.db().collection("tables").doc("t1").get().await.unwrap();
	assert_eq!(snap.get("pockets"), Some(&json!(6)));

	cleanup(&config);
}

#[wasm_bindgen_test]
async fn test_session_is_restored_on_reload() {
	let config = isolated_config("session");
	let (storage, state) = LocalStorage::open_or_fallback(&config);
	assert_eq!(state, PersistenceState::Persisted);

	let forge = ShotForge::new(storage, &config).unwrap();
	let me = forge.auth().register("ace@pool.dev", "pw", "Ace").await.unwrap();
	forge.create_profile(&me, "Ace").await.unwrap();
	drop(forge);

	let reloaded = ShotForge::new(LocalStorage::open().unwrap(), &config).unwrap();
	assert_eq!(reloaded.auth().current_user(), Some(me.clone()));
	let user = reloaded.user(&me.uid).await.unwrap().unwrap();
	assert_eq!(user.username.as_deref(), Some("Ace"));

	cleanup(&config);
}
