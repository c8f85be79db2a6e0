//! Volatile key-value storage with per-entry TTLs.
//!
//! Challenges and issuance offers live here. The service only depends on the
//! [`ExpiringStore`] interface, so an external cache can be slotted in later;
//! [`InMemoryStore`] is the in-process implementation used today.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

#[async_trait]
pub trait ExpiringStore: std::fmt::Debug + Send + Sync + 'static {
	/// Stores `value` under `key` for `ttl`, replacing any previous entry.
	async fn put(&self, key: &str, value: String, ttl: Duration);

	/// Returns the live value for `key`, if any.
	async fn get(&self, key: &str) -> Option<String>;

	/// Removes `key`. Returns whether a live entry was present.
	async fn remove(&self, key: &str) -> bool;

	/// Removes `key` only if its live value equals `expected`. Returns
	/// whether the entry was removed; a caller that loses this race treats
	/// the entry as already consumed.
	async fn remove_if_eq(&self, key: &str, expected: &str) -> bool;

	/// Drops every entry.
	async fn clear(&self);
}

#[derive(Debug)]
struct Entry {
	value: String,
	expires_at: Instant,
}

impl Entry {
	fn is_expired(&self) -> bool {
		self.expires_at <= Instant::now()
	}
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
	entries: Mutex<HashMap<String, Entry>>,
}

#[async_trait]
impl ExpiringStore for InMemoryStore {
	async fn put(&self, key: &str, value: String, ttl: Duration) {
		let entry = Entry {
			value,
			expires_at: Instant::now() + ttl,
		};
		self.entries.lock().await.insert(key.to_owned(), entry);
	}

	async fn get(&self, key: &str) -> Option<String> {
		let mut entries = self.entries.lock().await;
		match entries.get(key) {
			Some(entry) if entry.is_expired() => {
				entries.remove(key);
				None
			}
			Some(entry) => Some(entry.value.clone()),
			None => None,
		}
	}

	async fn remove(&self, key: &str) -> bool {
		let mut entries = self.entries.lock().await;
		match entries.remove(key) {
			Some(entry) => !entry.is_expired(),
			None => false,
		}
	}

	async fn remove_if_eq(&self, key: &str, expected: &str) -> bool {
		let mut entries = self.entries.lock().await;
		match entries.get(key) {
			Some(entry) if !entry.is_expired() && entry.value == expected => {
				entries.remove(key);
				true
			}
			Some(entry) if entry.is_expired() => {
				entries.remove(key);
				false
			}
			_ => false,
		}
	}

	async fn clear(&self) {
		self.entries.lock().await.clear();
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn test_put_then_get() {
		let store = InMemoryStore::default();
		store.put("k", "v".to_owned(), Duration::from_secs(60)).await;
		assert_eq!(store.get("k").await.as_deref(), Some("v"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_entries_expire() {
		let store = InMemoryStore::default();
		store.put("k", "v".to_owned(), Duration::from_secs(60)).await;

		tokio::time::advance(Duration::from_secs(61)).await;
		assert_eq!(store.get("k").await, None);
		assert!(!store.remove("k").await);
	}

	#[tokio::test(start_paused = true)]
	async fn test_put_refreshes_ttl() {
		let store = InMemoryStore::default();
		store.put("k", "v1".to_owned(), Duration::from_secs(10)).await;
		tokio::time::advance(Duration::from_secs(5)).await;
		store.put("k", "v2".to_owned(), Duration::from_secs(10)).await;
		tokio::time::advance(Duration::from_secs(7)).await;

		assert_eq!(store.get("k").await.as_deref(), Some("v2"));
	}

	#[tokio::test]
	async fn test_remove_if_eq_requires_matching_value() {
		let store = InMemoryStore::default();
		store.put("k", "v".to_owned(), Duration::from_secs(60)).await;

		assert!(!store.remove_if_eq("k", "other").await);
		assert_eq!(store.get("k").await.as_deref(), Some("v"));

		assert!(store.remove_if_eq("k", "v").await);
		assert_eq!(store.get("k").await, None);
		assert!(!store.remove_if_eq("k", "v").await);
	}

	#[tokio::test]
	async fn test_clear_drops_everything() {
		let store = InMemoryStore::default();
		store.put("a", "1".to_owned(), Duration::from_secs(60)).await;
		store.put("b", "2".to_owned(), Duration::from_secs(60)).await;
		store.clear().await;

		assert_eq!(store.get("a").await, None);
		assert_eq!(store.get("b").await, None);
	}
}
