//! Short-lived nonces binding a presentation to its verifier audience.
//!
//! A nonce is consumed by its first successful validation; failed validations
//! leave it in place until the TTL elapses. Consumption is a compare-and-
//! delete against the stored record so concurrent validators cannot both win.

use std::{sync::Arc, time::Duration};

use rand::{RngCore as _, rngs::OsRng};
use serde::{Deserialize, Serialize};

use crate::{cache::ExpiringStore, now_ts};

pub const CHALLENGE_TTL_SECS: i64 = 300;
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Serialize)]
pub struct Challenge {
	pub nonce: String,
	pub aud: String,
	pub exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChallengeRecord {
	aud: String,
	exp: i64,
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ChallengeError {
	#[error("nonce not found")]
	NotFound,
	#[error("aud mismatch")]
	AudMismatch,
	#[error("expired")]
	Expired,
}

#[derive(Debug, Clone)]
pub struct ChallengeManager {
	store: Arc<dyn ExpiringStore>,
}

impl ChallengeManager {
	pub fn new(store: Arc<dyn ExpiringStore>) -> Self {
		Self { store }
	}

	pub async fn issue(&self, aud: &str) -> Challenge {
		let mut buf = [0u8; NONCE_LEN];
		OsRng.fill_bytes(&mut buf);
		let nonce = crate::b64url(buf);
		let exp = now_ts() + CHALLENGE_TTL_SECS;

		let record = ChallengeRecord {
			aud: aud.to_owned(),
			exp,
		};
		self.store
			.put(
				&storage_key(&nonce),
				serde_json::to_string(&record).expect("record always serializes"),
				Duration::from_secs(CHALLENGE_TTL_SECS as u64),
			)
			.await;

		Challenge {
			nonce,
			aud: aud.to_owned(),
			exp,
		}
	}

	/// Validates and, on success only, consumes the nonce.
	pub async fn validate(&self, nonce: &str, aud: &str) -> Result<(), ChallengeError> {
		let key = storage_key(nonce);
		let Some(raw) = self.store.get(&key).await else {
			return Err(ChallengeError::NotFound);
		};
		let record: ChallengeRecord =
			serde_json::from_str(&raw).map_err(|_| ChallengeError::NotFound)?;

		if record.aud != aud {
			return Err(ChallengeError::AudMismatch);
		}
		if record.exp < now_ts() {
			return Err(ChallengeError::Expired);
		}
		// a concurrent validator may have consumed it between get and delete
		if self.store.remove_if_eq(&key, &raw).await {
			Ok(())
		} else {
			Err(ChallengeError::NotFound)
		}
	}
}

fn storage_key(nonce: &str) -> String {
	format!("ch:{nonce}")
}

#[cfg(test)]
mod test {
	use crate::cache::InMemoryStore;

	use super::*;

	fn manager() -> ChallengeManager {
		ChallengeManager::new(Arc::new(InMemoryStore::default()))
	}

	#[tokio::test]
	async fn test_issue_shapes_the_challenge() {
		let mgr = manager();
		let challenge = mgr.issue("did:key:zverifier").await;

		// 12 random bytes encode to 16 base64url characters
		assert_eq!(challenge.nonce.len(), 16);
		assert_eq!(challenge.aud, "did:key:zverifier");
		assert!(challenge.exp > now_ts());
	}

	#[tokio::test]
	async fn test_nonce_is_single_use() {
		let mgr = manager();
		let challenge = mgr.issue("aud").await;

		assert_eq!(mgr.validate(&challenge.nonce, "aud").await, Ok(()));
		assert_eq!(
			mgr.validate(&challenge.nonce, "aud").await,
			Err(ChallengeError::NotFound)
		);
	}

	#[tokio::test]
	async fn test_aud_mismatch_does_not_consume() {
		let mgr = manager();
		let challenge = mgr.issue("aud").await;

		assert_eq!(
			mgr.validate(&challenge.nonce, "other").await,
			Err(ChallengeError::AudMismatch)
		);
		// still available for the right audience
		assert_eq!(mgr.validate(&challenge.nonce, "aud").await, Ok(()));
	}

	#[tokio::test]
	async fn test_unknown_nonce_is_not_found() {
		let mgr = manager();
		assert_eq!(
			mgr.validate("nope", "aud").await,
			Err(ChallengeError::NotFound)
		);
	}

	#[tokio::test]
	async fn test_stale_record_is_expired() {
		let store = Arc::new(InMemoryStore::default());
		let mgr = ChallengeManager::new(store.clone());

		// a record whose embedded exp already passed but whose storage TTL
		// has not: validation reports expiry and leaves the entry alone
		let record = serde_json::to_string(&ChallengeRecord {
			aud: "aud".to_owned(),
			exp: now_ts() - 1,
		})
		.unwrap();
		store
			.put("ch:stale", record, Duration::from_secs(60))
			.await;

		assert_eq!(
			mgr.validate("stale", "aud").await,
			Err(ChallengeError::Expired)
		);
		assert!(store.get("ch:stale").await.is_some());
	}

	#[tokio::test]
	async fn test_concurrent_validation_has_one_winner() {
		let mgr = manager();
		let challenge = mgr.issue("aud").await;

		let tasks: Vec<_> = (0..8)
			.map(|_| {
				let mgr = mgr.clone();
				let nonce = challenge.nonce.clone();
				tokio::spawn(async move { mgr.validate(&nonce, "aud").await })
			})
			.collect();

		let mut winners = 0;
		for task in tasks {
			if task.await.unwrap().is_ok() {
				winners += 1;
			}
		}
		assert_eq!(winners, 1);
	}
}
