//! Revocation status lists: one bitmap per issuer, one bit per credential.
//!
//! Bits are packed little-endian: bit `i` lives in byte `i / 8` at position
//! `i % 8`, and a set bit means revoked. Index allocation is serialized per
//! list through an in-process mutex guarding a persisted counter, so two
//! concurrent issuances for the same issuer always get distinct consecutive
//! slots.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex as StdMutex},
};

use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StatusListError {
	#[error("status list {0} is full")]
	Full(String),
	#[error("credential not found")]
	CredentialNotFound,
	#[error(transparent)]
	Db(#[from] sqlx::Error),
}

/// The published form of a status list.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct StatusListDoc {
	pub id: String,
	pub encoding: &'static str,
	/// Lower-case hex of the bitmap.
	pub data: String,
}

#[derive(Debug)]
pub struct StatusListManager {
	pool: SqlitePool,
	capacity_bits: i64,
	locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

pub fn list_id_for(issuer_did: &str) -> String {
	format!("status:{issuer_did}")
}

impl StatusListManager {
	/// `chunk_bytes` bounds each list's bitmap; a list holds `chunk_bytes * 8`
	/// credentials.
	pub fn new(pool: SqlitePool, chunk_bytes: usize) -> Self {
		Self {
			pool,
			capacity_bits: (chunk_bytes as i64).saturating_mul(8),
			locks: StdMutex::new(HashMap::new()),
		}
	}

	fn lock_for(&self, list_id: &str) -> Arc<Mutex<()>> {
		self.locks
			.lock()
			.expect("status list lock table poisoned")
			.entry(list_id.to_owned())
			.or_default()
			.clone()
	}

	async fn ensure_list(
		&self,
		tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
		list_id: &str,
		issuer_did: &str,
	) -> Result<(), StatusListError> {
		sqlx::query(
			"INSERT INTO statuslists (list_id, issuer, bitmap, next_index) \
			 VALUES (?1, ?2, ?3, 0) ON CONFLICT (list_id) DO NOTHING",
		)
		.bind(list_id)
		.bind(issuer_did)
		.bind(Vec::<u8>::new())
		.execute(&mut **tx)
		.await?;
		Ok(())
	}

	/// Reserves the next free index in the issuer's list, creating the list
	/// on first use.
	pub async fn allocate(
		&self,
		issuer_did: &str,
	) -> Result<(String, i64), StatusListError> {
		let list_id = list_id_for(issuer_did);
		let lock = self.lock_for(&list_id);
		let _guard = lock.lock().await;

		let mut tx = self.pool.begin().await?;
		self.ensure_list(&mut tx, &list_id, issuer_did).await?;
		let index: i64 =
			sqlx::query_scalar("SELECT next_index FROM statuslists WHERE list_id = ?1")
				.bind(&list_id)
				.fetch_one(&mut *tx)
				.await?;
		if index >= self.capacity_bits {
			return Err(StatusListError::Full(list_id));
		}
		sqlx::query("UPDATE statuslists SET next_index = next_index + 1 WHERE list_id = ?1")
			.bind(&list_id)
			.execute(&mut *tx)
			.await?;
		tx.commit().await?;

		Ok((list_id, index))
	}

	/// Re-derives the bitmap from the revocation table, persists it, and
	/// returns its published form. The bitmap covers every issued index; a
	/// list with no credentials publishes empty data.
	pub async fn publish(&self, list_id: &str) -> Result<StatusListDoc, StatusListError> {
		let max_index: Option<i64> = sqlx::query_scalar(
			"SELECT MAX(status_index) FROM credentials WHERE status_list_id = ?1",
		)
		.bind(list_id)
		.fetch_one(&self.pool)
		.await?;

		let mut bitmap = match max_index {
			Some(max) => vec![0u8; (max as usize + 1).div_ceil(8)],
			None => Vec::new(),
		};
		let revoked: Vec<i64> =
			sqlx::query_scalar("SELECT idx FROM revocations WHERE list_id = ?1")
				.bind(list_id)
				.fetch_all(&self.pool)
				.await?;
		for idx in revoked {
			set_bit(&mut bitmap, idx as usize);
		}

		sqlx::query("UPDATE statuslists SET bitmap = ?1 WHERE list_id = ?2")
			.bind(&bitmap)
			.bind(list_id)
			.execute(&self.pool)
			.await?;

		Ok(StatusListDoc {
			id: list_id.to_owned(),
			encoding: "bitset",
			data: hex::encode(&bitmap),
		})
	}

	/// Reads the persisted bitmap. Unknown lists and out-of-range indices are
	/// simply not revoked.
	pub async fn is_revoked(
		&self,
		list_id: &str,
		index: i64,
	) -> Result<bool, StatusListError> {
		let bitmap: Option<Vec<u8>> =
			sqlx::query_scalar("SELECT bitmap FROM statuslists WHERE list_id = ?1")
				.bind(list_id)
				.fetch_optional(&self.pool)
				.await?;
		let Some(bitmap) = bitmap else {
			return Ok(false);
		};
		if index < 0 {
			return Ok(false);
		}
		let byte = index as usize / 8;
		if byte >= bitmap.len() {
			return Ok(false);
		}
		Ok(bitmap[byte] & (1 << (index as usize % 8)) != 0)
	}

	/// Marks the credential revoked: records the `(list_id, idx)` pair and
	/// flips the stored bit in the same transaction, growing the bitmap when
	/// the index lies past its current end. Idempotent.
	pub async fn revoke(&self, cred_id: &str) -> Result<(), StatusListError> {
		let slot: Option<(String, i64)> = sqlx::query_as(
			"SELECT status_list_id, status_index FROM credentials WHERE id = ?1",
		)
		.bind(cred_id)
		.fetch_optional(&self.pool)
		.await?;
		let Some((list_id, index)) = slot else {
			return Err(StatusListError::CredentialNotFound);
		};

		let lock = self.lock_for(&list_id);
		let _guard = lock.lock().await;

		let issuer = cred_issuer_for_list(&list_id);
		let mut tx = self.pool.begin().await?;
		sqlx::query(
			"INSERT INTO revocations (list_id, idx) VALUES (?1, ?2) \
			 ON CONFLICT (list_id, idx) DO NOTHING",
		)
		.bind(&list_id)
		.bind(index)
		.execute(&mut *tx)
		.await?;
		self.ensure_list(&mut tx, &list_id, issuer).await?;
		let mut bitmap: Vec<u8> =
			sqlx::query_scalar("SELECT bitmap FROM statuslists WHERE list_id = ?1")
				.bind(&list_id)
				.fetch_one(&mut *tx)
				.await?;
		set_bit(&mut bitmap, index as usize);
		sqlx::query("UPDATE statuslists SET bitmap = ?1 WHERE list_id = ?2")
			.bind(&bitmap)
			.bind(&list_id)
			.execute(&mut *tx)
			.await?;
		tx.commit().await?;

		Ok(())
	}
}

/// Sets bit `index`, growing the bitmap as needed.
fn set_bit(bitmap: &mut Vec<u8>, index: usize) {
	let byte = index / 8;
	if byte >= bitmap.len() {
		bitmap.resize(byte + 1, 0);
	}
	bitmap[byte] |= 1 << (index % 8);
}

fn cred_issuer_for_list(list_id: &str) -> &str {
	list_id.strip_prefix("status:").unwrap_or(list_id)
}

#[cfg(test)]
mod test {
	use serde_json::{Map, Value, json};
	use sqlx::SqlitePool;

	use crate::store;

	use super::*;

	const ISSUER: &str = "did:key:zissuer";

	fn manager(pool: &SqlitePool) -> StatusListManager {
		StatusListManager::new(pool.clone(), 16384)
	}

	fn attrs(value: Value) -> Map<String, Value> {
		match value {
			Value::Object(map) => map,
			_ => panic!("expected a JSON object"),
		}
	}

	async fn issue_at(pool: &SqlitePool, mgr: &StatusListManager) -> String {
		let (list_id, index) = mgr.allocate(ISSUER).await.unwrap();
		store::create_credential(
			pool,
			ISSUER,
			"did:key:zholder",
			attrs(json!({"n": index})),
			&list_id,
			index,
		)
		.await
		.unwrap()
		.id
	}

	#[sqlx::test(migrator = "crate::MIGRATOR")]
	async fn test_allocation_is_sequential(pool: SqlitePool) {
		let mgr = manager(&pool);
		for expected in 0..3 {
			let (list_id, index) = mgr.allocate(ISSUER).await.unwrap();
			assert_eq!(list_id, format!("status:{ISSUER}"));
			assert_eq!(index, expected);
		}
	}

	#[sqlx::test(migrator = "crate::MIGRATOR")]
	async fn test_concurrent_allocations_are_distinct(pool: SqlitePool) {
		let mgr = Arc::new(manager(&pool));
		let tasks: Vec<_> = (0..8)
			.map(|_| {
				let mgr = Arc::clone(&mgr);
				tokio::spawn(async move { mgr.allocate(ISSUER).await.unwrap().1 })
			})
			.collect();

		let mut indices = Vec::new();
		for task in tasks {
			indices.push(task.await.unwrap());
		}
		indices.sort_unstable();
		assert_eq!(indices, (0..8).collect::<Vec<i64>>());
	}

	#[sqlx::test(migrator = "crate::MIGRATOR")]
	async fn test_full_list_rejects_allocation(pool: SqlitePool) {
		// one byte of bitmap: eight slots
		let mgr = StatusListManager::new(pool.clone(), 1);
		for _ in 0..8 {
			mgr.allocate(ISSUER).await.unwrap();
		}
		let err = mgr.allocate(ISSUER).await.unwrap_err();
		assert!(matches!(err, StatusListError::Full(_)));
	}

	#[sqlx::test(migrator = "crate::MIGRATOR")]
	async fn test_revoke_flips_bit_eagerly_and_is_idempotent(pool: SqlitePool) {
		let mgr = manager(&pool);
		let cred_id = issue_at(&pool, &mgr).await;
		let list_id = format!("status:{ISSUER}");

		assert!(!mgr.is_revoked(&list_id, 0).await.unwrap());

		mgr.revoke(&cred_id).await.unwrap();
		mgr.revoke(&cred_id).await.unwrap();

		// visible without an intervening publish
		assert!(mgr.is_revoked(&list_id, 0).await.unwrap());

		let entries: i64 =
			sqlx::query_scalar("SELECT COUNT(*) FROM revocations WHERE list_id = ?1")
				.bind(&list_id)
				.fetch_one(&pool)
				.await
				.unwrap();
		assert_eq!(entries, 1);
	}

	#[sqlx::test(migrator = "crate::MIGRATOR")]
	async fn test_revoke_unknown_credential(pool: SqlitePool) {
		let mgr = manager(&pool);
		let err = mgr.revoke("cred:did:key:znope:0").await.unwrap_err();
		assert!(matches!(err, StatusListError::CredentialNotFound));
	}

	#[sqlx::test(migrator = "crate::MIGRATOR")]
	async fn test_publish_rederives_bitmap(pool: SqlitePool) {
		let mgr = manager(&pool);
		let first = issue_at(&pool, &mgr).await;
		let _second = issue_at(&pool, &mgr).await;
		let third = issue_at(&pool, &mgr).await;

		mgr.revoke(&first).await.unwrap();
		mgr.revoke(&third).await.unwrap();

		let list_id = format!("status:{ISSUER}");
		let doc = mgr.publish(&list_id).await.unwrap();
		assert_eq!(doc.id, list_id);
		assert_eq!(doc.encoding, "bitset");
		// bits 0 and 2 set
		assert_eq!(doc.data, "05");
	}

	#[sqlx::test(migrator = "crate::MIGRATOR")]
	async fn test_publish_unknown_list_is_empty(pool: SqlitePool) {
		let mgr = manager(&pool);
		let doc = mgr.publish("status:did:key:zunknown").await.unwrap();
		assert_eq!(doc.data, "");
	}

	#[sqlx::test(migrator = "crate::MIGRATOR")]
	async fn test_is_revoked_out_of_range_is_false(pool: SqlitePool) {
		let mgr = manager(&pool);
		let cred_id = issue_at(&pool, &mgr).await;
		let list_id = format!("status:{ISSUER}");
		mgr.revoke(&cred_id).await.unwrap();

		assert!(!mgr.is_revoked(&list_id, 4096).await.unwrap());
		assert!(!mgr.is_revoked(&list_id, -1).await.unwrap());
		assert!(!mgr.is_revoked("status:did:key:zother", 0).await.unwrap());
	}
}
