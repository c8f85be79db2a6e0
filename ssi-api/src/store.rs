//! Durable storage for parties and credentials.
//!
//! All rows keep their JSON payloads (DID documents, attribute maps, Merkle
//! commitments) as serialized text columns; the fields the queries filter or
//! aggregate on (subject, status list, status index) are real columns.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{Row as _, sqlite::SqlitePool};

use crate::{
	did::DidDoc,
	merkle::{self, MerkleCommitment},
	now_ts,
};

pub const CREDENTIAL_SCHEMA: &str = "example:student-id-v1";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PartyRole {
	Issuer,
	Holder,
	Verifier,
}

impl PartyRole {
	fn table(self) -> &'static str {
		match self {
			PartyRole::Issuer => "issuers",
			PartyRole::Holder => "holders",
			PartyRole::Verifier => "verifiers",
		}
	}
}

#[derive(Debug, Clone)]
pub struct Party {
	pub did: String,
	pub label: String,
	pub doc: DidDoc,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct CredentialStatus {
	pub list_id: String,
	pub index: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
	pub id: String,
	pub issuer: String,
	pub subject: String,
	pub schema: String,
	pub attrs: Map<String, Value>,
	pub merkle: MerkleCommitment,
	pub status: CredentialStatus,
	pub issued_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error(transparent)]
	Db(#[from] sqlx::Error),
	#[error("corrupt stored row: {0}")]
	Corrupt(#[from] serde_json::Error),
}

/// Upserts a party by DID. The original `created_at` survives re-bootstraps
/// so default-party selection stays stable.
pub async fn save_party(
	pool: &SqlitePool,
	role: PartyRole,
	label: &str,
	did: &str,
	doc: &DidDoc,
) -> Result<(), StoreError> {
	let sql = format!(
		"INSERT INTO {} (did, label, did_doc, created_at) VALUES (?1, ?2, ?3, ?4) \
		 ON CONFLICT (did) DO UPDATE SET label = excluded.label, did_doc = excluded.did_doc",
		role.table()
	);
	sqlx::query(&sql)
		.bind(did)
		.bind(label)
		.bind(serde_json::to_string(doc)?)
		.bind(now_ts())
		.execute(pool)
		.await?;
	Ok(())
}

pub async fn get_party(
	pool: &SqlitePool,
	role: PartyRole,
	did: &str,
) -> Result<Option<Party>, StoreError> {
	let sql = format!(
		"SELECT did, label, did_doc FROM {} WHERE did = ?1",
		role.table()
	);
	let row = sqlx::query(&sql).bind(did).fetch_optional(pool).await?;
	row.map(party_from_row).transpose()
}

/// The first-bootstrapped party of the given role, if any.
pub async fn get_default_party(
	pool: &SqlitePool,
	role: PartyRole,
) -> Result<Option<Party>, StoreError> {
	let sql = format!(
		"SELECT did, label, did_doc FROM {} ORDER BY created_at ASC, rowid ASC LIMIT 1",
		role.table()
	);
	let row = sqlx::query(&sql).fetch_optional(pool).await?;
	row.map(party_from_row).transpose()
}

fn party_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Party, StoreError> {
	let raw_doc: String = row.try_get("did_doc")?;
	Ok(Party {
		did: row.try_get("did")?,
		label: row.try_get("label")?,
		doc: serde_json::from_str(&raw_doc)?,
	})
}

/// Inserts a credential at the pre-allocated status list slot and returns the
/// full record, Merkle commitment included.
pub async fn create_credential(
	pool: &SqlitePool,
	issuer_did: &str,
	subject_did: &str,
	attrs: Map<String, Value>,
	list_id: &str,
	index: i64,
) -> Result<CredentialRecord, StoreError> {
	let record = CredentialRecord {
		id: format!("cred:{issuer_did}:{index}"),
		issuer: issuer_did.to_owned(),
		subject: subject_did.to_owned(),
		schema: CREDENTIAL_SCHEMA.to_owned(),
		merkle: merkle::commit(&attrs, None),
		status: CredentialStatus {
			list_id: list_id.to_owned(),
			index,
		},
		issued_at: now_ts(),
		attrs,
	};

	sqlx::query(
		"INSERT INTO credentials \
		 (id, issuer, subject, schema, attrs, merkle, status_list_id, status_index, issued_at) \
		 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
	)
	.bind(&record.id)
	.bind(&record.issuer)
	.bind(&record.subject)
	.bind(&record.schema)
	.bind(serde_json::to_string(&record.attrs)?)
	.bind(serde_json::to_string(&record.merkle)?)
	.bind(&record.status.list_id)
	.bind(record.status.index)
	.bind(record.issued_at)
	.execute(pool)
	.await?;

	Ok(record)
}

pub async fn get_credential(
	pool: &SqlitePool,
	cred_id: &str,
) -> Result<Option<CredentialRecord>, StoreError> {
	let row = sqlx::query(
		"SELECT id, issuer, subject, schema, attrs, merkle, status_list_id, status_index, issued_at \
		 FROM credentials WHERE id = ?1",
	)
	.bind(cred_id)
	.fetch_optional(pool)
	.await?;
	row.map(credential_from_row).transpose()
}

pub async fn list_credentials_for_holder(
	pool: &SqlitePool,
	holder_did: &str,
) -> Result<Vec<CredentialRecord>, StoreError> {
	let rows = sqlx::query(
		"SELECT id, issuer, subject, schema, attrs, merkle, status_list_id, status_index, issued_at \
		 FROM credentials WHERE subject = ?1 ORDER BY rowid ASC",
	)
	.bind(holder_did)
	.fetch_all(pool)
	.await?;
	rows.into_iter().map(credential_from_row).collect()
}

fn credential_from_row(row: sqlx::sqlite::SqliteRow) -> Result<CredentialRecord, StoreError> {
	let raw_attrs: String = row.try_get("attrs")?;
	let raw_merkle: String = row.try_get("merkle")?;
	Ok(CredentialRecord {
		id: row.try_get("id")?,
		issuer: row.try_get("issuer")?,
		subject: row.try_get("subject")?,
		schema: row.try_get("schema")?,
		attrs: serde_json::from_str(&raw_attrs)?,
		merkle: serde_json::from_str(&raw_merkle)?,
		status: CredentialStatus {
			list_id: row.try_get("status_list_id")?,
			index: row.try_get("status_index")?,
		},
		issued_at: row.try_get("issued_at")?,
	})
}

/// Administrative wipe of every table.
pub async fn reset_state(pool: &SqlitePool) -> Result<(), StoreError> {
	let mut tx = pool.begin().await?;
	for table in [
		"credentials",
		"revocations",
		"statuslists",
		"issuers",
		"holders",
		"verifiers",
	] {
		let sql = format!("DELETE FROM {table}");
		sqlx::query(&sql).execute(&mut *tx).await?;
	}
	tx.commit().await?;
	Ok(())
}
