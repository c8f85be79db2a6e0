//! Building and verifying selective-disclosure presentations.
//!
//! The holder composes a disclosure payload, binds it to a fresh nonce for
//! the verifier's audience, and encrypts it to the verifier's agreement key.
//! Verification walks DECRYPTED → CHALLENGE_OK → NOT_REVOKED → PROOF_OK,
//! short-circuiting on the first failed transition; a rejected presentation
//! cannot be retried, the holder must build a new one.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
	challenge::{ChallengeError, ChallengeManager},
	did::DidDoc,
	jose::{self, EncryptedBox, JoseError},
	keys::{KeyError, KeyProvider},
	merkle,
	now_ts,
	statuslist::{StatusListError, StatusListManager},
	store::{CredentialRecord, CredentialStatus},
};

const PRESENTATION_TTL_SECS: i64 = 300;

#[derive(Debug, Serialize, Deserialize)]
pub struct PresentationPayload {
	pub aud: String,
	pub iat: i64,
	pub exp: i64,
	pub nonce: String,
	pub cred: PresentedCredential,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PresentedCredential {
	pub id: String,
	pub issuer: String,
	pub subject: String,
	pub schema: String,
	pub status: CredentialStatus,
	pub root: String,
	pub order: Vec<String>,
	pub proofs: Vec<Vec<merkle::OpeningStep>>,
	pub revealed: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
	#[error("no agreement key available for {0}")]
	MissingAgreementKey(String),
	#[error(transparent)]
	Key(KeyError),
	#[error(transparent)]
	Jose(#[from] JoseError),
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
	#[error("presentation decryption failed")]
	Decryption,
	#[error("invalid presentation payload")]
	Payload,
	#[error("challenge invalid: {0}")]
	Challenge(ChallengeError),
	#[error("credential revoked")]
	Revoked,
	#[error("merkle proof failed")]
	ProofFailed,
	#[error(transparent)]
	Key(#[from] KeyError),
	#[error(transparent)]
	Status(#[from] StatusListError),
}

/// Builds the encrypted presentation box for `credential`, revealing the
/// intersection of `reveal_fields` with the credential's attributes.
pub async fn build(
	keys: &KeyProvider,
	challenges: &ChallengeManager,
	verifier_doc: &DidDoc,
	credential: &CredentialRecord,
	reveal_fields: &[String],
) -> Result<EncryptedBox, BuildError> {
	let revealed: Map<String, Value> = reveal_fields
		.iter()
		.filter_map(|field| {
			credential
				.attrs
				.get(field)
				.map(|value| (field.clone(), value.clone()))
		})
		.collect();

	let nonce = challenges.issue(&verifier_doc.did).await.nonce;
	let iat = now_ts();
	let payload = PresentationPayload {
		aud: verifier_doc.did.clone(),
		iat,
		exp: iat + PRESENTATION_TTL_SECS,
		nonce,
		cred: PresentedCredential {
			id: credential.id.clone(),
			issuer: credential.issuer.clone(),
			subject: credential.subject.clone(),
			schema: credential.schema.clone(),
			status: credential.status.clone(),
			root: credential.merkle.root.clone(),
			order: credential.merkle.order.clone(),
			proofs: credential.merkle.paths.clone(),
			revealed,
		},
	};
	let plaintext = serde_json::to_vec(&payload).expect("payload always serializes");

	let kid = format!("{}#agree", verifier_doc.did);
	let keypair = keys.load(&kid).map_err(|err| match err {
		KeyError::NotFound(_) => BuildError::MissingAgreementKey(verifier_doc.did.clone()),
		other => BuildError::Key(other),
	})?;

	Ok(jose::encrypt_to(&keypair.public(), &plaintext)?)
}

/// Decrypts and verifies a presentation for `verifier_did`, returning the
/// disclosed attributes.
///
/// A missing agreement key is recreated on the spot; that only rescues a
/// lost key directory, since presentations built against the old public key
/// will no longer decrypt.
pub async fn verify_and_extract(
	keys: &KeyProvider,
	challenges: &ChallengeManager,
	statuslists: &StatusListManager,
	verifier_did: &str,
	sealed: &EncryptedBox,
) -> Result<Map<String, Value>, VerifyError> {
	let keypair = keys.load_or_generate(&format!("{verifier_did}#agree"))?;

	let plaintext =
		jose::decrypt_box(keypair.secret(), sealed).map_err(|_| VerifyError::Decryption)?;
	let payload: PresentationPayload =
		serde_json::from_slice(&plaintext).map_err(|_| VerifyError::Payload)?;

	challenges
		.validate(&payload.nonce, &payload.aud)
		.await
		.map_err(VerifyError::Challenge)?;

	let status = &payload.cred.status;
	if statuslists.is_revoked(&status.list_id, status.index).await? {
		return Err(VerifyError::Revoked);
	}

	if !merkle::verify_proofs(
		&payload.cred.root,
		&payload.cred.order,
		&payload.cred.proofs,
		&payload.cred.revealed,
	) {
		return Err(VerifyError::ProofFailed);
	}

	Ok(payload.cred.revealed)
}
