//! Compact JOSE envelopes over P-256: ES256 signatures and ECDH-ES + A256GCM
//! encryption.
//!
//! Key agreement is direct (the derived key encrypts the content), so the
//! encrypted-key segment of the compact serialization is always empty and the
//! ephemeral public key travels in the protected header. The content key is
//! derived with the single-round SHA-256 Concat KDF from RFC 7518 §4.6 with
//! empty party infos.

use aes_gcm::{
	Aes256Gcm, Nonce,
	aead::{Aead, KeyInit, Payload},
};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::{
	ecdsa::{
		Signature,
		signature::{Signer as _, Verifier as _},
	},
	elliptic_curve::JwkEcKey,
};
use rand::{RngCore as _, rngs::OsRng};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};

use crate::keys::{KeyError, KeyProvider};

pub const JWE_ALG: &str = "ECDH-ES";
pub const JWE_ENC: &str = "A256GCM";
pub const JWS_ALG: &str = "ES256";

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// The five JWE compact segments, transported as a JSON object.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct EncryptedBox {
	pub protected: String,
	pub eph: String,
	pub nonce: String,
	pub ct: String,
	pub tag: String,
}

#[derive(Debug, thiserror::Error)]
pub enum JoseError {
	#[error("malformed envelope")]
	Malformed,
	#[error("unsupported algorithm")]
	UnsupportedAlgorithm,
	#[error("encryption failed")]
	EncryptionFailed,
	#[error("decryption failed")]
	DecryptionFailed,
	#[error("signature invalid")]
	SignatureInvalid,
	#[error(transparent)]
	Key(#[from] KeyError),
}

#[derive(Serialize, Deserialize)]
struct JweProtected {
	alg: String,
	enc: String,
	epk: JwkEcKey,
}

#[derive(Serialize, Deserialize)]
struct JwsProtected {
	alg: String,
	kid: String,
}

fn b64url_decode(segment: &str) -> Result<Vec<u8>, JoseError> {
	URL_SAFE_NO_PAD
		.decode(segment)
		.map_err(|_| JoseError::Malformed)
}

/// Single-round Concat KDF (RFC 7518 §4.6) for a 256-bit content key.
fn concat_kdf(z: &[u8], enc: &str) -> [u8; 32] {
	let mut hasher = Sha256::new();
	hasher.update(1u32.to_be_bytes());
	hasher.update(z);
	hasher.update((enc.len() as u32).to_be_bytes());
	hasher.update(enc.as_bytes());
	hasher.update(0u32.to_be_bytes()); // apu
	hasher.update(0u32.to_be_bytes()); // apv
	hasher.update(256u32.to_be_bytes()); // keydatalen
	hasher.finalize().into()
}

/// Encrypts `plaintext` to `recipient`'s agreement key.
pub fn encrypt_to(
	recipient: &p256::PublicKey,
	plaintext: &[u8],
) -> Result<EncryptedBox, JoseError> {
	let ephemeral = p256::SecretKey::random(&mut OsRng);
	let shared = p256::ecdh::diffie_hellman(
		ephemeral.to_nonzero_scalar(),
		recipient.as_affine(),
	);
	let kek = concat_kdf(shared.raw_secret_bytes().as_slice(), JWE_ENC);

	let header = JweProtected {
		alg: JWE_ALG.to_owned(),
		enc: JWE_ENC.to_owned(),
		epk: ephemeral.public_key().to_jwk(),
	};
	let protected =
		crate::b64url(serde_json::to_vec(&header).expect("header always serializes"));

	let mut iv = [0u8; IV_LEN];
	OsRng.fill_bytes(&mut iv);

	let cipher = Aes256Gcm::new_from_slice(&kek).expect("derived key is 32 bytes");
	let sealed = cipher
		.encrypt(
			Nonce::from_slice(&iv),
			Payload {
				msg: plaintext,
				aad: protected.as_bytes(),
			},
		)
		.map_err(|_| JoseError::EncryptionFailed)?;
	let (ct, tag) = sealed.split_at(sealed.len() - TAG_LEN);

	Ok(EncryptedBox {
		protected,
		// direct key agreement has no encrypted key segment
		eph: String::new(),
		nonce: crate::b64url(iv),
		ct: crate::b64url(ct),
		tag: crate::b64url(tag),
	})
}

/// Decrypts an [`EncryptedBox`] with the recipient's private agreement key.
pub fn decrypt_box(
	secret: &p256::SecretKey,
	envelope: &EncryptedBox,
) -> Result<Vec<u8>, JoseError> {
	let header_bytes = b64url_decode(&envelope.protected)?;
	let header: JweProtected =
		serde_json::from_slice(&header_bytes).map_err(|_| JoseError::Malformed)?;
	if header.alg != JWE_ALG || header.enc != JWE_ENC {
		return Err(JoseError::UnsupportedAlgorithm);
	}

	let ephemeral =
		p256::PublicKey::from_jwk(&header.epk).map_err(|_| JoseError::Malformed)?;
	let shared =
		p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
	let kek = concat_kdf(shared.raw_secret_bytes().as_slice(), JWE_ENC);

	let iv = b64url_decode(&envelope.nonce)?;
	if iv.len() != IV_LEN {
		return Err(JoseError::Malformed);
	}
	let mut sealed = b64url_decode(&envelope.ct)?;
	sealed.extend(b64url_decode(&envelope.tag)?);

	let cipher = Aes256Gcm::new_from_slice(&kek).expect("derived key is 32 bytes");
	cipher
		.decrypt(
			Nonce::from_slice(&iv),
			Payload {
				msg: &sealed,
				aad: envelope.protected.as_bytes(),
			},
		)
		.map_err(|_| JoseError::DecryptionFailed)
}

/// Signs `claims` as a compact ES256 JWS with the key stored under `kid`,
/// generating the key on first use.
pub fn sign_jws<T: Serialize>(
	keys: &KeyProvider,
	kid: &str,
	claims: &T,
) -> Result<String, JoseError> {
	let keypair = keys.load_or_generate(kid)?;
	let header = JwsProtected {
		alg: JWS_ALG.to_owned(),
		kid: kid.to_owned(),
	};
	let signing_input = format!(
		"{}.{}",
		crate::b64url(serde_json::to_vec(&header).expect("header always serializes")),
		crate::b64url(serde_json::to_vec(claims).map_err(|_| JoseError::Malformed)?),
	);
	let signature: Signature = keypair.signing_key().sign(signing_input.as_bytes());
	Ok(format!("{signing_input}.{}", crate::b64url(signature.to_bytes())))
}

/// Verifies a compact ES256 JWS and returns the decoded payload, typed.
pub fn verify_jws<T: DeserializeOwned>(
	token: &str,
	verifying: &p256::ecdsa::VerifyingKey,
) -> Result<T, JoseError> {
	let mut segments = token.split('.');
	let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) = (
		segments.next(),
		segments.next(),
		segments.next(),
		segments.next(),
	) else {
		return Err(JoseError::Malformed);
	};

	let header: JwsProtected = serde_json::from_slice(&b64url_decode(header_b64)?)
		.map_err(|_| JoseError::Malformed)?;
	if header.alg != JWS_ALG {
		return Err(JoseError::UnsupportedAlgorithm);
	}

	let signature = Signature::from_slice(&b64url_decode(signature_b64)?)
		.map_err(|_| JoseError::SignatureInvalid)?;
	let signing_input = format!("{header_b64}.{payload_b64}");
	verifying
		.verify(signing_input.as_bytes(), &signature)
		.map_err(|_| JoseError::SignatureInvalid)?;

	serde_json::from_slice(&b64url_decode(payload_b64)?).map_err(|_| JoseError::Malformed)
}

#[cfg(test)]
mod test {
	use serde_json::{Value, json};

	use super::*;

	fn temp_provider() -> KeyProvider {
		let dir = std::env::temp_dir()
			.join(format!("ssi-api-jose-{:016x}", rand::random::<u64>()));
		KeyProvider::new(dir).expect("temp key dir should be creatable")
	}

	#[test]
	fn test_jwe_round_trip() {
		let provider = temp_provider();
		let recipient = provider.generate();
		let plaintext = br#"{"hello":"world"}"#;

		let envelope = encrypt_to(&recipient.public(), plaintext).unwrap();
		assert!(envelope.eph.is_empty());

		let decrypted = decrypt_box(recipient.secret(), &envelope).unwrap();
		assert_eq!(decrypted, plaintext);
	}

	#[test]
	fn test_jwe_rejects_wrong_recipient() {
		let provider = temp_provider();
		let recipient = provider.generate();
		let interloper = provider.generate();

		let envelope = encrypt_to(&recipient.public(), b"secret").unwrap();
		let err = decrypt_box(interloper.secret(), &envelope).unwrap_err();
		assert!(matches!(err, JoseError::DecryptionFailed));
	}

	#[test]
	fn test_jwe_rejects_tampered_ciphertext() {
		let provider = temp_provider();
		let recipient = provider.generate();

		let mut envelope = encrypt_to(&recipient.public(), b"secret").unwrap();
		let mut ct = URL_SAFE_NO_PAD.decode(&envelope.ct).unwrap();
		ct[0] ^= 0x01;
		envelope.ct = crate::b64url(ct);

		let err = decrypt_box(recipient.secret(), &envelope).unwrap_err();
		assert!(matches!(err, JoseError::DecryptionFailed));
	}

	#[test]
	fn test_jwe_binds_the_protected_header() {
		let provider = temp_provider();
		let recipient = provider.generate();

		let envelope = encrypt_to(&recipient.public(), b"secret").unwrap();
		// re-encode the header with extra whitespace: same JSON, different aad
		let reencoded = {
			let mut padded = URL_SAFE_NO_PAD.decode(&envelope.protected).unwrap();
			padded.push(b' ');
			crate::b64url(padded)
		};
		let tampered = EncryptedBox {
			protected: reencoded,
			..envelope
		};

		let err = decrypt_box(recipient.secret(), &tampered).unwrap_err();
		assert!(matches!(
			err,
			JoseError::DecryptionFailed | JoseError::Malformed
		));
	}

	#[test]
	fn test_jws_round_trip() {
		let provider = temp_provider();
		let claims = json!({"sub": "did:key:zexample", "n": 7});

		let token = sign_jws(&provider, "did:key:zexample#sign", &claims).unwrap();
		let keypair = provider.load("did:key:zexample#sign").unwrap();

		let decoded: Value = verify_jws(&token, &keypair.verifying_key()).unwrap();
		assert_eq!(decoded, claims);
	}

	#[test]
	fn test_jws_rejects_tampered_payload() {
		let provider = temp_provider();
		let token = sign_jws(&provider, "kid#sign", &json!({"ok": true})).unwrap();
		let keypair = provider.load("kid#sign").unwrap();

		let mut parts: Vec<&str> = token.split('.').collect();
		let forged = crate::b64url(br#"{"ok":false}"#);
		parts[1] = &forged;
		let forged_token = parts.join(".");

		let err =
			verify_jws::<Value>(&forged_token, &keypair.verifying_key()).unwrap_err();
		assert!(matches!(err, JoseError::SignatureInvalid));
	}

	#[test]
	fn test_jws_rejects_wrong_key() {
		let provider = temp_provider();
		let token = sign_jws(&provider, "kid#sign", &json!({"ok": true})).unwrap();
		let other = provider.generate();

		let err = verify_jws::<Value>(&token, &other.verifying_key()).unwrap_err();
		assert!(matches!(err, JoseError::SignatureInvalid));
	}
}
