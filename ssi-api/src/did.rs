use p256::elliptic_curve::sec1::ToEncodedPoint as _;
use serde::{Deserialize, Serialize};

use crate::keys::{KeyError, KeyProvider};

pub const DID_PREFIX: &str = "did:key:z";
const FINGERPRINT_LEN: usize = 46;
const SERVICE_SUFFIX_LEN: usize = 8;

/// Published object associating a DID with its public keys and inbox.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DidDoc {
	pub did: String,
	pub public_sign: String,
	pub public_agree: String,
	pub service_endpoint: String,
}

/// Derives the `did:key` identifier for a signing public key.
///
/// The fingerprint is the base64url encoding of the raw `X || Y` coordinates,
/// truncated to 46 characters. This keeps the `did:key:z` shape but is not
/// multibase/multicodec: the identifier is internal and will not resolve
/// against standard `did:key` tooling.
pub fn did_from_public_key(public: &p256::PublicKey) -> String {
	let point = public.to_encoded_point(false);
	let mut raw = Vec::with_capacity(64);
	raw.extend_from_slice(point.x().expect("uncompressed point has an x coordinate"));
	raw.extend_from_slice(point.y().expect("uncompressed point has a y coordinate"));
	let fingerprint = crate::b64url(&raw);
	format!("{DID_PREFIX}{}", &fingerprint[..FINGERPRINT_LEN])
}

/// Creates and persists the `#sign` and `#agree` keypairs for a fresh DID and
/// assembles its document.
pub fn generate_did_key(
	keys: &KeyProvider,
	service_prefix: &str,
) -> Result<(String, DidDoc), KeyError> {
	let signing = keys.generate();
	let agreement = keys.generate();
	let did = did_from_public_key(&signing.public());
	keys.save(&format!("{did}#sign"), &signing)?;
	keys.save(&format!("{did}#agree"), &agreement)?;

	let method_id = did.rsplit(':').next().expect("did always has segments");
	let doc = DidDoc {
		did: did.clone(),
		public_sign: signing.public_x_b64(),
		public_agree: agreement.public_x_b64(),
		service_endpoint: format!("{service_prefix}{}", &method_id[..SERVICE_SUFFIX_LEN]),
	};
	Ok((did, doc))
}

#[cfg(test)]
mod test {
	use super::*;

	fn temp_provider() -> KeyProvider {
		let dir = std::env::temp_dir()
			.join(format!("ssi-api-did-{:016x}", rand::random::<u64>()));
		KeyProvider::new(dir).expect("temp key dir should be creatable")
	}

	#[test]
	fn test_did_shape() {
		let provider = temp_provider();
		let did = did_from_public_key(&provider.generate().public());
		assert!(did.starts_with(DID_PREFIX));
		assert_eq!(did.len(), DID_PREFIX.len() + FINGERPRINT_LEN);
		// base64url alphabet only
		assert!(
			did[DID_PREFIX.len()..]
				.chars()
				.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
		);
	}

	#[test]
	fn test_did_is_deterministic_per_key() {
		let provider = temp_provider();
		let a = provider.generate();
		let b = provider.generate();
		assert_eq!(did_from_public_key(&a.public()), did_from_public_key(&a.public()));
		assert_ne!(did_from_public_key(&a.public()), did_from_public_key(&b.public()));
	}

	#[test]
	fn test_generate_did_key_persists_both_roles() {
		let provider = temp_provider();
		let (did, doc) = generate_did_key(&provider, "inbox://").unwrap();

		assert_eq!(doc.did, did);
		assert_ne!(doc.public_sign, doc.public_agree);

		let signing = provider.load(&format!("{did}#sign")).unwrap();
		let agreement = provider.load(&format!("{did}#agree")).unwrap();
		assert_eq!(did_from_public_key(&signing.public()), did);
		assert_eq!(agreement.public_x_b64(), doc.public_agree);
	}

	#[test]
	fn test_service_endpoint_uses_prefix_and_fingerprint() {
		let provider = temp_provider();
		let (did, doc) = generate_did_key(&provider, "mailbox://").unwrap();

		let method_id = did.rsplit(':').next().unwrap();
		assert_eq!(
			doc.service_endpoint,
			format!("mailbox://{}", &method_id[..8])
		);
	}
}
