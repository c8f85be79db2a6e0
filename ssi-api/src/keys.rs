//! Filesystem-backed provider for per-DID P-256 keypairs.
//!
//! Every key id (`<did>#sign`, `<did>#agree`) maps to one file under the key
//! directory, named `<kid>.json` and containing the full private JWK. Writes
//! use create-if-absent semantics: when two writers race, the first file wins
//! and the loser discards its freshly generated key.

use std::{
	fmt, fs,
	io::{self, Write as _},
	path::{Path, PathBuf},
};

use p256::elliptic_curve::sec1::ToEncodedPoint as _;
use rand::rngs::OsRng;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
	#[error("no key material stored for {0}")]
	NotFound(String),
	#[error("malformed key file for {0}")]
	Malformed(String),
	#[error(transparent)]
	Io(#[from] io::Error),
}

/// A P-256 keypair. The private scalar never appears in debug output.
#[derive(Clone)]
pub struct Keypair {
	secret: p256::SecretKey,
}

impl Keypair {
	pub fn secret(&self) -> &p256::SecretKey {
		&self.secret
	}

	pub fn public(&self) -> p256::PublicKey {
		self.secret.public_key()
	}

	pub fn signing_key(&self) -> p256::ecdsa::SigningKey {
		p256::ecdsa::SigningKey::from(&self.secret)
	}

	pub fn verifying_key(&self) -> p256::ecdsa::VerifyingKey {
		p256::ecdsa::VerifyingKey::from(&self.signing_key())
	}

	/// The base64url-encoded X coordinate of the public key, used as the
	/// opaque key reference inside DID documents.
	pub fn public_x_b64(&self) -> String {
		let point = self.public().to_encoded_point(false);
		crate::b64url(point.x().expect("uncompressed point has an x coordinate"))
	}
}

impl fmt::Debug for Keypair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Keypair").finish_non_exhaustive()
	}
}

#[derive(Debug)]
pub struct KeyProvider {
	dir: PathBuf,
}

impl KeyProvider {
	pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
		let dir = dir.as_ref().to_owned();
		fs::create_dir_all(&dir)?;
		Ok(Self { dir })
	}

	pub fn generate(&self) -> Keypair {
		Keypair {
			secret: p256::SecretKey::random(&mut OsRng),
		}
	}

	fn path_for(&self, kid: &str) -> PathBuf {
		self.dir.join(format!("{kid}.json"))
	}

	/// Persists `keypair` under `kid` unless a key already exists there.
	/// An existing file always wins.
	pub fn save(&self, kid: &str, keypair: &Keypair) -> Result<(), KeyError> {
		let jwk = keypair.secret.to_jwk_string();
		match fs::OpenOptions::new()
			.write(true)
			.create_new(true)
			.open(self.path_for(kid))
		{
			Ok(mut file) => {
				file.write_all(jwk.as_bytes())?;
				Ok(())
			}
			Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
			Err(err) => Err(err.into()),
		}
	}

	pub fn load(&self, kid: &str) -> Result<Keypair, KeyError> {
		let raw = match fs::read_to_string(self.path_for(kid)) {
			Ok(raw) => raw,
			Err(err) if err.kind() == io::ErrorKind::NotFound => {
				return Err(KeyError::NotFound(kid.to_owned()));
			}
			Err(err) => return Err(err.into()),
		};
		let secret = p256::SecretKey::from_jwk_str(&raw)
			.map_err(|_| KeyError::Malformed(kid.to_owned()))?;
		Ok(Keypair { secret })
	}

	/// Loads the key for `kid`, generating and persisting one when none is
	/// stored yet. A concurrent writer winning the race is fine: we reload
	/// whatever landed on disk.
	pub fn load_or_generate(&self, kid: &str) -> Result<Keypair, KeyError> {
		match self.load(kid) {
			Ok(keypair) => Ok(keypair),
			Err(KeyError::NotFound(_)) => {
				let keypair = self.generate();
				self.save(kid, &keypair)?;
				self.load(kid)
			}
			Err(err) => Err(err),
		}
	}

	/// Deletes every stored key. Administrative reset only.
	pub fn wipe(&self) -> Result<(), KeyError> {
		for entry in fs::read_dir(&self.dir)? {
			let path = entry?.path();
			if path.extension().is_some_and(|ext| ext == "json") {
				match fs::remove_file(&path) {
					Ok(()) => {}
					Err(err) if err.kind() == io::ErrorKind::NotFound => {}
					Err(err) => return Err(err.into()),
				}
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn temp_provider() -> KeyProvider {
		let dir = std::env::temp_dir()
			.join(format!("ssi-api-keys-{:016x}", rand::random::<u64>()));
		KeyProvider::new(dir).expect("temp key dir should be creatable")
	}

	#[test]
	fn test_save_then_load_round_trips() {
		let provider = temp_provider();
		let keypair = provider.generate();
		provider.save("did:key:ztest#sign", &keypair).unwrap();

		let loaded = provider.load("did:key:ztest#sign").unwrap();
		assert_eq!(loaded.secret().to_bytes(), keypair.secret().to_bytes());
	}

	#[test]
	fn test_load_missing_key_is_not_found() {
		let provider = temp_provider();
		let err = provider.load("did:key:zmissing#agree").unwrap_err();
		assert!(matches!(err, KeyError::NotFound(_)));
	}

	#[test]
	fn test_existing_file_wins_over_second_save() {
		let provider = temp_provider();
		let first = provider.generate();
		let second = provider.generate();
		provider.save("kid", &first).unwrap();
		provider.save("kid", &second).unwrap();

		let loaded = provider.load("kid").unwrap();
		assert_eq!(loaded.secret().to_bytes(), first.secret().to_bytes());
	}

	#[test]
	fn test_load_or_generate_is_stable() {
		let provider = temp_provider();
		let created = provider.load_or_generate("did:key:zlazy#agree").unwrap();
		let reloaded = provider.load_or_generate("did:key:zlazy#agree").unwrap();
		assert_eq!(created.secret().to_bytes(), reloaded.secret().to_bytes());
	}

	#[test]
	fn test_wipe_removes_all_keys() {
		let provider = temp_provider();
		provider.save("a#sign", &provider.generate()).unwrap();
		provider.save("b#agree", &provider.generate()).unwrap();
		provider.wipe().unwrap();

		assert!(matches!(
			provider.load("a#sign"),
			Err(KeyError::NotFound(_))
		));
		assert!(matches!(
			provider.load("b#agree"),
			Err(KeyError::NotFound(_))
		));
	}

	#[test]
	fn test_debug_does_not_leak_private_material() {
		let provider = temp_provider();
		let keypair = provider.generate();
		let debugged = format!("{keypair:?}");
		assert!(!debugged.contains(&keypair.public_x_b64()));
	}
}
