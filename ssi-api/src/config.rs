//! Runtime configuration, sourced from the environment.
//!
//! Every field doubles as a CLI flag so a deployment can override the
//! environment ad hoc; see [`Config`].

use std::{fmt, path::PathBuf, str::FromStr};

use crate::jose;

/// Deployment environment. Anything other than [`Env::Dev`] requires an admin
/// token to be configured.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum Env {
	#[default]
	Dev,
	Stage,
	Prod,
}

#[derive(thiserror::Error, Debug)]
#[error("expected one of `dev`, `stage`, `prod`")]
pub struct EnvParseErr;

impl FromStr for Env {
	type Err = EnvParseErr;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"dev" => Ok(Env::Dev),
			"stage" => Ok(Env::Stage),
			"prod" => Ok(Env::Prod),
			_ => Err(EnvParseErr),
		}
	}
}

impl fmt::Display for Env {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Env::Dev => "dev",
			Env::Stage => "stage",
			Env::Prod => "prod",
		})
	}
}

#[derive(clap::Parser, Debug, Clone)]
#[command(name = "ssi-api", about = "Self-sovereign identity credential service")]
pub struct Config {
	/// Database connection string.
	#[arg(long, env = "DB_DSN", default_value = "sqlite://ssi.db?mode=rwc")]
	pub db_dsn: String,

	#[arg(long, env = "ENV", default_value_t = Env::Dev)]
	pub env: Env,

	#[arg(long, env = "PORT", default_value_t = 8080)]
	pub port: u16,

	/// Directory holding one private JWK file per key id.
	#[arg(long, env = "KEY_DIR", default_value = "./keys")]
	pub key_dir: PathBuf,

	/// When set, admin routes require a matching `X-Admin-Token` header.
	#[arg(long, env = "ISSUER_ADMIN_TOKEN")]
	pub admin_token: Option<String>,

	#[arg(long, env = "JWK_CURVE", default_value = "P-256")]
	pub jwk_curve: String,

	#[arg(long, env = "JWE_ALG", default_value = jose::JWE_ALG)]
	pub jwe_alg: String,

	#[arg(long, env = "JWE_ENC", default_value = jose::JWE_ENC)]
	pub jwe_enc: String,

	/// Status list size in bytes; a list holds eight credential indices per
	/// byte.
	#[arg(long, env = "STATUSLIST_CHUNK", default_value_t = 16384)]
	pub statuslist_chunk: usize,

	/// Prefix for the service endpoint published in DID documents.
	#[arg(long, env = "SERVICE_PREFIX", default_value = "inbox://")]
	pub service_prefix: String,

	/// Comma-separated allowed CORS origins; empty allows any origin.
	#[arg(long, env = "UI_CORS_ORIGINS", default_value = "")]
	pub ui_cors_origins: String,

	/// Accepted for deployment parity with external caches; the expiring
	/// store runs in-process and this value is never dialed.
	#[arg(long, env = "REDIS_URL")]
	pub redis_url: Option<String>,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ValidationError {
	#[error("unsupported JWK curve {0:?}, only P-256 is available")]
	Curve(String),
	#[error("unsupported JWE algorithm {0:?}, only ECDH-ES is available")]
	JweAlg(String),
	#[error("unsupported JWE encryption {0:?}, only A256GCM is available")]
	JweEnc(String),
	#[error("STATUSLIST_CHUNK must be positive")]
	ChunkZero,
	#[error("ISSUER_ADMIN_TOKEN must be set when ENV is not dev")]
	AdminTokenMissing,
}

impl Config {
	/// Validates the parsed configuration.
	pub fn validate(&self) -> Result<(), ValidationError> {
		if self.jwk_curve != "P-256" {
			return Err(ValidationError::Curve(self.jwk_curve.clone()));
		}
		if self.jwe_alg != jose::JWE_ALG {
			return Err(ValidationError::JweAlg(self.jwe_alg.clone()));
		}
		if self.jwe_enc != jose::JWE_ENC {
			return Err(ValidationError::JweEnc(self.jwe_enc.clone()));
		}
		if self.statuslist_chunk == 0 {
			return Err(ValidationError::ChunkZero);
		}
		if self.env != Env::Dev && self.admin_token.is_none() {
			return Err(ValidationError::AdminTokenMissing);
		}
		Ok(())
	}

	pub fn cors_origins(&self) -> Vec<String> {
		self.ui_cors_origins
			.split(',')
			.map(str::trim)
			.filter(|origin| !origin.is_empty())
			.map(str::to_owned)
			.collect()
	}
}

#[cfg(test)]
mod test {
	use clap::Parser as _;

	use super::*;

	fn parse(args: &[&str]) -> Config {
		let argv = std::iter::once("ssi-api").chain(args.iter().copied());
		Config::try_parse_from(argv).expect("config should parse")
	}

	#[test]
	fn test_defaults_pass_validation() {
		let config = parse(&[]);
		assert_eq!(config.validate(), Ok(()));
		assert_eq!(config.env, Env::Dev);
		assert_eq!(config.port, 8080);
		assert_eq!(config.jwk_curve, "P-256");
		assert_eq!(config.service_prefix, "inbox://");
		assert!(config.cors_origins().is_empty());
	}

	#[test]
	fn test_unsupported_curve_is_rejected() {
		let config = parse(&["--jwk-curve", "P-384"]);
		assert_eq!(
			config.validate(),
			Err(ValidationError::Curve("P-384".to_owned()))
		);
	}

	#[test]
	fn test_unsupported_jwe_parameters_are_rejected() {
		let config = parse(&["--jwe-alg", "ECDH-ES+A128KW"]);
		assert!(matches!(config.validate(), Err(ValidationError::JweAlg(_))));

		let config = parse(&["--jwe-enc", "A128GCM"]);
		assert!(matches!(config.validate(), Err(ValidationError::JweEnc(_))));
	}

	#[test]
	fn test_non_dev_env_requires_admin_token() {
		let config = parse(&["--env", "prod"]);
		assert_eq!(config.validate(), Err(ValidationError::AdminTokenMissing));

		let config = parse(&["--env", "prod", "--admin-token", "sekrit"]);
		assert_eq!(config.validate(), Ok(()));
	}

	#[test]
	fn test_cors_origins_are_split_and_trimmed() {
		let config = parse(&[
			"--ui-cors-origins",
			"https://wallet.example.com, https://admin.example.com ,",
		]);
		assert_eq!(
			config.cors_origins(),
			vec![
				"https://wallet.example.com".to_owned(),
				"https://admin.example.com".to_owned(),
			]
		);
	}
}
