use std::{str::FromStr, sync::Arc};

use clap::Parser as _;
use color_eyre::eyre::{Context, Result};
use futures::FutureExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use ssi_api::{MigratedDbPool, cache::InMemoryStore, config::Config, keys::KeyProvider};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;
	tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or("info".into()))
		.with(tracing_subscriber::fmt::layer())
		.init();

	let cfg = Config::parse();
	cfg.validate().wrap_err("configuration was invalid")?;
	if let Some(ref url) = cfg.redis_url {
		warn!(%url, "REDIS_URL is set but the expiring store runs in-process; ignoring it");
	}

	let db_pool = {
		let connect_opts = SqliteConnectOptions::from_str(&cfg.db_dsn)
			.wrap_err_with(|| format!("failed to parse DB_DSN {:?}", cfg.db_dsn))?
			.create_if_missing(true);
		let pool = SqlitePoolOptions::new()
			.connect_with(connect_opts)
			.await
			.wrap_err_with(|| format!("failed to connect to database {:?}", cfg.db_dsn))?;
		MigratedDbPool::new(pool)
			.await
			.wrap_err("failed to migrate db pool")?
	};

	let keys = KeyProvider::new(&cfg.key_dir).wrap_err_with(|| {
		format!("failed to prepare key directory {}", cfg.key_dir.display())
	})?;

	let router = ssi_api::RouterConfig {
		cors_origins: cfg.cors_origins(),
		v1: ssi_api::v1::RouterConfig {
			db_pool,
			keys: Arc::new(keys),
			cache: Arc::new(InMemoryStore::default()),
			admin_token: cfg.admin_token.clone(),
			service_prefix: cfg.service_prefix.clone(),
			statuslist_chunk: cfg.statuslist_chunk,
		},
	}
	.build()
	.await
	.wrap_err("failed to build router")?;

	let (server_handle, _kill_signal) = ssi_api::spawn_http_server(cfg.port, router)
		.await
		.wrap_err("failed to spawn http server")?;

	let server_fut = server_handle.map(|r| {
		r.wrap_err("HTTP server panicked")?
			.wrap_err("HTTP server exited abnormally")
	});
	let kill_fut = tokio::signal::ctrl_c().map(|r| {
		info!("detected ctrl-c, shutting down...");
		r.wrap_err("error getting ctrl-c signal")
	});

	tokio::select! {
		result = kill_fut => result,
		result = server_fut => result,
	}
}
