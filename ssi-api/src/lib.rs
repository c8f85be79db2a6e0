#![forbid(unsafe_code)]
#![deny(clippy::allow_attributes, unsafe_op_in_unsafe_fn)]

pub mod cache;
pub mod challenge;
pub mod config;
pub mod did;
pub mod jose;
pub mod keys;
pub mod merkle;
pub mod presentation;
pub mod statuslist;
pub mod store;
pub mod v1;

use std::{
	future::IntoFuture,
	net::{Ipv6Addr, SocketAddr},
};

use axum::{
	Json,
	extract::State,
	http::{HeaderName, HeaderValue, Method, StatusCode, header},
	response::IntoResponse,
	routing::get,
};
use color_eyre::{Result, eyre::WrapErr as _};
use futures::FutureExt;
use serde_json::json;
use sqlx::sqlite::SqlitePool;
use tokio::net::TcpListener;
use tower_http::{
	cors::{AllowOrigin, Any, CorsLayer},
	trace::TraceLayer,
};
use tracing::{error, info};

pub const MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// A [`SqlitePool`] that has already been migrated.
#[derive(Debug, Clone)]
pub struct MigratedDbPool(SqlitePool);

impl MigratedDbPool {
	pub async fn new(pool: SqlitePool) -> Result<Self> {
		MIGRATOR
			.run(&pool)
			.await
			.wrap_err("failed to run migrations")?;

		Ok(Self(pool))
	}

	pub fn inner(&self) -> &SqlitePool {
		&self.0
	}
}

/// Unix timestamp in seconds.
pub fn now_ts() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.expect("system clock is before the unix epoch")
		.as_secs() as i64
}

pub(crate) fn b64url(data: impl AsRef<[u8]>) -> String {
	use base64::Engine as _;
	base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

#[derive(Debug)]
pub struct RouterConfig {
	pub v1: crate::v1::RouterConfig,
	/// Allowed CORS origins; empty means any origin.
	pub cors_origins: Vec<String>,
}

impl RouterConfig {
	pub async fn build(self) -> Result<axum::Router<()>> {
		let cors = cors_layer(&self.cors_origins)?;
		let health_state = self.v1.db_pool.clone();

		let v1 = self
			.v1
			.build()
			.await
			.wrap_err("failed to build v1 router")?;

		Ok(axum::Router::new()
			.route("/healthz", get(healthz))
			.route("/readyz", get(readyz))
			.with_state(health_state)
			.nest("/v1", v1)
			.layer(TraceLayer::new_for_http())
			.layer(cors))
	}
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
	if origins.is_empty() {
		return Ok(CorsLayer::new()
			.allow_origin(Any)
			.allow_methods(Any)
			.allow_headers(Any));
	}
	let parsed = origins
		.iter()
		.map(|origin| {
			origin
				.parse::<HeaderValue>()
				.wrap_err_with(|| format!("invalid CORS origin {origin:?}"))
		})
		.collect::<Result<Vec<_>>>()?;
	Ok(CorsLayer::new()
		.allow_origin(AllowOrigin::list(parsed))
		.allow_methods([Method::GET, Method::POST])
		.allow_headers([
			header::CONTENT_TYPE,
			HeaderName::from_static("x-admin-token"),
			HeaderName::from_static("idempotency-key"),
		])
		.allow_credentials(true))
}

#[derive(thiserror::Error, Debug)]
enum HealthErr {
	#[error(transparent)]
	Internal(#[from] color_eyre::Report),
}

impl IntoResponse for HealthErr {
	fn into_response(self) -> axum::response::Response {
		error!("{self:?}");
		(
			StatusCode::INTERNAL_SERVER_ERROR,
			Json(json!({ "detail": self.to_string() })),
		)
			.into_response()
	}
}

async fn healthz(
	State(db_pool): State<MigratedDbPool>,
) -> Result<Json<serde_json::Value>, HealthErr> {
	sqlx::query("SELECT 1")
		.execute(&db_pool.0)
		.await
		.wrap_err("database liveness probe failed")?;
	Ok(Json(json!({ "ok": true, "ts": now_ts() })))
}

async fn readyz() -> Json<serde_json::Value> {
	Json(json!({ "ok": true }))
}

/// Runs a HTTP server on a tokio task.
pub async fn spawn_http_server(
	port: u16,
	router: axum::Router,
) -> Result<(
	tokio::task::JoinHandle<Result<()>>,
	tokio::sync::oneshot::Sender<()>,
)> {
	let listener = bind_listener(port).await?;
	let local_addr = listener.local_addr().unwrap();
	info!("HTTP server listening on {local_addr}");

	let (tx, rx) = tokio::sync::oneshot::channel();
	let task_handle = tokio::spawn(async move {
		let serve_fut = axum::serve(listener, router)
			.into_future()
			.map(|r| r.wrap_err("HTTP server crashed"));
		tokio::select! {
			result = serve_fut => result,
			_ = rx => {
				info!("killing HTTP server due to shutdown signal");
				Ok(())
			}
		}
	});

	Ok((task_handle, tx))
}

async fn bind_listener(port: u16) -> Result<TcpListener> {
	TcpListener::bind(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port))
		.await
		.wrap_err_with(|| format!("failed to listen to tcp on port {}", port))
}
