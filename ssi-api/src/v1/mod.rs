//! V1 of the API: the credential lifecycle between issuers, holders and
//! verifiers.
//!
//! # Terminology
//! * Issuer: signs credentials about a subject and controls their revocation
//!   status list.
//! * Holder: the credential subject; builds selective-disclosure
//!   presentations.
//! * Verifier: receives presentations encrypted to its agreement key and
//!   checks nonce, revocation and disclosure proofs.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use axum::{
	Json, Router,
	extract::{Path, Query, State},
	http::{HeaderMap, StatusCode},
	response::IntoResponse,
	routing::{get, post},
};
use color_eyre::eyre::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::error;

use crate::{
	MigratedDbPool,
	cache::ExpiringStore,
	challenge::{Challenge, ChallengeManager},
	did::{self, DidDoc},
	jose::{self, EncryptedBox},
	keys::KeyProvider,
	presentation::{self, BuildError, VerifyError},
	statuslist::{StatusListDoc, StatusListError, StatusListManager},
	store::{self, CredentialRecord, PartyRole},
};

const DEFAULT_OFFER_TTL_SECS: i64 = 600;
const MAX_OFFER_TTL_SECS: i64 = 86_400;

#[derive(Debug, Clone)]
struct RouterState {
	db_pool: MigratedDbPool,
	keys: Arc<KeyProvider>,
	cache: Arc<dyn ExpiringStore>,
	challenges: ChallengeManager,
	statuslists: Arc<StatusListManager>,
	admin_token: Option<String>,
	service_prefix: String,
}

/// Configuration for the V1 api's router.
#[derive(Debug)]
pub struct RouterConfig {
	pub db_pool: MigratedDbPool,
	pub keys: Arc<KeyProvider>,
	pub cache: Arc<dyn ExpiringStore>,
	/// When set, admin routes require a matching `X-Admin-Token` header.
	pub admin_token: Option<String>,
	pub service_prefix: String,
	pub statuslist_chunk: usize,
}

impl RouterConfig {
	pub async fn build(self) -> color_eyre::Result<Router> {
		let challenges = ChallengeManager::new(Arc::clone(&self.cache));
		let statuslists = Arc::new(StatusListManager::new(
			self.db_pool.inner().clone(),
			self.statuslist_chunk,
		));
		Ok(Router::new()
			.route("/bootstrap/issuer", post(bootstrap_issuer))
			.route("/bootstrap/holder", post(bootstrap_holder))
			.route("/bootstrap/verifier", post(bootstrap_verifier))
			.route("/issuer/issue", post(issuer_issue))
			.route("/issuer/statuslist/{list_id}", get(issuer_statuslist))
			.route("/issuer/revoke", post(issuer_revoke))
			.route("/issuer/offers", post(issuer_register_offer))
			.route("/wallet/claim", post(wallet_claim))
			.route("/verifier/challenge", post(verifier_challenge))
			.route("/verifier/verify", post(verifier_verify))
			.route("/holder/present", post(holder_present))
			.route("/holder/credentials/{holder_did}", get(holder_credentials))
			.route("/admin/reset", post(admin_reset))
			.with_state(RouterState {
				db_pool: self.db_pool,
				keys: self.keys,
				cache: self.cache,
				challenges,
				statuslists,
				admin_token: self.admin_token,
				service_prefix: self.service_prefix,
			}))
	}
}

fn detail_response(status: StatusCode, message: String) -> axum::response::Response {
	(status, Json(json!({ "detail": message }))).into_response()
}

#[derive(Debug, thiserror::Error)]
#[error("invalid admin token")]
struct InvalidAdminToken;

fn require_admin(state: &RouterState, headers: &HeaderMap) -> Result<(), InvalidAdminToken> {
	let Some(ref expected) = state.admin_token else {
		return Ok(());
	};
	match headers.get("x-admin-token").and_then(|v| v.to_str().ok()) {
		Some(token) if token == expected => Ok(()),
		_ => Err(InvalidAdminToken),
	}
}

// ---- bootstrap ----

#[derive(Debug, Deserialize)]
struct NameQuery {
	name: String,
}

#[derive(Debug, Deserialize)]
struct LabelQuery {
	label: String,
}

#[derive(Debug, Serialize)]
struct BootstrapIssuerResp {
	issuer_did: String,
	did_doc: DidDoc,
}

#[derive(Debug, Serialize)]
struct BootstrapHolderResp {
	holder_did: String,
	did_doc: DidDoc,
}

#[derive(Debug, Serialize)]
struct BootstrapVerifierResp {
	verifier_did: String,
	did_doc: DidDoc,
}

#[derive(Debug, thiserror::Error)]
enum BootstrapErr {
	#[error(transparent)]
	Unauthorized(#[from] InvalidAdminToken),
	#[error(transparent)]
	Internal(#[from] color_eyre::Report),
}

impl IntoResponse for BootstrapErr {
	fn into_response(self) -> axum::response::Response {
		error!("{self:?}");
		let status = match self {
			Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
			Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		detail_response(status, self.to_string())
	}
}

async fn bootstrap_party(
	state: &RouterState,
	role: PartyRole,
	label: &str,
) -> Result<(String, DidDoc), BootstrapErr> {
	let (did, doc) = did::generate_did_key(&state.keys, &state.service_prefix)
		.wrap_err("failed to generate did key material")?;
	store::save_party(state.db_pool.inner(), role, label, &did, &doc)
		.await
		.wrap_err("failed to persist party")?;
	Ok((did, doc))
}

#[tracing::instrument(skip_all)]
async fn bootstrap_issuer(
	State(state): State<RouterState>,
	headers: HeaderMap,
	Query(query): Query<NameQuery>,
) -> Result<Json<BootstrapIssuerResp>, BootstrapErr> {
	require_admin(&state, &headers)?;
	let (issuer_did, did_doc) =
		bootstrap_party(&state, PartyRole::Issuer, &query.name).await?;
	Ok(Json(BootstrapIssuerResp { issuer_did, did_doc }))
}

#[tracing::instrument(skip_all)]
async fn bootstrap_holder(
	State(state): State<RouterState>,
	Query(query): Query<LabelQuery>,
) -> Result<Json<BootstrapHolderResp>, BootstrapErr> {
	let (holder_did, did_doc) =
		bootstrap_party(&state, PartyRole::Holder, &query.label).await?;
	Ok(Json(BootstrapHolderResp { holder_did, did_doc }))
}

#[tracing::instrument(skip_all)]
async fn bootstrap_verifier(
	State(state): State<RouterState>,
	Query(query): Query<LabelQuery>,
) -> Result<Json<BootstrapVerifierResp>, BootstrapErr> {
	let (verifier_did, did_doc) =
		bootstrap_party(&state, PartyRole::Verifier, &query.label).await?;
	Ok(Json(BootstrapVerifierResp { verifier_did, did_doc }))
}

// ---- issuance ----

#[derive(Debug, Deserialize)]
struct IssueRequest {
	subject_did: String,
	attributes: Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct IssueResponse {
	#[serde(flatten)]
	credential: CredentialRecord,
	issuer_signature: String,
}

#[derive(Debug, thiserror::Error)]
enum IssueErr {
	#[error(transparent)]
	Unauthorized(#[from] InvalidAdminToken),
	#[error("Idempotency-Key header required")]
	IdempotencyKeyRequired,
	#[error("no issuer configured")]
	NoIssuer,
	#[error("{0}")]
	ListFull(String),
	#[error(transparent)]
	Internal(#[from] color_eyre::Report),
}

impl IntoResponse for IssueErr {
	fn into_response(self) -> axum::response::Response {
		error!("{self:?}");
		let status = match self {
			Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
			Self::IdempotencyKeyRequired => StatusCode::PRECONDITION_REQUIRED,
			Self::NoIssuer | Self::ListFull(_) => StatusCode::BAD_REQUEST,
			Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		detail_response(status, self.to_string())
	}
}

fn full_list_message(report: &color_eyre::Report) -> Option<String> {
	match report.downcast_ref::<StatusListError>() {
		Some(err @ StatusListError::Full(_)) => Some(err.to_string()),
		_ => None,
	}
}

async fn issue_for(
	state: &RouterState,
	issuer_did: &str,
	subject_did: &str,
	attributes: Map<String, Value>,
) -> Result<IssueResponse, color_eyre::Report> {
	let (list_id, index) = state
		.statuslists
		.allocate(issuer_did)
		.await
		.wrap_err("failed to allocate status list index")?;
	let credential = store::create_credential(
		state.db_pool.inner(),
		issuer_did,
		subject_did,
		attributes,
		&list_id,
		index,
	)
	.await
	.wrap_err("failed to persist credential")?;
	let issuer_signature =
		jose::sign_jws(&state.keys, &format!("{issuer_did}#sign"), &credential)
			.wrap_err("failed to sign credential")?;
	Ok(IssueResponse {
		credential,
		issuer_signature,
	})
}

#[tracing::instrument(skip_all)]
async fn issuer_issue(
	State(state): State<RouterState>,
	headers: HeaderMap,
	Json(req): Json<IssueRequest>,
) -> Result<Json<IssueResponse>, IssueErr> {
	require_admin(&state, &headers)?;
	if headers.get("idempotency-key").is_none() {
		return Err(IssueErr::IdempotencyKeyRequired);
	}

	let issuer = store::get_default_party(state.db_pool.inner(), PartyRole::Issuer)
		.await
		.wrap_err("failed to look up default issuer")?
		.ok_or(IssueErr::NoIssuer)?;

	// surface a full status list as a caller problem, not a server fault
	match issue_for(&state, &issuer.did, &req.subject_did, req.attributes).await {
		Ok(response) => Ok(Json(response)),
		Err(report) => match full_list_message(&report) {
			Some(message) => Err(IssueErr::ListFull(message)),
			None => Err(IssueErr::Internal(report)),
		},
	}
}

// ---- status list & revocation ----

#[derive(Debug, thiserror::Error)]
enum StatusListEndpointErr {
	#[error(transparent)]
	Internal(#[from] color_eyre::Report),
}

impl IntoResponse for StatusListEndpointErr {
	fn into_response(self) -> axum::response::Response {
		error!("{self:?}");
		detail_response(StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
	}
}

#[tracing::instrument(skip_all)]
async fn issuer_statuslist(
	State(state): State<RouterState>,
	Path(list_id): Path<String>,
) -> Result<Json<StatusListDoc>, StatusListEndpointErr> {
	let doc = state
		.statuslists
		.publish(&list_id)
		.await
		.wrap_err("failed to publish status list")?;
	Ok(Json(doc))
}

#[derive(Debug, Deserialize)]
struct RevokeRequest {
	cred_id: String,
}

#[derive(Debug, thiserror::Error)]
enum RevokeErr {
	#[error(transparent)]
	Unauthorized(#[from] InvalidAdminToken),
	#[error("credential not found")]
	NotFound,
	#[error(transparent)]
	Internal(#[from] color_eyre::Report),
}

impl IntoResponse for RevokeErr {
	fn into_response(self) -> axum::response::Response {
		error!("{self:?}");
		let status = match self {
			Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
			Self::NotFound => StatusCode::NOT_FOUND,
			Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		detail_response(status, self.to_string())
	}
}

#[tracing::instrument(skip_all)]
async fn issuer_revoke(
	State(state): State<RouterState>,
	headers: HeaderMap,
	Json(req): Json<RevokeRequest>,
) -> Result<Json<Value>, RevokeErr> {
	require_admin(&state, &headers)?;
	state
		.statuslists
		.revoke(&req.cred_id)
		.await
		.map_err(|err| match err {
			StatusListError::CredentialNotFound => RevokeErr::NotFound,
			other => RevokeErr::Internal(
				color_eyre::Report::new(other).wrap_err("failed to revoke credential"),
			),
		})?;
	Ok(Json(json!({ "ok": true })))
}

// ---- offers & wallet claims ----

#[derive(Debug, Serialize, Deserialize)]
struct OfferRecord {
	challenge: String,
	issuer_did: String,
	claims: BTreeMap<String, bool>,
	ttl_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
struct OfferResponse {
	ok: bool,
	challenge: String,
	ttl_seconds: i64,
}

#[derive(Debug, thiserror::Error)]
enum OfferErr {
	#[error(transparent)]
	Unauthorized(#[from] InvalidAdminToken),
	#[error(transparent)]
	Internal(#[from] color_eyre::Report),
}

impl IntoResponse for OfferErr {
	fn into_response(self) -> axum::response::Response {
		error!("{self:?}");
		let status = match self {
			Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
			Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		detail_response(status, self.to_string())
	}
}

fn offer_key(challenge: &str) -> String {
	format!("offer:{challenge}")
}

#[tracing::instrument(skip_all)]
async fn issuer_register_offer(
	State(state): State<RouterState>,
	headers: HeaderMap,
	Json(offer): Json<OfferRecord>,
) -> Result<Json<OfferResponse>, OfferErr> {
	require_admin(&state, &headers)?;

	let ttl_seconds = offer
		.ttl_seconds
		.unwrap_or(DEFAULT_OFFER_TTL_SECS)
		.clamp(1, MAX_OFFER_TTL_SECS);
	let record =
		serde_json::to_string(&offer).wrap_err("failed to serialize offer record")?;
	state
		.cache
		.put(
			&offer_key(&offer.challenge),
			record,
			Duration::from_secs(ttl_seconds as u64),
		)
		.await;

	Ok(Json(OfferResponse {
		ok: true,
		challenge: offer.challenge,
		ttl_seconds,
	}))
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
	challenge: String,
	holder_did: String,
	attributes: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
enum ClaimErr {
	#[error("offer not found or expired")]
	OfferNotFound,
	#[error("issuer referenced in offer not available")]
	IssuerUnavailable,
	#[error("holder not registered")]
	HolderUnknown,
	#[error("missing attributes for claims: {0}")]
	MissingAttributes(String),
	#[error("{0}")]
	ListFull(String),
	#[error(transparent)]
	Internal(#[from] color_eyre::Report),
}

impl IntoResponse for ClaimErr {
	fn into_response(self) -> axum::response::Response {
		error!("{self:?}");
		let status = match self {
			Self::OfferNotFound => StatusCode::NOT_FOUND,
			Self::IssuerUnavailable
			| Self::HolderUnknown
			| Self::MissingAttributes(_)
			| Self::ListFull(_) => StatusCode::BAD_REQUEST,
			Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		detail_response(status, self.to_string())
	}
}

#[tracing::instrument(skip_all)]
async fn wallet_claim(
	State(state): State<RouterState>,
	Json(req): Json<ClaimRequest>,
) -> Result<Json<IssueResponse>, ClaimErr> {
	let key = offer_key(&req.challenge);
	let cached = state.cache.get(&key).await.ok_or(ClaimErr::OfferNotFound)?;
	let offer: OfferRecord =
		serde_json::from_str(&cached).wrap_err("stored offer was corrupt")?;

	let issuer = store::get_party(state.db_pool.inner(), PartyRole::Issuer, &offer.issuer_did)
		.await
		.wrap_err("failed to look up offer issuer")?
		.ok_or(ClaimErr::IssuerUnavailable)?;
	store::get_party(state.db_pool.inner(), PartyRole::Holder, &req.holder_did)
		.await
		.wrap_err("failed to look up holder")?
		.ok_or(ClaimErr::HolderUnknown)?;

	let missing: Vec<String> = offer
		.claims
		.iter()
		.filter(|(claim, required)| **required && !req.attributes.contains_key(*claim))
		.map(|(claim, _)| claim.clone())
		.collect();
	if !missing.is_empty() {
		return Err(ClaimErr::MissingAttributes(missing.join(", ")));
	}

	let response = match issue_for(&state, &issuer.did, &req.holder_did, req.attributes).await
	{
		Ok(response) => response,
		Err(report) => {
			return Err(match full_list_message(&report) {
				Some(message) => ClaimErr::ListFull(message),
				None => ClaimErr::Internal(report),
			});
		}
	};

	// the coupon is spent only once the credential exists
	state.cache.remove(&key).await;
	Ok(Json(response))
}

// ---- challenges & verification ----

#[derive(Debug, Deserialize)]
struct ChallengeRequest {
	aud: String,
}

#[tracing::instrument(skip_all)]
async fn verifier_challenge(
	State(state): State<RouterState>,
	Json(req): Json<ChallengeRequest>,
) -> Json<Challenge> {
	Json(state.challenges.issue(&req.aud).await)
}

#[derive(Debug, Serialize)]
struct VerifyResponse {
	ok: bool,
	message: String,
	disclosed: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
enum VerifyEndpointErr {
	#[error("no verifier configured")]
	NoVerifier,
	#[error(transparent)]
	Verify(#[from] VerifyError),
	#[error(transparent)]
	Internal(#[from] color_eyre::Report),
}

impl IntoResponse for VerifyEndpointErr {
	fn into_response(self) -> axum::response::Response {
		error!("{self:?}");
		let status = match &self {
			Self::NoVerifier => StatusCode::BAD_REQUEST,
			Self::Verify(err) => match err {
				VerifyError::Decryption
				| VerifyError::Payload
				| VerifyError::Challenge(_)
				| VerifyError::Revoked
				| VerifyError::ProofFailed => StatusCode::BAD_REQUEST,
				VerifyError::Key(_) | VerifyError::Status(_) => {
					StatusCode::INTERNAL_SERVER_ERROR
				}
			},
			Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		detail_response(status, self.to_string())
	}
}

#[tracing::instrument(skip_all)]
async fn verifier_verify(
	State(state): State<RouterState>,
	Json(sealed): Json<EncryptedBox>,
) -> Result<Json<VerifyResponse>, VerifyEndpointErr> {
	let verifier = store::get_default_party(state.db_pool.inner(), PartyRole::Verifier)
		.await
		.wrap_err("failed to look up default verifier")?
		.ok_or(VerifyEndpointErr::NoVerifier)?;

	let disclosed = presentation::verify_and_extract(
		&state.keys,
		&state.challenges,
		&state.statuslists,
		&verifier.did,
		&sealed,
	)
	.await?;

	Ok(Json(VerifyResponse {
		ok: true,
		message: "verified OK".to_owned(),
		disclosed,
	}))
}

// ---- holder ----

#[derive(Debug, Deserialize)]
struct PresentRequest {
	holder_did: String,
	cred_id: String,
	reveal_fields: Vec<String>,
	verifier_did: String,
}

#[derive(Debug, Serialize)]
struct PresentResponse {
	#[serde(rename = "box")]
	sealed: EncryptedBox,
}

#[derive(Debug, thiserror::Error)]
enum PresentErr {
	#[error("unknown holder or verifier")]
	UnknownParty,
	#[error("credential not found or not owned by holder")]
	CredentialNotFound,
	#[error(transparent)]
	Build(#[from] BuildError),
	#[error(transparent)]
	Internal(#[from] color_eyre::Report),
}

impl IntoResponse for PresentErr {
	fn into_response(self) -> axum::response::Response {
		error!("{self:?}");
		let status = match self {
			Self::UnknownParty | Self::CredentialNotFound => StatusCode::BAD_REQUEST,
			// a missing agreement key after bootstrap is a server fault
			Self::Build(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		detail_response(status, self.to_string())
	}
}

#[tracing::instrument(skip_all)]
async fn holder_present(
	State(state): State<RouterState>,
	Json(req): Json<PresentRequest>,
) -> Result<Json<PresentResponse>, PresentErr> {
	let holder = store::get_party(state.db_pool.inner(), PartyRole::Holder, &req.holder_did)
		.await
		.wrap_err("failed to look up holder")?;
	let verifier =
		store::get_party(state.db_pool.inner(), PartyRole::Verifier, &req.verifier_did)
			.await
			.wrap_err("failed to look up verifier")?;
	let (Some(_holder), Some(verifier)) = (holder, verifier) else {
		return Err(PresentErr::UnknownParty);
	};

	let credential = store::get_credential(state.db_pool.inner(), &req.cred_id)
		.await
		.wrap_err("failed to look up credential")?;
	let credential = match credential {
		Some(credential) if credential.subject == req.holder_did => credential,
		_ => return Err(PresentErr::CredentialNotFound),
	};

	let sealed = presentation::build(
		&state.keys,
		&state.challenges,
		&verifier.doc,
		&credential,
		&req.reveal_fields,
	)
	.await?;
	Ok(Json(PresentResponse { sealed }))
}

#[derive(Debug, Serialize)]
struct CredentialListResponse {
	credentials: Vec<CredentialRecord>,
}

#[derive(Debug, thiserror::Error)]
enum ListCredsErr {
	#[error(transparent)]
	Internal(#[from] color_eyre::Report),
}

impl IntoResponse for ListCredsErr {
	fn into_response(self) -> axum::response::Response {
		error!("{self:?}");
		detail_response(StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
	}
}

#[tracing::instrument(skip_all)]
async fn holder_credentials(
	State(state): State<RouterState>,
	Path(holder_did): Path<String>,
) -> Result<Json<CredentialListResponse>, ListCredsErr> {
	let credentials = store::list_credentials_for_holder(state.db_pool.inner(), &holder_did)
		.await
		.wrap_err("failed to list credentials")?;
	Ok(Json(CredentialListResponse { credentials }))
}

// ---- admin ----

#[derive(Debug, thiserror::Error)]
enum ResetErr {
	#[error(transparent)]
	Unauthorized(#[from] InvalidAdminToken),
	#[error(transparent)]
	Internal(#[from] color_eyre::Report),
}

impl IntoResponse for ResetErr {
	fn into_response(self) -> axum::response::Response {
		error!("{self:?}");
		let status = match self {
			Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
			Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		detail_response(status, self.to_string())
	}
}

#[tracing::instrument(skip_all)]
async fn admin_reset(
	State(state): State<RouterState>,
	headers: HeaderMap,
) -> Result<Json<Value>, ResetErr> {
	require_admin(&state, &headers)?;
	store::reset_state(state.db_pool.inner())
		.await
		.wrap_err("failed to reset database state")?;
	state.cache.clear().await;
	state.keys.wipe().wrap_err("failed to wipe key directory")?;
	Ok(Json(json!({ "ok": true })))
}
