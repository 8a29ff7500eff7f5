use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::CoreError;
use crate::state::AppState;
use crate::stats;
use crate::store::{MatchRecord, MatchState};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateMatchRequest {
    pub opponent_id: Uuid,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchCreatedResponse {
    pub match_id: Uuid,
    pub p1_id: Uuid,
    pub p2_id: Uuid,
    pub state: MatchState,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchResultRequest {
    pub winner_id: Uuid,
    pub p1_score: u32,
    pub p2_score: u32,
}

/// POST /matches/pong - Create a match directly (outside the invite flow)
#[utoipa::path(
    post,
    path = "/matches/pong",
    request_body = CreateMatchRequest,
    responses(
        (status = 201, description = "Match created", body = MatchCreatedResponse),
        (status = 400, description = "Opponent equals creator"),
    ),
    security(("bearer" = [])),
    tag = "matches"
)]
pub async fn create_match(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<CreateMatchRequest>,
) -> Result<(StatusCode, Json<MatchCreatedResponse>), CoreError> {
    let record = state
        .store
        .matches
        .create(auth.user_id, request.opponent_id, None)
        .await?;
    tracing::info!(match_id = %record.id, "match created over REST");
    Ok((
        StatusCode::CREATED,
        Json(MatchCreatedResponse {
            match_id: record.id,
            p1_id: record.p1_id,
            p2_id: record.p2_id,
            state: record.state,
        }),
    ))
}

/// GET /matches/pong/:matchId - Fetch the durable match row
#[utoipa::path(
    get,
    path = "/matches/pong/{match_id}",
    params(("match_id" = Uuid, Path, description = "Match id")),
    responses(
        (status = 200, description = "Match row", body = MatchRecord),
        (status = 404, description = "Unknown match"),
    ),
    security(("bearer" = [])),
    tag = "matches"
)]
pub async fn get_match(
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
) -> Result<Json<MatchRecord>, CoreError> {
    match state.store.matches.get(match_id).await {
        Some(record) => Ok(Json(record)),
        None => Err(CoreError::NotFound(format!("match {match_id}"))),
    }
}

/// PATCH /matches/pong/:matchId - Idempotent result write
#[utoipa::path(
    patch,
    path = "/matches/pong/{match_id}",
    params(("match_id" = Uuid, Path, description = "Match id")),
    request_body = MatchResultRequest,
    responses(
        (status = 200, description = "Terminal match row", body = MatchRecord),
        (status = 400, description = "Winner is not a participant"),
        (status = 404, description = "Unknown match"),
    ),
    security(("bearer" = [])),
    tag = "matches"
)]
pub async fn record_match_result(
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
    Json(request): Json<MatchResultRequest>,
) -> Result<Json<MatchRecord>, CoreError> {
    let (record, changed) = state
        .store
        .matches
        .complete(
            match_id,
            MatchState::Ended,
            request.winner_id,
            request.p1_score,
            request.p2_score,
        )
        .await?;
    if changed {
        for user_id in [record.p1_id, record.p2_id] {
            stats::recompute_user(&state.store, user_id).await?;
        }
        if let Some(tournament_id) = record.tournament_id {
            state
                .tournaments
                .match_completed(
                    tournament_id,
                    record.id,
                    record.p1_score,
                    record.p2_score,
                    request.winner_id,
                )
                .await;
        }
    }
    Ok(Json(record))
}
