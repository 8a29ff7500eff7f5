use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::CoreError;
use crate::state::AppState;
use crate::store::{TournamentMatch, TournamentPlayer, TournamentRecord};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTournamentRequest {
    pub name: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub tournament_id: Uuid,
    pub alias: String,
    /// Account backing this entrant; defaults to the caller when `asSelf`
    /// is set, otherwise the entrant is alias-only.
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub as_self: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueRequest {
    pub tournament_id: Uuid,
    pub player_id: Uuid,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceRequest {
    pub tournament_id: Uuid,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResultRequest {
    pub tournament_id: Uuid,
    pub match_id: Uuid,
    pub p1_score: u32,
    pub p2_score: u32,
    pub winner_id: Uuid,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BoardResponse {
    pub players: Vec<TournamentPlayer>,
    pub matches: Vec<TournamentMatch>,
}

/// POST /tournament - Create a tournament
#[utoipa::path(
    post,
    path = "/tournament",
    request_body = CreateTournamentRequest,
    responses((status = 201, description = "Tournament created", body = TournamentRecord)),
    security(("bearer" = [])),
    tag = "tournament"
)]
pub async fn create_tournament(
    State(state): State<AppState>,
    Json(request): Json<CreateTournamentRequest>,
) -> Result<(StatusCode, Json<TournamentRecord>), CoreError> {
    let record = state.tournaments.create(request.name).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// POST /tournament/register - Register an entrant
#[utoipa::path(
    post,
    path = "/tournament/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Entrant registered", body = TournamentPlayer),
        (status = 409, description = "Alias already taken"),
    ),
    security(("bearer" = [])),
    tag = "tournament"
)]
pub async fn register(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<TournamentPlayer>), CoreError> {
    let user_id = if request.as_self {
        Some(auth.user_id)
    } else {
        request.user_id
    };
    let handle = state.tournaments.handle(request.tournament_id).await?;
    let player = handle.register(request.alias, user_id).await?;
    Ok((StatusCode::CREATED, Json(player)))
}

/// POST /tournament/queue/join - Mark an entrant as queued
#[utoipa::path(
    post,
    path = "/tournament/queue/join",
    request_body = QueueRequest,
    responses((status = 204, description = "Queued")),
    security(("bearer" = [])),
    tag = "tournament"
)]
pub async fn queue_join(
    State(state): State<AppState>,
    Json(request): Json<QueueRequest>,
) -> Result<StatusCode, CoreError> {
    let handle = state.tournaments.handle(request.tournament_id).await?;
    handle.queue_join(request.player_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /tournament/queue/leave - Clear an entrant's queue flag
#[utoipa::path(
    post,
    path = "/tournament/queue/leave",
    request_body = QueueRequest,
    responses((status = 204, description = "Dequeued")),
    security(("bearer" = [])),
    tag = "tournament"
)]
pub async fn queue_leave(
    State(state): State<AppState>,
    Json(request): Json<QueueRequest>,
) -> Result<StatusCode, CoreError> {
    let handle = state.tournaments.handle(request.tournament_id).await?;
    handle.queue_leave(request.player_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /tournament/announce-next - Promote the next queued pair
#[utoipa::path(
    post,
    path = "/tournament/announce-next",
    request_body = AnnounceRequest,
    responses(
        (status = 200, description = "Announced match, or null when fewer than two players are queued", body = TournamentMatch),
    ),
    security(("bearer" = [])),
    tag = "tournament"
)]
pub async fn announce_next(
    State(state): State<AppState>,
    Json(request): Json<AnnounceRequest>,
) -> Result<Json<Option<TournamentMatch>>, CoreError> {
    let handle = state.tournaments.handle(request.tournament_id).await?;
    Ok(Json(handle.announce_next().await?))
}

/// POST /tournament/result - Record the announced match's result
#[utoipa::path(
    post,
    path = "/tournament/result",
    request_body = ResultRequest,
    responses(
        (status = 200, description = "Completed tournament match", body = TournamentMatch),
        (status = 409, description = "Match is not announced"),
    ),
    security(("bearer" = [])),
    tag = "tournament"
)]
pub async fn record_result(
    State(state): State<AppState>,
    Json(request): Json<ResultRequest>,
) -> Result<Json<TournamentMatch>, CoreError> {
    let handle = state.tournaments.handle(request.tournament_id).await?;
    let record = handle
        .record_result(
            request.match_id,
            request.p1_score,
            request.p2_score,
            request.winner_id,
        )
        .await?;
    Ok(Json(record))
}

/// GET /tournament/:id - Tournament row with entrants and matches
#[utoipa::path(
    get,
    path = "/tournament/{id}",
    params(("id" = Uuid, Path, description = "Tournament id")),
    responses(
        (status = 200, description = "Tournament", body = TournamentRecord),
        (status = 404, description = "Unknown tournament"),
    ),
    security(("bearer" = [])),
    tag = "tournament"
)]
pub async fn get_tournament(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TournamentRecord>, CoreError> {
    Ok(Json(state.tournaments.get(id).await?))
}

/// GET /tournament/:id/board - Entrants plus matches ordered by play order
#[utoipa::path(
    get,
    path = "/tournament/{id}/board",
    params(("id" = Uuid, Path, description = "Tournament id")),
    responses(
        (status = 200, description = "Board", body = BoardResponse),
        (status = 404, description = "Unknown tournament"),
    ),
    security(("bearer" = [])),
    tag = "tournament"
)]
pub async fn get_board(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BoardResponse>, CoreError> {
    let record = state.tournaments.get(id).await?;
    let mut matches = record.matches;
    matches.sort_by_key(|m| m.order);
    Ok(Json(BoardResponse {
        players: record.players,
        matches,
    }))
}
