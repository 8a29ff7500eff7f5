pub mod matches;
pub mod tournaments;

use axum::routing::{get, post};
use axum::Router;
use utoipa::OpenApi;

use crate::state::AppState;
use crate::store::{
    MatchRecord, MatchState, TournamentMatch, TournamentMatchStatus, TournamentPlayer,
    TournamentRecord, TournamentStatus,
};

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/matches/pong", post(matches::create_match))
        .route(
            "/matches/pong/:match_id",
            get(matches::get_match).patch(matches::record_match_result),
        )
        .route("/tournament", post(tournaments::create_tournament))
        .route("/tournament/register", post(tournaments::register))
        .route("/tournament/queue/join", post(tournaments::queue_join))
        .route("/tournament/queue/leave", post(tournaments::queue_leave))
        .route(
            "/tournament/announce-next",
            post(tournaments::announce_next),
        )
        .route("/tournament/result", post(tournaments::record_result))
        .route("/tournament/:id", get(tournaments::get_tournament))
        .route("/tournament/:id/board", get(tournaments::get_board))
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Pong Arena API",
        description = "REST surface of the competitive Pong platform backend.\n\nAll endpoints require a bearer access token. Real-time play, chat and tournament events run over the `/ws/chat`, `/ws/pong/:matchId` and `/ws/tournament` WebSocket endpoints.",
        version = "0.1.0",
    ),
    paths(
        matches::create_match,
        matches::get_match,
        matches::record_match_result,
        tournaments::create_tournament,
        tournaments::register,
        tournaments::queue_join,
        tournaments::queue_leave,
        tournaments::announce_next,
        tournaments::record_result,
        tournaments::get_tournament,
        tournaments::get_board,
    ),
    components(schemas(
        MatchRecord,
        MatchState,
        TournamentRecord,
        TournamentStatus,
        TournamentPlayer,
        TournamentMatch,
        TournamentMatchStatus,
        matches::CreateMatchRequest,
        matches::MatchCreatedResponse,
        matches::MatchResultRequest,
        tournaments::CreateTournamentRequest,
        tournaments::RegisterRequest,
        tournaments::QueueRequest,
        tournaments::AnnounceRequest,
        tournaments::ResultRequest,
        tournaments::BoardResponse,
    )),
    tags(
        (name = "matches", description = "Direct match creation and result writes"),
        (name = "tournament", description = "Tournament lifecycle, queue and results")
    )
)]
pub struct ApiDoc;
