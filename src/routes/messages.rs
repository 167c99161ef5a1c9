use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get};
use uuid::Uuid;

use crate::db::Db;
use crate::models::HistoryMessage;

/// History for a room, newest-first, with reactions aggregated in.
/// `before` is the id of the oldest message from the previous page;
/// reconnecting clients fetch one page instead of relying on any
/// server-side backlog. Rooms exist on demand, so an unknown room is an
/// empty history, not an error.
#[get("/rooms/<room>/messages?<before>&<limit>")]
pub async fn get_messages(
    db: &State<Db>,
    room: &str,
    before: Option<&str>,
    limit: Option<i64>,
) -> Result<Json<Vec<HistoryMessage>>, (Status, Json<serde_json::Value>)> {
    let limit = limit.unwrap_or(50).clamp(1, 100);
    let before = match before {
        Some(raw) => Some(Uuid::parse_str(raw).map_err(|_| {
            (
                Status::BadRequest,
                Json(serde_json::json!({"error": "before must be a message id"})),
            )
        })?),
        None => None,
    };

    let stored = db.list_messages(room, before, limit).await.map_err(|e| {
        (
            Status::ServiceUnavailable,
            Json(serde_json::json!({"error": e.to_string()})),
        )
    })?;

    let ids: Vec<Uuid> = stored.iter().map(|m| m.id).collect();
    let mut reactions = db.aggregate_reactions(&ids).await.map_err(|e| {
        (
            Status::ServiceUnavailable,
            Json(serde_json::json!({"error": e.to_string()})),
        )
    })?;

    let page = stored
        .into_iter()
        .map(|m| {
            let groups = reactions.remove(&m.id).unwrap_or_default();
            HistoryMessage {
                message: m.into_display(),
                reactions: groups,
            }
        })
        .collect();
    Ok(Json(page))
}
