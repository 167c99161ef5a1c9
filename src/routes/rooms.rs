use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get};

use crate::db::Db;
use crate::models::RoomInfo;

/// Known rooms with message counts, most recently active first. Rooms are
/// created on demand by the first message, so this is a lobby view, not a
/// management surface.
#[get("/rooms")]
pub async fn list_rooms(
    db: &State<Db>,
) -> Result<Json<Vec<RoomInfo>>, (Status, Json<serde_json::Value>)> {
    let rooms = db.list_rooms().await.map_err(|e| {
        (
            Status::ServiceUnavailable,
            Json(serde_json::json!({"error": e.to_string()})),
        )
    })?;
    Ok(Json(rooms))
}
