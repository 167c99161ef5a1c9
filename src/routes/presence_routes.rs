use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{State, get};

use crate::models::{RosterResponse, RosterUser};
use crate::presence::PresenceRegistry;

/// Authoritative roster for a room. Served from the shared backend, so
/// any instance in the fleet answers consistently within the staleness
/// bound. An unknown room is simply an empty roster.
#[get("/rooms/<room>/users")]
pub async fn room_users(
    presence: &State<Arc<PresenceRegistry>>,
    room: &str,
) -> Json<RosterResponse> {
    let users: Vec<RosterUser> = presence.roster(room).await.iter().map(RosterUser::from).collect();
    Json(RosterResponse {
        room: room.to_string(),
        users,
    })
}
