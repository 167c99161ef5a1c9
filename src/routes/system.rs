use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{State, catch, get};

use crate::bus::Bus;
use crate::db::Db;
use crate::InstanceId;

/// Fleet-debuggable health: which instance answered, whether its database
/// and bus are reachable, and how big the catalog it serves is.
#[get("/health")]
pub async fn health(
    db: &State<Db>,
    bus: &State<Arc<Bus>>,
    instance: &State<InstanceId>,
) -> Json<serde_json::Value> {
    let db_ok = db.ping().await;
    let song_count = if db_ok {
        db.song_count().await.unwrap_or(0)
    } else {
        0
    };
    Json(serde_json::json!({
        "ok": true,
        "instanceId": instance.0,
        "songCount": song_count,
        "db": if db_ok { "ok" } else { "degraded" },
        "bus": bus.health().await,
    }))
}

#[catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Not found"}))
}
