use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get};
use rocket_ws as ws;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{ClientIp, UserIdHeader, hash_ip};
use crate::chat::{ChatService, ConnCtx};
use crate::config::AppConfig;
use crate::connection::ConnectionManager;
use crate::db::{Db, anon_handle_for};
use crate::events::{ClientFrame, ServerFrame};
use crate::models::User;
use crate::presence::PresenceRegistry;
use crate::reactions::ReactionService;

/// How often the socket task checks for heartbeat expiry.
const HEARTBEAT_POLL: Duration = Duration::from_secs(5);

struct SocketDeps {
    db: Db,
    connections: Arc<ConnectionManager>,
    presence: Arc<PresenceRegistry>,
    chat: Arc<ChatService>,
    reactions: Arc<ReactionService>,
    heartbeat_timeout: Duration,
    maintenance: bool,
}

#[derive(rocket::FromForm)]
pub struct SocketQuery<'r> {
    #[field(name = "userId")]
    user_id: Option<&'r str>,
    room: Option<&'r str>,
}

/// WS upgrade. Identity is the client-generated UUID, as a `userId` query
/// parameter or an `X-User-Id` header; no identity, no upgrade.
#[get("/ws?<query..>")]
#[allow(clippy::too_many_arguments)]
pub fn socket(
    ws: ws::WebSocket,
    query: SocketQuery<'_>,
    header_user: UserIdHeader,
    ip: ClientIp,
    config: &State<AppConfig>,
    db: &State<Db>,
    connections: &State<Arc<ConnectionManager>>,
    presence: &State<Arc<PresenceRegistry>>,
    chat: &State<Arc<ChatService>>,
    reactions: &State<Arc<ReactionService>>,
) -> Result<ws::Channel<'static>, (Status, Json<serde_json::Value>)> {
    if config.maintenance_mode {
        return Err((
            Status::ServiceUnavailable,
            Json(serde_json::json!({"error": "maintenance mode"})),
        ));
    }

    let raw_id = query
        .user_id
        .map(String::from)
        .or(header_user.0)
        .ok_or_else(|| {
            (
                Status::BadRequest,
                Json(serde_json::json!({"error": "userId query parameter or X-User-Id header required"})),
            )
        })?;
    let user_uuid = Uuid::parse_str(raw_id.trim()).map_err(|_| {
        (
            Status::BadRequest,
            Json(serde_json::json!({"error": "userId must be a UUID"})),
        )
    })?;

    let room = query
        .room
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "default".to_string());
    let ip_hash = hash_ip(&config.cookie_secret, &ip.0);

    let deps = SocketDeps {
        db: (*db).clone(),
        connections: Arc::clone(connections),
        presence: Arc::clone(presence),
        chat: Arc::clone(chat),
        reactions: Arc::clone(reactions),
        heartbeat_timeout: config.heartbeat_timeout(),
        maintenance: config.maintenance_mode,
    };

    Ok(ws.channel(move |stream| {
        Box::pin(async move { run_socket(stream, deps, user_uuid, room, ip_hash).await })
    }))
}

async fn run_socket(
    stream: ws::stream::DuplexStream,
    deps: SocketDeps,
    user_uuid: Uuid,
    room: String,
    ip_hash: String,
) -> ws::result::Result<()> {
    // A failed user lookup must not refuse the socket: the handle is
    // derivable from the UUID and the write path is already non-durable
    // under a db outage.
    let user = match deps.db.get_or_create_user(user_uuid, &ip_hash).await {
        Ok(user) => user,
        Err(e) => {
            eprintln!("⚠️  User lookup failed, serving with derived handle: {e}");
            User {
                id: user_uuid,
                anon_handle: anon_handle_for(&user_uuid),
            }
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let connection_id = deps.connections.accept(&room, user.id, tx.clone());
    let ctx = ConnCtx {
        connection_id,
        room: room.clone(),
        user_id: user.id,
        handle: user.anon_handle.clone(),
        ip_hash,
    };

    // Snapshot first, deltas after; the client replaces its roster.
    let roster = deps.presence.join(&room, user.id, &user.anon_handle).await;
    let _ = tx.send(ServerFrame::Roster {
        room: room.clone(),
        users: roster,
    });

    let (mut sink, mut source) = stream.split();
    let mut last_inbound = Instant::now();
    let mut ticker = tokio::time::interval(HEARTBEAT_POLL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let stale = loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(frame) => {
                    if sink.send(ws::Message::Text(frame.to_json())).await.is_err() {
                        break false;
                    }
                }
                None => break false,
            },
            inbound = source.next() => match inbound {
                Some(Ok(ws::Message::Text(raw))) => {
                    last_inbound = Instant::now();
                    dispatch_frame(&deps, &ctx, &tx, &raw).await;
                }
                Some(Ok(ws::Message::Ping(_) | ws::Message::Pong(_))) => {
                    last_inbound = Instant::now();
                }
                Some(Ok(ws::Message::Close(_))) | Some(Err(_)) | None => break false,
                Some(Ok(_)) => {} // binary frames are not part of the protocol
            },
            _ = ticker.tick() => {
                if last_inbound.elapsed() > deps.heartbeat_timeout {
                    break true;
                }
            }
        }
    };

    deps.connections.close(&room, connection_id);
    deps.presence.leave(&room, user.id, &user.anon_handle);

    if stale {
        let _ = sink
            .send(ws::Message::Close(Some(ws::frame::CloseFrame {
                code: ws::frame::CloseCode::Policy,
                reason: "stale".into(),
            })))
            .await;
    }
    let _ = sink.close().await;
    Ok(())
}

/// The frame dispatch table: each typed variant routes to its handler.
async fn dispatch_frame(
    deps: &SocketDeps,
    ctx: &ConnCtx,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    raw: &str,
) {
    match ClientFrame::parse(raw) {
        Ok(ClientFrame::Ping) => {
            let _ = tx.send(ServerFrame::Pong);
        }
        Ok(ClientFrame::Msg {
            text,
            reply_to_message_id,
            client_temp_id,
        }) => {
            if deps.maintenance {
                let _ = tx.send(ServerFrame::error("maintenance mode: messages disabled"));
                return;
            }
            deps.chat
                .handle_user_message(ctx, &text, reply_to_message_id, client_temp_id.as_deref())
                .await;
        }
        Ok(ClientFrame::ReactionAdd { message_id, emoji }) => {
            deps.reactions.add(ctx, message_id, &emoji).await;
        }
        Ok(ClientFrame::ReactionRemove { message_id, emoji }) => {
            deps.reactions.remove(ctx, message_id, &emoji).await;
        }
        Err(e) => {
            let _ = tx.send(ServerFrame::error(format!("unrecognized frame: {e}")));
        }
    }
}
