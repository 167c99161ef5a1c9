use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::events::ServerFrame;
use crate::presence::PresenceRegistry;

pub const CHANNEL_PRESENCE: &str = "presence:events";
pub const CHANNEL_CHAT: &str = "chat:events";

const PUBLISH_DEADLINE: Duration = Duration::from_secs(1);
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Chat fan-out envelope. `payload` is the already-serialized server
/// frame, so a receiving instance re-broadcasts without rebuilding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEnvelope {
    pub kind: String,
    pub room: String,
    pub payload: serde_json::Value,
    pub origin_instance_id: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEnvelope {
    pub kind: String,
    pub room: String,
    pub user_id: Uuid,
    pub handle: String,
    pub instance_id: String,
    pub ts: DateTime<Utc>,
}

enum Mode {
    /// No bus configured or reachable: every instance broadcasts only to
    /// its own connections. Joining the bus later (via restart) is safe —
    /// there is no state to migrate.
    Standalone,
    Redis {
        client: redis::Client,
        conn: redis::aio::ConnectionManager,
    },
}

/// Cross-instance pub/sub transport. Publishers are fire-and-forget with
/// a short write deadline; the bus carries live events only, history is
/// the database's job.
pub struct Bus {
    instance_id: String,
    mode: Mode,
}

impl Bus {
    /// Never fails: an unreachable bus degrades to standalone mode with an
    /// explicit log line, not an error.
    pub async fn connect(url: Option<&str>, instance_id: &str) -> Self {
        let mode = match url {
            None => {
                println!("🚌 No BUS_URL configured — standalone mode (single-instance broadcast)");
                Mode::Standalone
            }
            Some(url) => match Self::open(url).await {
                Ok((client, conn)) => {
                    println!("🚌 Coordination bus connected");
                    Mode::Redis { client, conn }
                }
                Err(e) => {
                    eprintln!("⚠️  Coordination bus unreachable ({e}) — standalone mode");
                    Mode::Standalone
                }
            },
        };
        Bus {
            instance_id: instance_id.to_string(),
            mode,
        }
    }

    async fn open(
        url: &str,
    ) -> redis::RedisResult<(redis::Client, redis::aio::ConnectionManager)> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok((client, conn))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_standalone(&self) -> bool {
        matches!(self.mode, Mode::Standalone)
    }

    /// The underlying client, for the subscriber task and the shared
    /// presence backend.
    pub fn redis_client(&self) -> Option<redis::Client> {
        match &self.mode {
            Mode::Standalone => None,
            Mode::Redis { client, .. } => Some(client.clone()),
        }
    }

    /// Health-endpoint view: "standalone", "ok", or "down".
    pub async fn health(&self) -> &'static str {
        match &self.mode {
            Mode::Standalone => "standalone",
            Mode::Redis { conn, .. } => {
                let mut conn = conn.clone();
                let ping_cmd = redis::cmd("PING");
                let ping = ping_cmd.query_async::<_, String>(&mut conn);
                match tokio::time::timeout(PUBLISH_DEADLINE, ping).await {
                    Ok(Ok(_)) => "ok",
                    _ => "down",
                }
            }
        }
    }

    fn publish(&self, channel: &'static str, payload: String) {
        let Mode::Redis { conn, .. } = &self.mode else {
            return;
        };
        let mut conn = conn.clone();
        tokio::spawn(async move {
            let mut publish_cmd = redis::cmd("PUBLISH");
            publish_cmd.arg(channel).arg(&payload);
            let publish = publish_cmd.query_async::<_, i64>(&mut conn);
            match tokio::time::timeout(PUBLISH_DEADLINE, publish).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => eprintln!("⚠️  Bus publish on {channel} failed: {e}"),
                Err(_) => eprintln!("⚠️  Bus publish on {channel} timed out"),
            }
        });
    }

    pub fn publish_chat(&self, kind: &str, room: &str, frame: &ServerFrame) {
        let envelope = ChatEnvelope {
            kind: kind.to_string(),
            room: room.to_string(),
            payload: serde_json::to_value(frame).unwrap_or_default(),
            origin_instance_id: self.instance_id.clone(),
            ts: Utc::now(),
        };
        if let Ok(json) = serde_json::to_string(&envelope) {
            self.publish(CHANNEL_CHAT, json);
        }
    }

    pub fn publish_presence(&self, kind: &str, room: &str, user_id: Uuid, handle: &str) {
        let envelope = PresenceEnvelope {
            kind: kind.to_string(),
            room: room.to_string(),
            user_id,
            handle: handle.to_string(),
            instance_id: self.instance_id.clone(),
            ts: Utc::now(),
        };
        if let Ok(json) = serde_json::to_string(&envelope) {
            self.publish(CHANNEL_PRESENCE, json);
        }
    }
}

/// Whether a received envelope should be applied on this instance.
/// The originating instance already broadcast locally.
pub fn accepts_origin(self_instance: &str, origin: &str) -> bool {
    self_instance != origin
}

/// Background task translating bus traffic into local broadcast and
/// roster reconciliation. Reconnects with a short delay on any error.
pub fn spawn_subscriber(
    client: redis::Client,
    instance_id: String,
    connections: Arc<ConnectionManager>,
    presence: Arc<PresenceRegistry>,
) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = run_subscriber(&client, &instance_id, &connections, &presence).await {
                eprintln!("⚠️  Bus subscriber error: {e} — resubscribing");
            }
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    });
}

async fn run_subscriber(
    client: &redis::Client,
    instance_id: &str,
    connections: &Arc<ConnectionManager>,
    presence: &Arc<PresenceRegistry>,
) -> redis::RedisResult<()> {
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.subscribe(CHANNEL_CHAT).await?;
    pubsub.subscribe(CHANNEL_PRESENCE).await?;

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = msg.get_payload()?;
        match channel.as_str() {
            CHANNEL_CHAT => handle_chat_event(instance_id, connections, &payload),
            CHANNEL_PRESENCE => {
                handle_presence_event(instance_id, connections, presence, &payload).await
            }
            _ => {}
        }
    }
    Ok(())
}

fn handle_chat_event(instance_id: &str, connections: &ConnectionManager, payload: &str) {
    let Ok(envelope) = serde_json::from_str::<ChatEnvelope>(payload) else {
        eprintln!("⚠️  Dropping malformed chat envelope");
        return;
    };
    if !accepts_origin(instance_id, &envelope.origin_instance_id) {
        return;
    }
    match serde_json::from_value::<ServerFrame>(envelope.payload) {
        Ok(frame) => connections.broadcast(&envelope.room, &frame, None),
        Err(e) => eprintln!("⚠️  Dropping undecodable chat payload: {e}"),
    }
}

async fn handle_presence_event(
    instance_id: &str,
    connections: &ConnectionManager,
    presence: &Arc<PresenceRegistry>,
    payload: &str,
) {
    let Ok(envelope) = serde_json::from_str::<PresenceEnvelope>(payload) else {
        eprintln!("⚠️  Dropping malformed presence envelope");
        return;
    };
    if !accepts_origin(instance_id, &envelope.instance_id) {
        return;
    }
    match envelope.kind.as_str() {
        "joined" => {
            connections.broadcast(
                &envelope.room,
                &ServerFrame::UserJoined {
                    room: envelope.room.clone(),
                    user_id: envelope.user_id,
                    handle: envelope.handle.clone(),
                    joined_at: envelope.ts,
                },
                None,
            );
        }
        "left" => {
            // Another instance dropped its last connection for this user,
            // but the user may still be connected here — re-assert instead
            // of letting the roster go stale.
            if connections.has_user(&envelope.room, envelope.user_id) {
                presence
                    .reassert(&envelope.room, envelope.user_id, &envelope.handle)
                    .await;
            } else {
                connections.broadcast(
                    &envelope.room,
                    &ServerFrame::UserLeft {
                        room: envelope.room.clone(),
                        user_id: envelope.user_id,
                    },
                    None,
                );
            }
        }
        other => eprintln!("⚠️  Unknown presence kind: {other}"),
    }
}
