use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::bus::Bus;
use crate::connection::ConnectionManager;
use crate::events::ServerFrame;
use crate::models::{PresenceEntry, RosterUser};

/// Debounce for rapid reconnects: a user whose local connection count
/// drops to zero stays on the roster this long before the leave fires.
const LEAVE_GRACE: Duration = Duration::from_secs(2);

const ROOMS_KEY: &str = "presence:rooms";
const INSTANCES_KEY: &str = "presence:instances";

fn room_key(room: &str) -> String {
    format!("presence:{room}")
}

enum Backend {
    /// Single-instance roster, the whole story in standalone mode.
    Local(RwLock<HashMap<String, HashMap<Uuid, PresenceEntry>>>),
    /// Shared roster: one hash per room, plus an instance-heartbeat hash
    /// the sweeper uses to evict members of crashed instances.
    Redis(redis::aio::ConnectionManager),
}

/// Per-room membership with authoritative snapshots. A user with multiple
/// concurrent connections counts once; join and leave are idempotent at
/// the user level. Code never touches the backend directly.
pub struct PresenceRegistry {
    instance_id: String,
    heartbeat_timeout: Duration,
    /// Local connection counts per (room, user); the 0↔1 transitions of
    /// this map drive all roster mutations and events.
    counts: RwLock<HashMap<(String, Uuid), usize>>,
    backend: Backend,
    connections: Arc<ConnectionManager>,
    bus: Arc<Bus>,
}

impl PresenceRegistry {
    /// Backend selection follows the bus: a connected bus means the
    /// roster must be shared, otherwise it is in-process.
    pub async fn new(
        heartbeat_timeout: Duration,
        bus: Arc<Bus>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        let backend = match bus.redis_client() {
            Some(client) => match redis::aio::ConnectionManager::new(client).await {
                Ok(conn) => Backend::Redis(conn),
                Err(e) => {
                    eprintln!("⚠️  Presence falling back to in-process roster: {e}");
                    Backend::Local(RwLock::new(HashMap::new()))
                }
            },
            None => Backend::Local(RwLock::new(HashMap::new())),
        };
        Self {
            instance_id: bus.instance_id().to_string(),
            heartbeat_timeout,
            counts: RwLock::new(HashMap::new()),
            backend,
            connections,
            bus,
        }
    }

    fn bump_count(&self, room: &str, user_id: Uuid) -> usize {
        let mut counts = self.counts.write().unwrap_or_else(|e| e.into_inner());
        let n = counts.entry((room.to_string(), user_id)).or_insert(0);
        *n += 1;
        *n
    }

    fn drop_count(&self, room: &str, user_id: Uuid) -> usize {
        let mut counts = self.counts.write().unwrap_or_else(|e| e.into_inner());
        let key = (room.to_string(), user_id);
        match counts.get_mut(&key) {
            Some(n) => {
                *n = n.saturating_sub(1);
                let left = *n;
                if left == 0 {
                    counts.remove(&key);
                }
                left
            }
            None => 0,
        }
    }

    fn current_count(&self, room: &str, user_id: Uuid) -> usize {
        let counts = self.counts.read().unwrap_or_else(|e| e.into_inner());
        counts
            .get(&(room.to_string(), user_id))
            .copied()
            .unwrap_or(0)
    }

    /// Register one connection. On the user's 0→1 transition the roster
    /// gains an entry, local peers get `user_joined`, and the event goes
    /// out on the bus. Returns the roster snapshot for the new client,
    /// which replaces (never merges into) whatever it held before.
    pub async fn join(&self, room: &str, user_id: Uuid, handle: &str) -> Vec<RosterUser> {
        if self.bump_count(room, user_id) == 1 {
            let entry = PresenceEntry {
                user_id,
                handle: handle.to_string(),
                joined_at: Utc::now(),
                instance_id: self.instance_id.clone(),
                last_seen: Utc::now(),
            };
            self.backend_upsert(room, &entry).await;
            self.connections.broadcast(
                room,
                &ServerFrame::UserJoined {
                    room: room.to_string(),
                    user_id,
                    handle: handle.to_string(),
                    joined_at: entry.joined_at,
                },
                None,
            );
            self.bus.publish_presence("joined", room, user_id, handle);
        }
        self.roster(room)
            .await
            .iter()
            .map(RosterUser::from)
            .collect()
    }

    /// Unregister one connection. The leave only fires once the user's
    /// count stays at zero through the grace interval.
    pub fn leave(self: &Arc<Self>, room: &str, user_id: Uuid, handle: &str) {
        if self.drop_count(room, user_id) > 0 {
            return;
        }
        let registry = Arc::clone(self);
        let room = room.to_string();
        let handle = handle.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(LEAVE_GRACE).await;
            if registry.current_count(&room, user_id) > 0 {
                return; // reconnected during the grace window
            }
            registry.backend_remove(&room, user_id).await;
            registry.connections.broadcast(
                &room,
                &ServerFrame::UserLeft {
                    room: room.clone(),
                    user_id,
                },
                None,
            );
            registry.bus.publish_presence("left", &room, user_id, &handle);
        });
    }

    /// Authoritative roster, consistent across instances within the
    /// staleness bound. Sorted by join time for stable snapshots.
    pub async fn roster(&self, room: &str) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = match &self.backend {
            Backend::Local(rooms) => {
                let rooms = rooms.read().unwrap_or_else(|e| e.into_inner());
                rooms
                    .get(room)
                    .map(|users| users.values().cloned().collect())
                    .unwrap_or_default()
            }
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let raw: HashMap<String, String> =
                    conn.hgetall(room_key(room)).await.unwrap_or_default();
                let live = self.live_instances(&mut conn).await;
                raw.values()
                    .filter_map(|v| serde_json::from_str::<PresenceEntry>(v).ok())
                    .filter(|e| live.as_ref().is_none_or(|l| l.contains(&e.instance_id)))
                    .collect()
            }
        };
        entries.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.user_id.cmp(&b.user_id)));
        entries
    }

    /// Re-add an entry without events; used when another instance
    /// announced a leave for a user this instance still hosts.
    pub async fn reassert(&self, room: &str, user_id: Uuid, handle: &str) {
        if self.current_count(room, user_id) == 0 {
            return;
        }
        let entry = PresenceEntry {
            user_id,
            handle: handle.to_string(),
            joined_at: Utc::now(),
            instance_id: self.instance_id.clone(),
            last_seen: Utc::now(),
        };
        self.backend_upsert(room, &entry).await;
    }

    async fn backend_upsert(&self, room: &str, entry: &PresenceEntry) {
        match &self.backend {
            Backend::Local(rooms) => {
                let mut rooms = rooms.write().unwrap_or_else(|e| e.into_inner());
                rooms
                    .entry(room.to_string())
                    .or_default()
                    .insert(entry.user_id, entry.clone());
            }
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let json = match serde_json::to_string(entry) {
                    Ok(json) => json,
                    Err(_) => return,
                };
                let result: redis::RedisResult<()> = async {
                    let _: () = conn
                        .hset(room_key(room), entry.user_id.to_string(), json)
                        .await?;
                    let _: () = conn.sadd(ROOMS_KEY, room).await?;
                    Ok(())
                }
                .await;
                if let Err(e) = result {
                    eprintln!("⚠️  Presence upsert failed: {e}");
                }
            }
        }
    }

    async fn backend_remove(&self, room: &str, user_id: Uuid) {
        match &self.backend {
            Backend::Local(rooms) => {
                let mut rooms = rooms.write().unwrap_or_else(|e| e.into_inner());
                if let Some(users) = rooms.get_mut(room) {
                    users.remove(&user_id);
                    if users.is_empty() {
                        rooms.remove(room);
                    }
                }
            }
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                // Only the owning instance may evict: another instance may
                // have taken over this user's entry in the meantime.
                let stored: Option<String> = conn
                    .hget(room_key(room), user_id.to_string())
                    .await
                    .unwrap_or(None);
                let owned = stored
                    .and_then(|v| serde_json::from_str::<PresenceEntry>(&v).ok())
                    .map(|e| e.instance_id == self.instance_id)
                    .unwrap_or(false);
                if owned {
                    let result: redis::RedisResult<()> =
                        conn.hdel(room_key(room), user_id.to_string()).await;
                    if let Err(e) = result {
                        eprintln!("⚠️  Presence removal failed: {e}");
                    }
                }
            }
        }
    }

    /// Instances that have heartbeat within the timeout window. `None`
    /// means the heartbeat hash was unreadable — treat everyone as live
    /// rather than flapping the roster on a transient error.
    async fn live_instances(
        &self,
        conn: &mut redis::aio::ConnectionManager,
    ) -> Option<std::collections::HashSet<String>> {
        let raw: HashMap<String, i64> = conn.hgetall(INSTANCES_KEY).await.ok()?;
        let cutoff = Utc::now().timestamp() - self.heartbeat_timeout.as_secs() as i64;
        Some(
            raw.into_iter()
                .filter(|(_, ts)| *ts >= cutoff)
                .map(|(id, _)| id)
                .collect(),
        )
    }

    /// Instance heartbeat plus stale-entry sweeper. Only meaningful with
    /// the shared backend; a no-op task otherwise.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let Backend::Redis(conn) = &self.backend else {
            return;
        };
        let conn = conn.clone();
        let registry = Arc::clone(self);
        let interval = self.heartbeat_timeout / 3;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                let mut conn = conn.clone();
                let beat: redis::RedisResult<()> = conn
                    .hset(INSTANCES_KEY, &registry.instance_id, Utc::now().timestamp())
                    .await;
                if let Err(e) = beat {
                    eprintln!("⚠️  Presence heartbeat failed: {e}");
                    continue;
                }
                registry.sweep(&mut conn).await;
            }
        });
    }

    /// Evict roster entries whose instance stopped heartbeating — the
    /// bounded-staleness guarantee after a crash.
    async fn sweep(&self, conn: &mut redis::aio::ConnectionManager) {
        let Some(live) = self.live_instances(conn).await else {
            return;
        };
        let rooms: Vec<String> = conn.smembers(ROOMS_KEY).await.unwrap_or_default();
        for room in rooms {
            let raw: HashMap<String, String> =
                conn.hgetall(room_key(&room)).await.unwrap_or_default();
            for (field, value) in &raw {
                let stale = serde_json::from_str::<PresenceEntry>(value)
                    .map(|e| !live.contains(&e.instance_id))
                    .unwrap_or(true);
                if stale {
                    let _: redis::RedisResult<()> = conn.hdel(room_key(&room), field).await;
                }
            }
            if raw.is_empty() {
                let _: redis::RedisResult<()> = conn.srem(ROOMS_KEY, &room).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn local_registry() -> Arc<PresenceRegistry> {
        let bus = Arc::new(Bus::connect(None, "inst-test").await);
        let connections = Arc::new(ConnectionManager::new());
        Arc::new(PresenceRegistry::new(Duration::from_secs(45), bus, connections).await)
    }

    #[tokio::test]
    async fn join_is_idempotent_per_user() {
        let registry = local_registry().await;
        let user = Uuid::new_v4();

        let roster = registry.join("default", user, "calm-owl-9f2").await;
        assert_eq!(roster.len(), 1);

        // Second connection for the same user: still one roster entry.
        let roster = registry.join("default", user, "calm-owl-9f2").await;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].handle, "calm-owl-9f2");
    }

    #[tokio::test]
    async fn multi_tab_leave_keeps_entry_until_last_connection() {
        let registry = local_registry().await;
        let user = Uuid::new_v4();
        registry.join("default", user, "h").await;
        registry.join("default", user, "h").await;

        registry.leave("default", user, "h");
        // One connection remains: no grace task fires, entry stays.
        assert_eq!(registry.current_count("default", user), 1);
        assert_eq!(registry.roster("default").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_fires_after_grace_interval() {
        let registry = local_registry().await;
        let user = Uuid::new_v4();
        registry.join("default", user, "h").await;

        registry.leave("default", user, "h");
        assert_eq!(registry.roster("default").await.len(), 1);

        tokio::time::sleep(LEAVE_GRACE + Duration::from_millis(100)).await;
        assert!(registry.roster("default").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_cancels_leave() {
        let registry = local_registry().await;
        let user = Uuid::new_v4();
        registry.join("default", user, "h").await;

        registry.leave("default", user, "h");
        tokio::time::sleep(Duration::from_millis(500)).await;
        registry.join("default", user, "h").await;

        tokio::time::sleep(LEAVE_GRACE).await;
        assert_eq!(registry.roster("default").await.len(), 1);
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let registry = local_registry().await;
        registry.join("a", Uuid::new_v4(), "h1").await;
        registry.join("b", Uuid::new_v4(), "h2").await;

        assert_eq!(registry.roster("a").await.len(), 1);
        assert_eq!(registry.roster("b").await.len(), 1);
        assert!(registry.roster("c").await.is_empty());
    }
}
