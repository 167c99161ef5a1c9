use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use sha2::{Digest, Sha256};
use tokio_postgres::NoTls;
use uuid::Uuid;

use crate::embedding::EMBED_DIM;
use crate::error::{DbError, FatalConfig};
use crate::models::{ReactionGroup, RoomInfo, SongCandidate, SongRef, StoredMessage, User};

const DB_TIMEOUT: Duration = Duration::from_secs(5);
const PING_TIMEOUT: Duration = Duration::from_secs(2);
const POOL_MAX_SIZE: usize = 20;

/// Postgres-backed store. The schema is owned by external migration
/// tooling; this layer only reads and writes rows that satisfy it.
/// Also the query boundary for the pgvector HNSW index over `songs`.
#[derive(Clone)]
pub struct Db {
    pool: Pool,
}

/// What `startup_check` learns about the catalog. `index_version`
/// participates in every match fingerprint.
#[derive(Debug, Clone)]
pub struct CatalogInfo {
    pub song_count: i64,
    pub index_version: String,
}

/// Outcome of a message insert. `deduped` means an identical
/// (user, clientTempId) row already existed — a reconnect double-send.
#[derive(Debug, Clone)]
pub struct InsertedMessage {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub deduped: bool,
}

const ADJECTIVES: [&str; 24] = [
    "happy", "brave", "quiet", "swift", "lucky", "merry", "gentle", "bold", "calm", "eager",
    "fancy", "jolly", "keen", "lively", "mellow", "noble", "proud", "shy", "sunny", "vivid",
    "witty", "zesty", "cosmic", "dreamy",
];

const ANIMALS: [&str; 24] = [
    "fox", "owl", "wolf", "hare", "lynx", "otter", "crow", "swan", "bear", "deer", "dove",
    "finch", "heron", "ibis", "koala", "lemur", "mole", "newt", "orca", "puma", "raven", "seal",
    "tapir", "wren",
];

/// Deterministic human-readable label for a user UUID, e.g. "happy-fox-a3b".
/// Generated once at row creation and never changed; deriving it from the
/// UUID means a degraded instance can still label the user consistently.
pub fn anon_handle_for(user_id: &Uuid) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    let adjective = ADJECTIVES[digest[0] as usize % ADJECTIVES.len()];
    let animal = ANIMALS[digest[1] as usize % ANIMALS.len()];
    let suffix = hex::encode(&digest[2..4]);
    format!("{}-{}-{}", adjective, animal, &suffix[..3])
}

async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T, DbError>>,
) -> Result<T, DbError> {
    match tokio::time::timeout(DB_TIMEOUT, fut).await {
        Ok(r) => r,
        Err(_) => Err(DbError::Unavailable("operation timed out".to_string())),
    }
}

fn candidate_from_row(row: &tokio_postgres::Row) -> SongCandidate {
    SongCandidate {
        song: SongRef {
            id: row.get(0),
            title: row.get(1),
            artist: row.get(2),
            year: row.get(4),
        },
        artist_primary: row.get(3),
        popularity: row.get(5),
        similarity: row.get::<_, f64>(6) as f32,
    }
}

fn stored_message_from_row(row: &tokio_postgres::Row) -> StoredMessage {
    let song = row
        .get::<_, Option<String>>(8)
        .map(|song_id| SongRef {
            id: song_id,
            title: row.get(9),
            artist: row.get(10),
            year: row.get(11),
        });
    StoredMessage {
        id: row.get(0),
        room: row.get(1),
        user_id: row.get(2),
        handle: row.get(3),
        text: row.get(4),
        created_at: row.get(5),
        reply_to_message_id: row.get(6),
        scores: row.get(7),
        song,
    }
}

impl Db {
    pub fn connect(database_url: &str) -> Result<Self, FatalConfig> {
        let mut config = Config::new();
        config.url = Some(database_url.to_string());
        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        config.pool = Some(PoolConfig::new(POOL_MAX_SIZE));

        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| FatalConfig::DatabaseUnreachable(e.to_string()))?;
        Ok(Db { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, DbError> {
        self.pool.get().await.map_err(DbError::from)
    }

    /// Verify connectivity, catalog dimensionality and derive the index
    /// version. Dimension mismatch means the process refuses to serve.
    pub async fn startup_check(&self) -> Result<CatalogInfo, FatalConfig> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| FatalConfig::DatabaseUnreachable(e.to_string()))?;

        let dim_row = client
            .query_opt(
                "SELECT vector_dims(embedding_vector) FROM songs WHERE embedding_vector IS NOT NULL LIMIT 1",
                &[],
            )
            .await
            .map_err(|e| FatalConfig::DatabaseUnreachable(e.to_string()))?;
        if let Some(row) = dim_row {
            let dims: i32 = row.get(0);
            if dims as usize != EMBED_DIM {
                return Err(FatalConfig::DimensionMismatch {
                    source_name: "songs.embedding_vector",
                    expected: EMBED_DIM,
                    actual: dims as usize,
                });
            }
        }

        let row = client
            .query_one(
                "SELECT COUNT(*), COALESCE(MAX(created_at), 'epoch'::timestamptz) FROM songs WHERE NOT placeholder",
                &[],
            )
            .await
            .map_err(|e| FatalConfig::DatabaseUnreachable(e.to_string()))?;
        let song_count: i64 = row.get(0);
        let newest: DateTime<Utc> = row.get(1);
        let index_version = format!("songs:{}:{}", song_count, newest.timestamp());

        Ok(CatalogInfo {
            song_count,
            index_version,
        })
    }

    pub async fn ping(&self) -> bool {
        let probe = async {
            let client = self.client().await?;
            client.query_one("SELECT 1", &[]).await?;
            Ok::<_, DbError>(())
        };
        matches!(tokio::time::timeout(PING_TIMEOUT, probe).await, Ok(Ok(())))
    }

    pub async fn song_count(&self) -> Result<i64, DbError> {
        with_timeout(async {
            let client = self.client().await?;
            let row = client
                .query_one("SELECT COUNT(*) FROM songs WHERE NOT placeholder", &[])
                .await?;
            Ok(row.get(0))
        })
        .await
    }

    // --- Vector index boundary ---

    /// Approximate top-k over the catalog's HNSW index, cosine operator.
    /// Placeholder and unembedded rows never reach the caller. An empty
    /// result means the index has nothing to offer (empty catalog or
    /// index still building); there is no sequential-scan fallback here.
    pub async fn search_knn(
        &self,
        query: &[f32],
        k: usize,
        ef_search: u32,
    ) -> Result<Vec<SongCandidate>, DbError> {
        let vector = pgvector::Vector::from(query.to_vec());
        with_timeout(async {
            let mut client = self.client().await?;
            let tx = client.transaction().await?;
            // SET LOCAL takes no bind parameters; the value is a clamped integer.
            tx.batch_execute(&format!(
                "SET LOCAL hnsw.ef_search = {}",
                ef_search.clamp(10, 1000)
            ))
            .await?;
            let rows = tx
                .query(
                    "SELECT id, title, artist, artist_primary, year, popularity, \
                            1 - (embedding_vector <=> $1) AS similarity \
                     FROM songs \
                     WHERE embedding_vector IS NOT NULL AND NOT placeholder \
                     ORDER BY embedding_vector <=> $1 \
                     LIMIT $2",
                    &[&vector, &(k as i64)],
                )
                .await?;
            tx.commit().await?;
            Ok(rows.iter().map(candidate_from_row).collect())
        })
        .await
    }

    /// Popularity-ordered slice of the catalog, the matcher's fallback
    /// when no embedding or no KNN result is available. Similarity is 0.
    pub async fn top_by_popularity(&self, n: usize) -> Result<Vec<SongCandidate>, DbError> {
        with_timeout(async {
            let client = self.client().await?;
            let rows = client
                .query(
                    "SELECT id, title, artist, artist_primary, year, popularity, 0::float8 \
                     FROM songs WHERE NOT placeholder \
                     ORDER BY popularity DESC, id ASC LIMIT $1",
                    &[&(n as i64)],
                )
                .await?;
            Ok(rows.iter().map(candidate_from_row).collect())
        })
        .await
    }

    // --- Users and rooms ---

    /// First observed request creates the row; reconnects refresh
    /// `last_seen`. The handle is assigned exactly once.
    pub async fn get_or_create_user(
        &self,
        client_uuid: Uuid,
        ip_hash: &str,
    ) -> Result<User, DbError> {
        let handle = anon_handle_for(&client_uuid);
        with_timeout(async {
            let client = self.client().await?;
            let row = client
                .query_one(
                    "INSERT INTO users (id, anon_handle, ip_hash, created_at, last_seen) \
                     VALUES ($1, $2, $3, now(), now()) \
                     ON CONFLICT (id) DO UPDATE SET last_seen = now(), ip_hash = EXCLUDED.ip_hash \
                     RETURNING id, anon_handle",
                    &[&client_uuid, &handle, &ip_hash],
                )
                .await?;
            Ok(User {
                id: row.get(0),
                anon_handle: row.get(1),
            })
        })
        .await
    }

    pub async fn get_or_create_room(&self, name: &str) -> Result<(), DbError> {
        with_timeout(async {
            let client = self.client().await?;
            client
                .execute(
                    "INSERT INTO rooms (name, created_at) VALUES ($1, now()) \
                     ON CONFLICT (name) DO NOTHING",
                    &[&name],
                )
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomInfo>, DbError> {
        with_timeout(async {
            let client = self.client().await?;
            let rows = client
                .query(
                    "SELECT r.name, COUNT(m.id), MAX(m.created_at) \
                     FROM rooms r LEFT JOIN messages m ON m.room = r.name \
                     GROUP BY r.name \
                     ORDER BY MAX(m.created_at) DESC NULLS LAST, r.name ASC",
                    &[],
                )
                .await?;
            Ok(rows
                .iter()
                .map(|row| RoomInfo {
                    name: row.get(0),
                    message_count: row.get(1),
                    last_activity: row.get(2),
                })
                .collect())
        })
        .await
    }

    // --- Messages ---

    /// Insert one message. The id is server-assigned here; `reply_to` must
    /// reference an existing message in the same room; a repeated
    /// (user, clientTempId) pair returns the already-persisted row so a
    /// reconnect double-send never duplicates.
    pub async fn insert_message(
        &self,
        room: &str,
        user_id: Uuid,
        text: &str,
        song_id: Option<&str>,
        scores: &serde_json::Value,
        reply_to: Option<Uuid>,
        client_temp_id: Option<&str>,
    ) -> Result<InsertedMessage, DbError> {
        self.get_or_create_room(room).await?;
        with_timeout(async {
            let client = self.client().await?;

            if let Some(reply_id) = reply_to {
                let exists = client
                    .query_opt(
                        "SELECT 1 FROM messages WHERE id = $1 AND room = $2",
                        &[&reply_id, &room],
                    )
                    .await?
                    .is_some();
                if !exists {
                    return Err(DbError::ReplyNotFound);
                }
            }

            let id = Uuid::new_v4();
            let inserted = client
                .query_opt(
                    "INSERT INTO messages \
                         (id, room, user_id, text, song_id, scores, reply_to, client_temp_id, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now()) \
                     ON CONFLICT (user_id, client_temp_id) WHERE client_temp_id IS NOT NULL \
                         DO NOTHING \
                     RETURNING id, created_at",
                    &[
                        &id,
                        &room,
                        &user_id,
                        &text,
                        &song_id,
                        &scores,
                        &reply_to,
                        &client_temp_id,
                    ],
                )
                .await?;

            if let Some(row) = inserted {
                return Ok(InsertedMessage {
                    id: row.get(0),
                    created_at: row.get(1),
                    deduped: false,
                });
            }

            // Conflict on (user, clientTempId): surface the original row.
            let row = client
                .query_one(
                    "SELECT id, created_at FROM messages \
                     WHERE user_id = $1 AND client_temp_id = $2",
                    &[&user_id, &client_temp_id],
                )
                .await?;
            Ok(InsertedMessage {
                id: row.get(0),
                created_at: row.get(1),
                deduped: true,
            })
        })
        .await
    }

    /// Room of a message, or `NotFound`. Used to validate reaction targets.
    pub async fn message_room(&self, message_id: Uuid) -> Result<String, DbError> {
        with_timeout(async {
            let client = self.client().await?;
            let row = client
                .query_opt("SELECT room FROM messages WHERE id = $1", &[&message_id])
                .await?;
            row.map(|r| r.get(0)).ok_or(DbError::NotFound)
        })
        .await
    }

    /// Newest-first page, stable order (created_at DESC, id DESC).
    /// `before` is the id of the oldest message of the previous page.
    pub async fn list_messages(
        &self,
        room: &str,
        before: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, DbError> {
        with_timeout(async {
            let client = self.client().await?;
            let rows = client
                .query(
                    "SELECT m.id, m.room, m.user_id, u.anon_handle, m.text, m.created_at, \
                            m.reply_to, m.scores, s.id, s.title, s.artist, s.year \
                     FROM messages m \
                     JOIN users u ON u.id = m.user_id \
                     LEFT JOIN songs s ON s.id = m.song_id \
                     WHERE m.room = $1 \
                       AND ($2::uuid IS NULL OR (m.created_at, m.id) < \
                            (SELECT c.created_at, c.id FROM messages c WHERE c.id = $2)) \
                     ORDER BY m.created_at DESC, m.id DESC \
                     LIMIT $3",
                    &[&room, &before, &limit],
                )
                .await?;
            Ok(rows.iter().map(stored_message_from_row).collect())
        })
        .await
    }

    // --- Reactions ---

    /// True if the row was inserted; a duplicate is absorbed silently.
    pub async fn add_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> Result<bool, DbError> {
        with_timeout(async {
            let client = self.client().await?;
            let n = client
                .execute(
                    "INSERT INTO message_reactions (message_id, user_id, emoji, created_at) \
                     VALUES ($1, $2, $3, now()) \
                     ON CONFLICT (message_id, user_id, emoji) DO NOTHING",
                    &[&message_id, &user_id, &emoji],
                )
                .await?;
            Ok(n == 1)
        })
        .await
    }

    /// True if a row was deleted; removing an absent reaction is a no-op.
    pub async fn remove_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> Result<bool, DbError> {
        with_timeout(async {
            let client = self.client().await?;
            let n = client
                .execute(
                    "DELETE FROM message_reactions \
                     WHERE message_id = $1 AND user_id = $2 AND emoji = $3",
                    &[&message_id, &user_id, &emoji],
                )
                .await?;
            Ok(n == 1)
        })
        .await
    }

    /// Reactions for a set of messages grouped by emoji, reactor handles
    /// in first-reacted order.
    pub async fn aggregate_reactions(
        &self,
        message_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<ReactionGroup>>, DbError> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }
        with_timeout(async {
            let client = self.client().await?;
            let rows = client
                .query(
                    "SELECT r.message_id, r.emoji, COUNT(*), \
                            array_agg(u.anon_handle ORDER BY r.created_at) \
                     FROM message_reactions r \
                     JOIN users u ON u.id = r.user_id \
                     WHERE r.message_id = ANY($1) \
                     GROUP BY r.message_id, r.emoji \
                     ORDER BY r.message_id, MIN(r.created_at)",
                    &[&message_ids],
                )
                .await?;
            let mut grouped: HashMap<Uuid, Vec<ReactionGroup>> = HashMap::new();
            for row in rows {
                let message_id: Uuid = row.get(0);
                grouped.entry(message_id).or_default().push(ReactionGroup {
                    emoji: row.get(1),
                    count: row.get(2),
                    users: row.get(3),
                });
            }
            Ok(grouped)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_handles_are_stable() {
        let id = Uuid::new_v4();
        assert_eq!(anon_handle_for(&id), anon_handle_for(&id));
    }

    #[test]
    fn anon_handles_have_expected_shape() {
        let handle = anon_handle_for(&Uuid::new_v4());
        let parts: Vec<&str> = handle.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(ANIMALS.contains(&parts[1]));
        assert_eq!(parts[2].len(), 3);
    }

    #[test]
    fn anon_handles_spread_across_users() {
        let handles: std::collections::HashSet<String> = (0..64)
            .map(|_| anon_handle_for(&Uuid::new_v4()))
            .collect();
        // 24*24*4096 combinations; 64 draws colliding down to a handful
        // would mean the digest is not feeding the choice.
        assert!(handles.len() > 48);
    }
}
