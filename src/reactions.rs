use std::sync::Arc;

use uuid::Uuid;

use crate::bus::Bus;
use crate::chat::ConnCtx;
use crate::connection::ConnectionManager;
use crate::db::Db;
use crate::error::DbError;
use crate::events::ServerFrame;

/// Single emoji or short code.
const MAX_EMOJI_BYTES: usize = 32;

/// Add/remove reactions with idempotent semantics: the unique key on
/// (message, user, emoji) collapses retries and duplicate bus deliveries
/// into no-ops, so optimistic client toggles are always safe. Events are
/// only emitted on actual state changes.
pub struct ReactionService {
    db: Db,
    connections: Arc<ConnectionManager>,
    bus: Arc<Bus>,
}

impl ReactionService {
    pub fn new(db: Db, connections: Arc<ConnectionManager>, bus: Arc<Bus>) -> Self {
        Self {
            db,
            connections,
            bus,
        }
    }

    fn send_error(&self, ctx: &ConnCtx, message: impl Into<String>) {
        self.connections
            .send(&ctx.room, ctx.connection_id, ServerFrame::error(message));
    }

    fn validate_emoji<'a>(&self, ctx: &ConnCtx, emoji: &'a str) -> Option<&'a str> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            self.send_error(ctx, "emoji must not be empty");
            return None;
        }
        if emoji.len() > MAX_EMOJI_BYTES {
            self.send_error(ctx, "emoji too long");
            return None;
        }
        Some(emoji)
    }

    /// The reacted-to message's room, validated to exist.
    async fn target_room(&self, ctx: &ConnCtx, message_id: Uuid) -> Option<String> {
        match self.db.message_room(message_id).await {
            Ok(room) => Some(room),
            Err(DbError::NotFound) => {
                self.send_error(ctx, "message not found");
                None
            }
            Err(e) => {
                self.send_error(ctx, e.to_string());
                None
            }
        }
    }

    pub async fn add(&self, ctx: &ConnCtx, message_id: Uuid, emoji: &str) {
        let Some(emoji) = self.validate_emoji(ctx, emoji) else {
            return;
        };
        let Some(room) = self.target_room(ctx, message_id).await else {
            return;
        };
        match self.db.add_reaction(message_id, ctx.user_id, emoji).await {
            Ok(true) => {
                let frame = ServerFrame::ReactionAdded {
                    message_id,
                    emoji: emoji.to_string(),
                    user_id: ctx.user_id,
                    handle: ctx.handle.clone(),
                };
                self.connections.broadcast(&room, &frame, None);
                self.bus.publish_chat("reaction_add", &room, &frame);
            }
            Ok(false) => {} // already reacted — silent no-op
            Err(e) => self.send_error(ctx, e.to_string()),
        }
    }

    pub async fn remove(&self, ctx: &ConnCtx, message_id: Uuid, emoji: &str) {
        let Some(emoji) = self.validate_emoji(ctx, emoji) else {
            return;
        };
        let Some(room) = self.target_room(ctx, message_id).await else {
            return;
        };
        match self
            .db
            .remove_reaction(message_id, ctx.user_id, emoji)
            .await
        {
            Ok(true) => {
                let frame = ServerFrame::ReactionRemoved {
                    message_id,
                    emoji: emoji.to_string(),
                    user_id: ctx.user_id,
                };
                self.connections.broadcast(&room, &frame, None);
                self.bus.publish_chat("reaction_remove", &room, &frame);
            }
            Ok(false) => {} // nothing to remove — silent no-op
            Err(e) => self.send_error(ctx, e.to_string()),
        }
    }
}
