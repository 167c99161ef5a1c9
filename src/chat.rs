use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::bus::Bus;
use crate::connection::{ConnectionId, ConnectionManager};
use crate::db::Db;
use crate::error::{ChatError, DbError};
use crate::events::ServerFrame;
use crate::matcher::{MAX_TEXT_CODEPOINTS, MatchOptions, SongMatcher};
use crate::models::DisplayMessage;
use crate::rate_limit::RateLimiter;

/// Message text contract: non-empty after trim, at most 500 code points.
/// Code points, not bytes — a 500-emoji message is fine.
pub fn validate_text(text: &str) -> Result<&str, ChatError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ChatError::Validation("text must not be empty".to_string()));
    }
    if text.chars().count() > MAX_TEXT_CODEPOINTS {
        return Err(ChatError::Validation(format!(
            "text must be at most {MAX_TEXT_CODEPOINTS} characters"
        )));
    }
    Ok(text)
}

/// Everything the services need to know about the originating socket.
#[derive(Debug, Clone)]
pub struct ConnCtx {
    pub connection_id: ConnectionId,
    pub room: String,
    pub user_id: Uuid,
    pub handle: String,
    pub ip_hash: String,
}

/// End-to-end pipeline for one user message:
/// validate → rate-limit → match → persist → broadcast + bus publish.
///
/// Failure policy: validation and rate-limit errors go to the sender only
/// and nothing is broadcast; a failed write downgrades the envelope to
/// `durable:false` but the room still hears the message. Only the catalog
/// is allowed to be silent — never the user.
pub struct ChatService {
    db: Db,
    matcher: Arc<SongMatcher>,
    connections: Arc<ConnectionManager>,
    bus: Arc<Bus>,
    limiter: Arc<RateLimiter>,
}

impl ChatService {
    pub fn new(
        db: Db,
        matcher: Arc<SongMatcher>,
        connections: Arc<ConnectionManager>,
        bus: Arc<Bus>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            db,
            matcher,
            connections,
            bus,
            limiter,
        }
    }

    fn send_error(&self, ctx: &ConnCtx, message: impl Into<String>) {
        self.connections
            .send(&ctx.room, ctx.connection_id, ServerFrame::error(message));
    }

    pub async fn handle_user_message(
        &self,
        ctx: &ConnCtx,
        text: &str,
        reply_to: Option<Uuid>,
        client_temp_id: Option<&str>,
    ) {
        let text = match validate_text(text) {
            Ok(text) => text,
            Err(e) => {
                self.send_error(ctx, e.to_string());
                return;
            }
        };

        if !self.limiter.check(&ctx.ip_hash) {
            let (max, window_secs) = self.limiter.limits();
            self.send_error(ctx, ChatError::RateLimited { max, window_secs }.to_string());
            return;
        }

        let matched = match self.matcher.match_text(text, MatchOptions::default()).await {
            Ok(result) => result,
            Err(ChatError::Validation(reason)) => {
                self.send_error(ctx, reason);
                return;
            }
            Err(e) => {
                self.send_error(ctx, e.to_string());
                return;
            }
        };

        // The reasoning rides inside the blob so history can rebuild the
        // full envelope from the row alone.
        let mut scores = serde_json::to_value(&matched.scores).unwrap_or_default();
        if let Some(obj) = scores.as_object_mut() {
            obj.insert(
                "reasoning".to_string(),
                serde_json::Value::String(matched.reasoning.clone()),
            );
        }
        let song_id = matched.primary.as_ref().map(|s| s.id.as_str());

        let insert = self
            .db
            .insert_message(
                &ctx.room,
                ctx.user_id,
                text,
                song_id,
                &scores,
                reply_to,
                client_temp_id,
            )
            .await;

        let display = match insert {
            Ok(inserted) if inserted.deduped => {
                // Reconnect double-send: peers already saw this message,
                // only the sender needs its confirmation envelope back.
                let frame = ServerFrame::Display(DisplayMessage {
                    id: inserted.id,
                    room: ctx.room.clone(),
                    user_id: ctx.user_id,
                    handle: ctx.handle.clone(),
                    text: text.to_string(),
                    created_at: inserted.created_at,
                    reply_to_message_id: reply_to,
                    song: matched.primary.clone(),
                    scores,
                    reasoning: matched.reasoning.clone(),
                    similarity: matched.similarity(),
                    durable: true,
                });
                self.connections.send(&ctx.room, ctx.connection_id, frame);
                return;
            }
            Ok(inserted) => DisplayMessage {
                id: inserted.id,
                room: ctx.room.clone(),
                user_id: ctx.user_id,
                handle: ctx.handle.clone(),
                text: text.to_string(),
                created_at: inserted.created_at,
                reply_to_message_id: reply_to,
                song: matched.primary.clone(),
                scores,
                reasoning: matched.reasoning.clone(),
                similarity: matched.similarity(),
                durable: true,
            },
            Err(DbError::ReplyNotFound) => {
                self.send_error(ctx, "replied-to message not found in this room");
                return;
            }
            Err(e) => {
                // Broadcast anyway under a transient id; the write failed,
                // the conversation must not.
                eprintln!("⚠️  Message write failed, broadcasting non-durable: {e}");
                DisplayMessage {
                    id: Uuid::new_v4(),
                    room: ctx.room.clone(),
                    user_id: ctx.user_id,
                    handle: ctx.handle.clone(),
                    text: text.to_string(),
                    created_at: Utc::now(),
                    reply_to_message_id: reply_to,
                    song: matched.primary.clone(),
                    scores,
                    reasoning: matched.reasoning.clone(),
                    similarity: matched.similarity(),
                    durable: false,
                }
            }
        };

        let frame = ServerFrame::Display(display);
        self.connections.broadcast(&ctx.room, &frame, None);
        self.bus.publish_chat("message", &ctx.room, &frame);
    }
}
