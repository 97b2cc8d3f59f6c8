use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use xhbot_core::{GroupUserId, HandlerError, MessageHandler, Reply, SessionStore};

/// Inbound frame understood by [`DefaultMessageHandler`].
#[derive(Debug, Deserialize)]
struct InboundMessage {
    group_id: Option<i64>,
    user_id: Option<i64>,
    text: String,
}

/// Built-in handler: answers `ping`, echoes other text and counts each group
/// member's turns in their live session.
pub struct DefaultMessageHandler {
    sessions: Arc<dyn SessionStore>,
}

impl DefaultMessageHandler {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }
}

fn turn_of(payload: Option<&Value>) -> u64 {
    payload
        .and_then(|p| p.get("turn"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

#[async_trait]
impl MessageHandler for DefaultMessageHandler {
    async fn handle(&self, raw: &str) -> Result<Reply, HandlerError> {
        let msg: InboundMessage = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                return Ok(Reply::new(json!({
                    "type": "error",
                    "message": format!("invalid message: {e}"),
                })));
            }
        };

        let text = msg.text.trim();
        let identity = match (msg.group_id, msg.user_id) {
            (Some(group_id), Some(user_id)) => Some(GroupUserId::new(group_id, user_id)),
            _ => None,
        };

        if text.eq_ignore_ascii_case("ping") {
            let pong = Reply::new(json!({ "type": "pong" }));
            let Some(identity) = identity else {
                return Ok(pong);
            };
            // Keep a live session alive without counting a turn; never start one.
            let refreshed = self
                .sessions
                .update_at(identity, Utc::now(), &|prev: Option<&Value>| prev.cloned())
                .await?;
            return Ok(match refreshed {
                Some(_) => pong.with_identity(identity),
                None => pong,
            });
        }

        let Some(identity) = identity else {
            return Ok(Reply::new(json!({ "type": "reply", "text": text })));
        };

        let session = self
            .sessions
            .update_at(identity, Utc::now(), &|prev: Option<&Value>| {
                Some(json!({ "turn": turn_of(prev) + 1, "last_text": text }))
            })
            .await?
            .ok_or_else(|| HandlerError::Internal("session store declined a write".into()))?;
        let turn = turn_of(Some(&session.payload));

        Ok(Reply::new(json!({ "type": "reply", "text": text, "turn": turn })).with_identity(identity))
    }
}
