//! Components served by this binary.

use anyhow::{Result, bail};
use lib_live::{ActionContext, ComponentDefinition, ComponentRegistry};
use serde_json::{Value, json};
use tracing::info;

const CHAT_HISTORY_LIMIT: usize = 50;

/// Replaces blocked words in chat messages with asterisks.
pub struct MessageFilter {
    blocked: Vec<String>,
}

impl MessageFilter {
    pub fn new(blocked: &[&str]) -> Self {
        Self {
            blocked: blocked.iter().map(|w| w.to_lowercase()).collect(),
        }
    }

    pub fn clean(&self, text: &str) -> String {
        text.split(' ')
            .map(|word| {
                if self.blocked.contains(&word.to_lowercase()) {
                    "*".repeat(word.chars().count())
                } else {
                    word.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn step(payload: &Value) -> i64 {
    payload.get("step").and_then(Value::as_i64).unwrap_or(1)
}

fn count(ctx: &ActionContext<'_>) -> i64 {
    ctx.get("count").and_then(Value::as_i64).unwrap_or(0)
}

pub fn counter() -> ComponentDefinition {
    ComponentDefinition::builder("Counter")
        .initial_state(json!({"count": 0}))
        .action("increment", |ctx, payload| {
            let next = count(ctx) + step(&payload);
            ctx.set("count", json!(next));
            Ok(json!({"count": next}))
        })
        .action("decrement", |ctx, payload| {
            let next = count(ctx) - step(&payload);
            ctx.set("count", json!(next));
            Ok(json!({"count": next}))
        })
        .action("reset", |ctx, _| {
            ctx.set("count", json!(0));
            Ok(json!({"count": 0}))
        })
        .build()
}

fn send_message(ctx: &mut ActionContext<'_>, payload: Value) -> Result<Value> {
    let Some(text) = payload.get("text").and_then(Value::as_str) else {
        bail!("'text' is required");
    };
    if text.trim().is_empty() {
        bail!("message is empty");
    }
    let text = match ctx.service::<MessageFilter>("message_filter") {
        Some(filter) => filter.clean(text),
        None => text.to_string(),
    };
    let author = payload
        .get("author")
        .and_then(Value::as_str)
        .or(ctx.user_id())
        .unwrap_or("anonymous")
        .to_string();

    let message = json!({
        "author": author,
        "text": text,
        "sentAt": lib_live::utils::now_millis(),
    });

    let mut history = ctx
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    history.push(message.clone());
    if history.len() > CHAT_HISTORY_LIMIT {
        let excess = history.len() - CHAT_HISTORY_LIMIT;
        history.drain(..excess);
    }
    let total = history.len();
    ctx.set("messages", Value::Array(history));
    ctx.broadcast("message", message.clone());
    Ok(json!({"message": message, "total": total}))
}

pub fn chat() -> ComponentDefinition {
    ComponentDefinition::builder("Chat")
        .initial_state(json!({"messages": []}))
        .depends_on("message_filter", false)
        .action("send", send_message)
        .action("clear", |ctx, _| {
            ctx.set("messages", json!([]));
            ctx.broadcast("cleared", Value::Null);
            Ok(json!({"total": 0}))
        })
        .on_mount(|ctx| {
            let owner = ctx.user_id().unwrap_or("anonymous").to_string();
            ctx.set("owner", json!(owner));
            Ok(())
        })
        .build()
}

/// Registers services and component definitions on the registry.
pub fn register_all(registry: &ComponentRegistry) {
    registry
        .services()
        .register_singleton("message_filter", MessageFilter::new(&["spam", "scam"]));
    registry.register(counter());
    registry.register(chat());
    info!(components = ?registry.definition_names(), "components registered");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_masks_blocked_words() {
        let filter = MessageFilter::new(&["spam"]);
        assert_eq!(filter.clean("no SPAM here"), "no **** here");
        assert_eq!(filter.clean("clean text"), "clean text");
    }

    #[test]
    fn test_step_defaults_to_one() {
        assert_eq!(step(&json!({})), 1);
        assert_eq!(step(&json!({"step": 5})), 5);
    }
}
