//! `send`: posts a message into a conversation.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::{Value, json};
use shared::models::MessageDraft;
use uuid::Uuid;

use super::BackendArgs;

#[derive(Args, Debug)]
#[command(about = "Send a message into a conversation")]
pub struct SendArgs {
    /// Conversation to post into
    #[arg(long, alias = "conv")]
    pub conversation: Uuid,

    /// The sender
    #[arg(long)]
    pub user: Uuid,

    /// Treat the message text as a raw JSON payload
    #[arg(long)]
    pub json: bool,

    /// Message text
    #[arg()]
    pub text: String,

    #[command(flatten)]
    pub backend: BackendArgs,
}

fn payload(text: &str, raw_json: bool) -> Result<Value> {
    if raw_json {
        serde_json::from_str(text).context("message is not valid JSON")
    } else {
        Ok(json!({ "content": text }))
    }
}

/// Posts a message and prints the stored record as JSON.
///
/// # Arguments
/// * `args` - Conversation, sender, text and backend options.
///
/// # Errors
/// Returns an error if the payload is not valid JSON under `--json`, or the
/// backend rejects the post.
pub async fn run(args: SendArgs) -> Result<()> {
    let payload = payload(&args.text, args.json)?;
    let (_, backend) = args.backend.prepare()?;
    let draft = MessageDraft {
        conversation_id: args.conversation,
        sender_id: args.user,
        payload,
        client_ref: Uuid::new_v4(),
    };

    let record = backend
        .post_message(&draft)
        .await
        .context("failed to send message")?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
