//! `mark-read`: one-off read receipt.

use anyhow::{Context, Result};
use clap::Args;
use realtime::{MarkReadOutcome, ReadReceiptSynchronizer};
use uuid::Uuid;

use super::BackendArgs;

#[derive(Args, Debug)]
#[command(about = "Mark every message in a conversation read for a user")]
pub struct MarkReadArgs {
    /// Conversation to mark read
    #[arg(long, alias = "conv")]
    pub conversation: Uuid,

    /// The reader
    #[arg(long)]
    pub user: Uuid,

    #[command(flatten)]
    pub backend: BackendArgs,
}

/// Marks every inbound message of a conversation read for one user.
///
/// # Arguments
/// * `args` - Conversation, reader and backend options.
///
/// # Errors
/// Returns an error if setup fails or the backend rejects the write.
pub async fn run(args: MarkReadArgs) -> Result<()> {
    let (config, backend) = args.backend.prepare()?;
    let synchronizer = ReadReceiptSynchronizer::new(backend, &config.realtime);

    let outcome = synchronizer
        .mark_read(args.conversation, args.user)
        .await
        .context("failed to write read receipt")?;

    match outcome {
        MarkReadOutcome::Marked(count) => println!("marked {count} messages read"),
        MarkReadOutcome::NothingUnread => println!("nothing unread"),
        MarkReadOutcome::Dropped => {
            println!("read receipt kept losing write races; the next sync will correct it");
        }
    }
    Ok(())
}
