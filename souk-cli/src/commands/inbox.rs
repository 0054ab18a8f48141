//! `inbox`: unread counts and notifications for the signed-in user.

use anyhow::{Context, Result};
use clap::Args;
use realtime::RealtimeClient;
use tokio::signal;
use uuid::Uuid;

use super::{BackendArgs, describe_notification};

#[derive(Args, Debug)]
#[command(about = "Show unread counts per conversation and, optionally, follow notifications")]
pub struct InboxArgs {
    /// The signed-in user whose inbox to open
    #[arg(long)]
    pub user: Uuid,

    /// Keep running and print notifications until Ctrl-C
    #[arg(long)]
    pub follow: bool,

    #[command(flatten)]
    pub backend: BackendArgs,
}

/// Prints the signed-in user's unread count per conversation, then follows
/// notifications when `--follow` is set.
///
/// # Arguments
/// * `args` - User, follow flag and backend options.
///
/// # Errors
/// Returns an error if setup fails or the inbox closes before loading.
pub async fn run(args: InboxArgs) -> Result<()> {
    let (config, backend) = args.backend.prepare()?;
    let client = RealtimeClient::new(backend, config.realtime.clone(), args.user);
    if args.follow {
        client.on_notification(|event| println!("{}", describe_notification(event)));
    }
    client.start();

    let mut inbox = client
        .inbox_records()
        .context("inbox subscription did not start")?;
    inbox
        .wait_for(|snapshot| snapshot.loaded)
        .await
        .context("inbox closed before loading")?;

    let unread = client.inbox_unread();
    if unread.is_empty() {
        println!("no unread messages");
    }
    for (conversation, count) in &unread {
        println!("{conversation}: {count} unread");
    }

    if args.follow {
        println!("following notifications; press Ctrl-C to stop");
        signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    }
    client.sign_out();
    Ok(())
}
