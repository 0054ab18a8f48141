//! Scripted walkthrough of the realtime layer against the in-memory backend.
//!
//! A buyer has one conversation open and in focus while a seller writes from
//! two conversations. Halfway through, the push channel is killed so the
//! Live → Degraded → Polling → Live cycle is visible in the output.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Args;
use realtime::{InMemoryBackend, RealtimeClient, SharedBackend, Subscription};
use serde_json::json;
use shared::{
    config::client::Config,
    models::{LinkState, Scope, SenderProfile},
};
use tokio::{sync::broadcast::error::RecvError, time};
use uuid::Uuid;

use super::{describe_notification, describe_record};
use crate::logging;

const STEP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Args, Debug)]
#[command(about = "Run the realtime layer against an in-memory backend and force a failover")]
pub struct DemoArgs {
    /// Path to the configuration file; only logging and realtime settings are used
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

async fn wait_state(subscription: &Subscription, state: LinkState) -> Result<()> {
    let mut status = subscription.status();
    time::timeout(STEP_TIMEOUT, status.wait_for(|s| s.state == state))
        .await
        .with_context(|| format!("timed out waiting for link state {state}"))?
        .context("subscription closed")?;
    Ok(())
}

async fn wait_records(subscription: &Subscription, count: usize) -> Result<()> {
    let mut records = subscription.records();
    time::timeout(STEP_TIMEOUT, records.wait_for(|s| s.loaded && s.len() >= count))
        .await
        .with_context(|| format!("timed out waiting for {count} records"))?
        .context("subscription closed")?;
    Ok(())
}

/// Runs the scripted failover walkthrough against an in-memory backend.
///
/// # Arguments
/// * `args` - Optional configuration file for logging and timing settings.
///
/// # Errors
/// Returns an error if a step times out or the unread counters drift.
pub async fn run(args: DemoArgs) -> Result<()> {
    let config = Config::load_config(args.config, None).context("failed to load configuration")?;
    logging::initialize_tracing(&config)?;
    let settings = config.realtime.clone();

    let backend = Arc::new(InMemoryBackend::new());
    let (buyer, seller) = (Uuid::new_v4(), Uuid::new_v4());
    backend.add_profile(SenderProfile {
        user_id: seller,
        display_name: "Road Bike Seller".to_string(),
        avatar_url: None,
    });
    let open_conversation = backend.create_conversation(buyer, seller);
    let other_conversation = backend.create_conversation(buyer, seller);
    for text in ["Hi! The bike is still available.", "I can do 420 if you pick it up."] {
        backend.insert_message(open_conversation, seller, json!({ "content": text }))?;
    }
    println!(
        "buyer {buyer} has {} unread in the open conversation",
        backend.unread_count(open_conversation, buyer)
    );

    let shared: SharedBackend = backend.clone();
    let client = RealtimeClient::new(shared, settings.clone(), buyer);
    client.on_notification(|event| println!("notification: {}", describe_notification(event)));
    client.start();
    client.set_focus(Some(open_conversation));

    let view = client.open_subscription(Scope::Conversation(open_conversation));
    let mut transitions = view.transitions();
    let printer = tokio::spawn(async move {
        loop {
            match transitions.recv().await {
                Ok(status) => {
                    println!("link: {status}");
                    if status.is_closed() {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    wait_state(&view, LinkState::Live).await?;
    wait_records(&view, 2).await?;
    time::sleep(settings.mark_read_debounce() + Duration::from_millis(200)).await;
    println!(
        "conversation loaded with {} messages; server unread after viewing: {}",
        view.snapshot().len(),
        backend.unread_count(open_conversation, buyer)
    );

    backend.insert_message(
        other_conversation,
        seller,
        json!({ "content": "Also selling a helmet, interested?" }),
    )?;
    time::sleep(Duration::from_millis(200)).await;

    println!("killing the push channel");
    backend.fail_push("503", "realtime node restarted");
    backend.insert_message(
        open_conversation,
        seller,
        json!({ "content": "Sent while the push channel was down" }),
    )?;
    wait_state(&view, LinkState::Polling).await?;
    wait_records(&view, 3).await?;
    wait_state(&view, LinkState::Live).await?;

    let sent = client
        .send_message(open_conversation, json!({ "content": "Deal, see you at six." }))
        .await
        .context("failed to send reply")?;
    println!("sent {}", sent.id);
    wait_records(&view, 4).await?;

    for record in &view.snapshot().records {
        println!("  {}", describe_record(record));
    }
    let consistent = backend.counters_consistent(open_conversation)
        && backend.counters_consistent(other_conversation);
    println!(
        "server unread: open conversation {}, other conversation {}, counters consistent: {consistent}",
        backend.unread_count(open_conversation, buyer),
        backend.unread_count(other_conversation, buyer)
    );

    client.sign_out();
    let _ = printer.await;
    if !consistent {
        bail!("unread counters drifted from read flags");
    }
    println!("demo complete");
    Ok(())
}
