//! `watch`: follows one scope live.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Args;
use realtime::{StoreSnapshot, TransportSupervisor};
use shared::models::{EventFilter, Scope};
use tokio::{signal, sync::broadcast::error::RecvError, time};

use super::{BackendArgs, describe_record};

#[derive(Args, Debug)]
#[command(about = "Follow a scope live and print every change and link-state transition")]
pub struct WatchArgs {
    /// Scope to follow: `conversation:<uuid>`, `inbox:<uuid>` or `feed:<status>`
    pub scope: Scope,

    /// Change kinds to receive, comma separated
    #[arg(long, default_value = "insert,update,delete")]
    pub events: EventFilter,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub duration: Option<u64>,

    #[command(flatten)]
    pub backend: BackendArgs,
}

/// Prints every record change and link-state transition of `args.scope`
/// until Ctrl-C or the optional duration elapses.
///
/// # Arguments
/// * `args` - Scope, event filter, duration and backend options.
///
/// # Errors
/// Returns an error if configuration, logging or the backend cannot be set up.
pub async fn run(args: WatchArgs) -> Result<()> {
    let (config, backend) = args.backend.prepare()?;
    let supervisor = TransportSupervisor::new(backend, config.realtime.clone());
    let subscription = supervisor.open(args.scope.clone(), args.events);
    let mut transitions = subscription.transitions();
    let mut records = subscription.records();
    println!("watching {} ({})", args.scope, args.events);

    let stop = async {
        match args.duration {
            Some(seconds) => time::sleep(Duration::from_secs(seconds)).await,
            None => {
                let _ = signal::ctrl_c().await;
            }
        }
    };
    tokio::pin!(stop);

    let mut previous = subscription.snapshot();
    loop {
        tokio::select! {
            () = &mut stop => break,
            status = transitions.recv() => match status {
                Ok(status) => println!("link: {status}"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            changed = records.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = Arc::clone(&records.borrow_and_update());
                for line in describe_changes(&previous, &next) {
                    println!("{line}");
                }
                previous = next;
            }
        }
    }

    subscription.close();
    println!(
        "{} records, link {}",
        previous.len(),
        subscription.current_status()
    );
    Ok(())
}

/// Lines describing how `next` differs from `previous`.
fn describe_changes(previous: &StoreSnapshot, next: &StoreSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    for record in &next.records {
        match previous.get(record.id) {
            None => lines.push(format!("+ {}", describe_record(record))),
            Some(old) if old != record => lines.push(format!("~ {}", describe_record(record))),
            Some(_) => {}
        }
    }
    for record in &previous.records {
        if next.get(record.id).is_none() {
            lines.push(format!("- {}", record.id));
        }
    }
    lines
}
