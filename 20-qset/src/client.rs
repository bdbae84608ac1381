//! Command handlers for the `qset` binary. Elements are plain strings.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::{select, time};
use tracing::{info, warn};

use crate::{
    cli::{SetArgs, SetTarget, WatchArgs},
    qset::QSet,
    store::RemoteStore,
};

/// Connects a string replica to the store server and runs `init`.
pub async fn open(target: &SetTarget) -> Result<QSet<String>> {
    let writer = RemoteStore::connect(target.server)
        .await
        .with_context(|| format!("failed to connect to {}", target.server))?;
    let subscriber = RemoteStore::connect(target.server)
        .await
        .with_context(|| format!("failed to connect to {}", target.server))?;
    info!(server = %target.server, key = %target.key, "connected");

    let set = QSet::new()
        .with_writer(Arc::new(writer))
        .with_subscriber(Arc::new(subscriber))
        .with_set_key(target.key.clone())
        .with_identity_codec();
    set.init().await?;
    if let Some(err) = set.last_state() {
        warn!(error = %err, "replica started degraded");
    }
    Ok(set)
}

pub async fn set(args: SetArgs) -> Result<()> {
    let replica = open(&args.target).await?;
    let at = args.at.unwrap_or_else(Utc::now);

    replica.set(&args.element, at).await;
    replica.sync().await;
    replica.quit().await;

    if let Some(err) = replica.last_state() {
        return Err(err).context("write was not persisted");
    }
    println!("{} {}", args.element, at.to_rfc3339());
    Ok(())
}

pub async fn list(target: SetTarget) -> Result<()> {
    let replica = open(&target).await?;
    for element in replica.list() {
        match replica.get(&element) {
            Some(at) => println!("{element} {}", at.to_rfc3339()),
            None => println!("{element}"),
        }
    }
    replica.quit().await;
    Ok(())
}

pub async fn watch(args: WatchArgs) -> Result<()> {
    let replica = open(&args.target).await?;
    let mut ticker = time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut last_len = None;

    loop {
        select! {
            _ = ticker.tick() => {
                let len = replica.len();
                if last_len != Some(len) {
                    println!("{}: {len} members", args.target.key);
                    last_len = Some(len);
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(err) = ctrl_c {
                    warn!(error = ?err, "failed to listen for ctrl-c");
                }
                break;
            }
        }
    }

    replica.quit().await;
    Ok(())
}
