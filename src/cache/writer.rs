use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use rusqlite::Connection;
use tracing::{debug, error, info};

use super::types::{PersistenceMode, StorageOp, StoreCommand};
use super::sqlite::exec_op;

pub async fn run_writer(
    mut rx: mpsc::Receiver<StoreCommand>,
    db_path: PathBuf,
    mode: PersistenceMode,
) {
    let mut conn = match Connection::open(&db_path) {
        Ok(c) => c,
        Err(e) => {
            error!("Cannot open state cache DB at {:?}: {}", db_path, e);
            return;
        }
    };

    info!("State cache writer started for {:?}", db_path);

    let mut flush_timer = match mode {
        PersistenceMode::Async { flush_ms } => {
            let mut t = tokio::time::interval(Duration::from_millis(flush_ms.max(1)));
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            Some(t)
        }
        _ => None,
    };

    let batched = flush_timer.is_some();
    let mut batch = Vec::new();
    let mut waiters = Vec::new();

    loop {
        tokio::select! {
            maybe_cmd = rx.recv() => {
                let Some(cmd) = maybe_cmd else { break };
                let is_sync_req = cmd.sync_channel.is_some();
                if let Some(ch) = cmd.sync_channel {
                    waiters.push(ch);
                }
                batch.push(cmd.op);

                if is_sync_req || !batched {
                    flush_batch(&mut conn, &mut batch, &mut waiters);
                }
            }

            _ = async {
                match flush_timer.as_mut() {
                    Some(timer) => { timer.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if !batch.is_empty() {
                    flush_batch(&mut conn, &mut batch, &mut waiters);
                }
            }
        }
    }

    // Channel closed: commit whatever is still pending
    if !batch.is_empty() {
        flush_batch(&mut conn, &mut batch, &mut waiters);
    }
    debug!("State cache writer for {:?} stopped", db_path);
}

fn flush_batch(
    conn: &mut Connection,
    batch: &mut Vec<StorageOp>,
    waiters: &mut Vec<oneshot::Sender<Result<(), String>>>,
) {
    // Single-slot tables: only the last write of each kind matters
    let mut last_snapshot = None;
    let mut last_config = None;
    for op in batch.drain(..) {
        match op {
            StorageOp::SaveSnapshot { .. } => last_snapshot = Some(op),
            StorageOp::SaveConfig(_) => last_config = Some(op),
        }
    }

    let tx = match conn.transaction() {
        Ok(t) => t,
        Err(e) => {
            error!("Failed to start transaction: {}", e);
            notify_all(waiters, Err(e.to_string()));
            return;
        }
    };

    let mut failure = None;
    for op in last_snapshot.iter().chain(last_config.iter()) {
        if let Err(e) = exec_op(&tx, op) {
            error!("Failed to exec op {:?}: {}", op, e);
            failure.get_or_insert_with(|| e.to_string());
        }
    }

    match tx.commit() {
        Ok(_) => notify_all(waiters, failure.map_or(Ok(()), Err)),
        Err(e) => {
            error!("Failed to commit batch: {}", e);
            notify_all(waiters, Err(e.to_string()));
        }
    }
}

fn notify_all(
    waiters: &mut Vec<oneshot::Sender<Result<(), String>>>,
    result: Result<(), String>,
) {
    for ch in waiters.drain(..) {
        let _ = ch.send(result.clone());
    }
}
