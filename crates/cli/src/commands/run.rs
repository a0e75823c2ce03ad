use std::sync::Arc;

use foursight_engine::{Config, Scheduler, WorkerPool};
use tokio::sync::watch;

use super::CmdResult;
use crate::admin::{self, AdminState};
use crate::deploy::Deployment;

/// Scheduler, both worker pools and (unless disabled) the admin surface,
/// until ctrl-c. Work in progress finishes before the process exits.
pub(crate) async fn cmd_run(deploy: Deployment, config: &Config, with_admin: bool) -> CmdResult {
    let Deployment { ctx, schedule } = deploy;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(ctx.clone(), schedule);
    let scheduler_rx = shutdown_rx.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_rx).await });

    let primary = WorkerPool::spawn(
        "primary",
        ctx.clone(),
        ctx.queues.primary.clone(),
        config.worker.pool_size,
        shutdown_rx.clone(),
    );
    let secondary = WorkerPool::spawn(
        "secondary",
        ctx.clone(),
        ctx.queues.secondary.clone(),
        config.worker.secondary_pool_size,
        shutdown_rx.clone(),
    );

    let mut admin_task = if with_admin {
        let state = Arc::new(AdminState::new(ctx.clone(), config.admin.api_key.clone()));
        let bind = config.admin.bind.clone();
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move { admin::serve(&bind, state, rx).await }))
    } else {
        None
    };

    tracing::info!(
        stage = %ctx.stage,
        environments = ctx.environments.len(),
        workers = primary.len(),
        secondary_workers = secondary.len(),
        "foursight running"
    );

    // The admin surface failing to start (port taken) ends the daemon too.
    let early = match admin_task.as_mut() {
        Some(task) => tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                log_signal(signal);
                None
            }
            joined = task => Some(joined),
        },
        None => {
            log_signal(tokio::signal::ctrl_c().await);
            None
        }
    };

    if shutdown_tx.send(true).is_err() {
        tracing::debug!("every shutdown receiver already gone");
    }
    primary.join().await;
    secondary.join().await;
    if let Err(e) = scheduler_task.await {
        tracing::error!(error = %e, "scheduler task failed");
    }

    let admin = match (early, admin_task) {
        (Some(joined), _) => Some(joined),
        (None, Some(task)) => Some(task.await),
        (None, None) => None,
    };
    match admin {
        Some(Ok(Err(e))) => Err(format!("admin surface failed: {}", e).into()),
        Some(Err(e)) => Err(e.into()),
        _ => {
            tracing::info!("foursight stopped");
            Ok(())
        }
    }
}

fn log_signal(signal: std::io::Result<()>) {
    match signal {
        Ok(()) => tracing::info!("shutdown requested"),
        Err(e) => tracing::error!(error = %e, "cannot listen for ctrl-c, shutting down"),
    }
}
