//! Mailroom - runs the task foremen, crons and internal HTTP API.
//!
//! Configuration is via environment variables (a `.env` file is honored):
//! - MAILROOM_DB: Postgres URL, or `memory` for an in-process store (required)
//! - MAILROOM_READONLY_DB: optional read replica URL
//! - MAILROOM_REDIS: Redis URL (default: redis://localhost:6379/15)
//! - MAILROOM_ADDRESS: HTTP listen address (default: 0.0.0.0:8090)
//! - MAILROOM_DOMAIN: domain used in provider callback URLs (default: localhost)
//! - MAILROOM_AUTH_TOKEN: bearer token required by the internal API
//! - MAILROOM_LOG_LEVEL / MAILROOM_LOG_FORMAT: tracing filter and `text` or `json`
//! - MAILROOM_WORKERS_REALTIME / _BATCH / _THROTTLED: workers per queue

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use mailroom::crons::{ALL_JOBS, Cron};
use mailroom::queues::{BATCH, REALTIME, THROTTLED};
use mailroom::tasks::worker::{Foreman, ForemanConfig};
use mailroom::{Config, Runtime, web};
use mailroom_observability_setup::ObservabilityOptions;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    mailroom_observability_setup::init(ObservabilityOptions {
        level: Some(config.log_level.clone()),
        format: config.log_format,
    });

    info!(
        instance_id = %config.instance_id,
        address = %config.address,
        domain = %config.domain,
        workers_realtime = config.workers_realtime,
        workers_batch = config.workers_batch,
        workers_throttled = config.workers_throttled,
        "starting mailroom"
    );
    if config.sentry_dsn.is_some() {
        warn!("MAILROOM_SENTRY_DSN is set but error reporting isn't built into this binary");
    }

    let listener = TcpListener::bind(config.address)
        .await
        .with_context(|| format!("failed to bind {}", config.address))?;
    let workers = [
        (REALTIME, config.workers_realtime),
        (BATCH, config.workers_batch),
        (THROTTLED, config.workers_throttled),
    ];
    let rt = Arc::new(Runtime::connect(config).await?);
    let shutdown_token = CancellationToken::new();

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    for (queue, count) in workers {
        let foreman = Foreman {
            rt: rt.clone(),
            config: ForemanConfig::new(queue, count),
        };
        handles.push(tokio::spawn(foreman.run(shutdown_token.clone().cancelled_owned())));
    }
    for job in ALL_JOBS {
        let cron = Cron { rt: rt.clone(), job };
        handles.push(tokio::spawn(cron.run(shutdown_token.clone().cancelled_owned())));
    }

    let web_handle = tokio::spawn(web::serve(listener, rt.clone(), shutdown_token.clone()));

    let shutdown_handle = tokio::spawn({
        let shutdown_token = shutdown_token.clone();
        async move {
            if let Err(err) = wait_for_shutdown().await {
                error!(error = %err, "shutdown signal listener failed");
                return;
            }
            info!("shutdown signal received");
            shutdown_token.cancel();
        }
    });

    shutdown_token.cancelled().await;
    let _ = shutdown_handle.await;

    if tokio::time::timeout(Duration::from_secs(10), join_all(handles))
        .await
        .is_err()
    {
        warn!("foremen and crons didn't stop in time");
    }
    match tokio::time::timeout(Duration::from_secs(5), web_handle).await {
        Ok(Ok(Err(err))) => error!(error = %err, "web server failed"),
        Err(_) => warn!("web server didn't stop in time"),
        _ => {}
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut terminate = unix_signal(SignalKind::terminate())?;
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received");
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}
