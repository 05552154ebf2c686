use std::future::Future;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use task_queue_worker::{exit_status, shutdown_channel, LoggingHandler, ShutdownSender, Worker, WorkerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    log::info!("Task queue worker is starting...");

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            return ExitCode::from(1);
        }
    };
    match serde_json::to_string(&config) {
        Ok(json) => log::debug!("Effective configuration: {}", json),
        Err(e) => log::debug!("Could not render configuration: {}", e),
    }

    let (sender, token) = shutdown_channel();
    tokio::spawn(forward_signals(sender));

    let worker = Worker::amqp(Arc::new(LoggingHandler), config);
    let result = worker.run(token).await;
    if let Err(e) = &result {
        log::error!("{}", e);
    }

    log::info!("Task queue worker has shut down.");
    ExitCode::from(exit_status(&result))
}

/// Turns Ctrl+C (and SIGTERM on Unix, as sent by `docker stop`) into a shutdown signal.
async fn forward_signals(sender: ShutdownSender) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => match first_signal(tokio::signal::ctrl_c(), sigterm.recv()).await {
                Some(name) => log::info!("{} received. Shutting down.", name),
                None => return,
            },
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {}", e);
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                log::info!("Ctrl+C received. Shutting down.");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        log::info!("Ctrl+C received. Shutting down.");
    }

    sender.shutdown();
}

/// Waits for Ctrl+C or `terminate`, whichever comes first, and names it.
///
/// A Ctrl+C listener that cannot be installed is not a shutdown request: the worker keeps
/// running until `terminate` fires. `None` means neither signal can arrive any more.
#[cfg_attr(not(unix), allow(dead_code))]
async fn first_signal<C, T>(ctrl_c: C, terminate: T) -> Option<&'static str>
where
    C: Future<Output = io::Result<()>>,
    T: Future<Output = Option<()>>,
{
    tokio::pin!(terminate);
    tokio::select! {
        res = ctrl_c => match res {
            Ok(()) => return Some("Ctrl+C"),
            Err(e) => log::warn!("Cannot listen for Ctrl+C: {}", e),
        },
        res = &mut terminate => return res.map(|()| "SIGTERM"),
    }
    terminate.await.map(|()| "SIGTERM")
}
