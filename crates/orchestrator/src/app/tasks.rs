use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::server::ApiServer;
use crate::app::core::Application;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let api_task = self.spawn_api_server_task(app);
        self.tasks.push(api_task);

        match app.daemon_args().health_check_interval() {
            Some(period) => {
                let health_task = self.spawn_health_check_task(app, period);
                self.tasks.push(health_task);
            }
            None => tracing::info!("Background health checks disabled"),
        }

        tracing::info!("All application tasks started");
        Ok(())
    }

    /// Wait for a shutdown signal or for any task to exit
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::signal;
                use tokio::signal::unix::SignalKind;
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                        return;
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_api_server_task(&self, app: &Application) -> JoinHandle<()> {
        let cli = app.daemon_args();
        let orchestrator = app.services().orchestrator.clone();
        let listen_addr = cli.api_listen_addr.clone();
        let api_token = cli.api_token.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let api_server = ApiServer::new(orchestrator, listen_addr, api_token);
            if let Err(e) = api_server.run(token).await {
                tracing::error!("API server failed: {:?}", e);
            } else {
                tracing::info!("API server completed");
            }
        })
    }

    fn spawn_health_check_task(&self, app: &Application, period: Duration) -> JoinHandle<()> {
        let orchestrator = app.services().orchestrator.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting health check task, every {:?}", period);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let sweep = orchestrator.check_all_health().await;
                        if sweep.unhealthy.is_empty() {
                            tracing::debug!(checked = sweep.checked, "health sweep finished");
                        } else {
                            tracing::warn!(
                                checked = sweep.checked,
                                unhealthy = ?sweep.unhealthy,
                                "health sweep found unreachable hosts"
                            );
                        }
                    }
                }
            }
            tracing::info!("Health check task completed");
        })
    }
}
