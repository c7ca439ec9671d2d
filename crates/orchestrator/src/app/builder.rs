use std::sync::Arc;

use anyhow::Result;

use crate::app::core::Application;
use crate::app::services::ApplicationServices;
use crate::config::CapabilityBackend;
use crate::config::DaemonArgs;
use crate::domain::traits::HostCapability;
use crate::domain::HostRegistry;
use crate::domain::Orchestrator;
use crate::infrastructure::capability::CommandCapability;
use crate::infrastructure::capability::NoopCapability;
use crate::infrastructure::inventory;
use crate::infrastructure::state_file::JsonStateFile;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build application with all dependencies
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let registry = Arc::new(self.create_registry()?);
        let capability = self.create_capability()?;
        let orchestrator = Arc::new(Orchestrator::new(
            registry,
            capability,
            self.daemon_args.orchestrator_config(),
        ));

        if let Some(path) = &self.daemon_args.inventory_file {
            let hosts = inventory::load_inventory(path).await?;
            let registered = inventory::register_inventory(&orchestrator, hosts);
            tracing::info!("Registered {} host(s) from inventory", registered);
        }

        tracing::info!("Application components built");
        Ok(Application::new(
            ApplicationServices { orchestrator },
            self.daemon_args,
        ))
    }

    fn create_registry(&self) -> Result<HostRegistry> {
        match &self.daemon_args.state_file {
            Some(path) => {
                tracing::info!("Using state file {:?}", path);
                HostRegistry::with_store(Arc::new(JsonStateFile::new(path)))
                    .map_err(|e| anyhow::anyhow!("Failed to load registry state: {e:?}"))
            }
            None => {
                tracing::warn!("No state file configured, registry is kept in memory only");
                Ok(HostRegistry::new())
            }
        }
    }

    fn create_capability(&self) -> Result<Arc<dyn HostCapability>> {
        Ok(match self.daemon_args.capability_backend {
            CapabilityBackend::Command => {
                Arc::new(CommandCapability::new(self.daemon_args.command_set()?))
            }
            CapabilityBackend::Noop => {
                tracing::warn!("Running with the noop capability, no host is touched");
                Arc::new(NoopCapability)
            }
        })
    }
}
