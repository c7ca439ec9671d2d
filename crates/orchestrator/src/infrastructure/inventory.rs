//! Static host inventory registered at startup

use std::path::Path;

use anyhow::Context;
use api_types::RegisterHostRequest;
use api_types::RejectionReason;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::domain::Orchestrator;

/// Reads a YAML list of hosts.
pub async fn load_inventory(path: &Path) -> anyhow::Result<Vec<RegisterHostRequest>> {
    info!("Loading host inventory from {:?}", path);

    let yaml_content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read inventory file {}", path.display()))?;
    let hosts: Vec<RegisterHostRequest> = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("failed to parse inventory file {}", path.display()))?;

    info!("Loaded {} inventory entries", hosts.len());
    Ok(hosts)
}

/// Registers every inventory host the registry does not know yet.
///
/// Returns the number of newly registered hosts. Entries that are already
/// registered (same id or IP) are skipped silently.
pub fn register_inventory(orchestrator: &Orchestrator, hosts: Vec<RegisterHostRequest>) -> usize {
    let mut registered = 0;
    for host in hosts {
        let hostname = host.hostname.clone();
        let response = orchestrator.register_host(host);
        match response.reason {
            None => registered += 1,
            Some(RejectionReason::DuplicateHost) => {
                debug!(hostname = %hostname, "inventory host already registered")
            }
            Some(reason) => warn!(
                hostname = %hostname,
                ?reason,
                "skipping inventory host: {}",
                response.message.unwrap_or_default()
            ),
        }
    }
    registered
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::domain::mock::ScriptedCapability;
    use crate::domain::HostRegistry;
    use crate::domain::OrchestratorConfig;

    #[tokio::test]
    async fn inventory_hosts_are_registered_once() {
        let yaml_content = r#"
- id: rack1-node1
  hostname: rack1-node1.lab
  ip: 10.1.0.11
  capacity:
    cpu: 64
    memory_mb: 262144
    disk_gb: 4000
  metadata:
    rack: "1"
- hostname: rack1-node2.lab
  ip: 10.1.0.12
  ssh_user: ubuntu
  ssh_port: 2200
- hostname: ""
  ip: 10.1.0.13
"#;
        let mut temp_file = NamedTempFile::new().expect("should create temp file");
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let hosts = load_inventory(temp_file.path()).await.unwrap();
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[1].ssh_port, 2200);
        assert_eq!(hosts[0].ssh_user, "root");

        let orchestrator = Orchestrator::new(
            Arc::new(HostRegistry::new()),
            Arc::new(ScriptedCapability::new()),
            OrchestratorConfig::default(),
        );
        assert_eq!(register_inventory(&orchestrator, hosts.clone()), 2);
        assert_eq!(register_inventory(&orchestrator, hosts), 0);

        let node1 = orchestrator.host("rack1-node1").expect("host should exist");
        assert_eq!(node1.capacity.cpu, 64);
        assert_eq!(node1.metadata.get("rack").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn malformed_inventory_is_an_error() {
        let mut temp_file = NamedTempFile::new().expect("should create temp file");
        temp_file.write_all(b"- hostname: [unterminated").unwrap();

        assert!(load_inventory(temp_file.path()).await.is_err());
    }
}
