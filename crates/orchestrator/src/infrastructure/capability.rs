//! Capability backends
//!
//! [`CommandCapability`] shells out to operator-configured commands (Ansible
//! playbooks by default). Host and VM parameters reach the command both as
//! `{placeholder}` substitutions in its arguments and as environment
//! variables.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::str::FromStr;

use api_types::HostCapacity;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::process::Command;
use tracing::debug;
use tracing::info;

use crate::domain::host::HostTarget;
use crate::domain::host::VmSpec;
use crate::domain::traits::CapabilityError;
use crate::domain::traits::HostCapability;
use crate::domain::traits::ProvisionReport;

/// Prefix of the stdout line carrying discovered host facts
pub const FACTS_MARKER: &str = "HOST_FACTS";

const STDERR_TAIL_LINES: usize = 20;

/// A program and its argument template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl FromStr for CommandSpec {
    type Err = String;

    /// Splits on whitespace; the first word is the program.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| "command must not be empty".to_string())?;
        Ok(Self::new(program, words))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Commands run for each capability operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet {
    pub provision: CommandSpec,
    pub vm_host_setup: CommandSpec,
    pub vm_create: CommandSpec,
    pub ping: CommandSpec,
}

pub struct CommandCapability {
    commands: CommandSet,
}

impl CommandCapability {
    pub fn new(commands: CommandSet) -> Self {
        Self { commands }
    }

    async fn run(
        &self,
        operation: &'static str,
        spec: &CommandSpec,
        vars: &BTreeMap<&'static str, String>,
    ) -> Result<String, Report<CapabilityError>> {
        let args: Vec<String> = spec.args.iter().map(|arg| render(arg, vars)).collect();
        debug!(operation, program = %spec.program, ?args, "running capability command");

        let output = Command::new(&spec.program)
            .args(&args)
            .envs(vars.iter().map(|(key, value)| (env_name(key), value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .change_context_lazy(|| CapabilityError::LaunchFailed {
                message: format!("could not start '{}'", spec.program),
            })
            .attach_printable_lazy(|| format!("operation: {operation}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Report::new(CapabilityError::CommandFailed {
                message: format!(
                    "{} exited with {}: {}",
                    spec.program,
                    output.status,
                    tail(&stderr, STDERR_TAIL_LINES)
                ),
            })
            .attach_printable(format!("operation: {operation}")));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl HostCapability for CommandCapability {
    async fn provision(&self, host: &HostTarget) -> Result<ProvisionReport, Report<CapabilityError>> {
        let stdout = self
            .run("provision", &self.commands.provision, &host_vars(host))
            .await?;
        Ok(ProvisionReport {
            facts: parse_facts(&stdout)?,
        })
    }

    async fn install_virtualization(&self, host: &HostTarget) -> Result<(), Report<CapabilityError>> {
        self.run("vm_host_setup", &self.commands.vm_host_setup, &host_vars(host))
            .await
            .map(drop)
    }

    async fn create_vm(&self, host: &HostTarget, vm: &VmSpec) -> Result<(), Report<CapabilityError>> {
        let mut vars = host_vars(host);
        vars.insert("vm_name", vm.name.clone());
        vars.insert("vcpus", vm.vcpus.to_string());
        vars.insert("memory_mb", vm.memory_mb.to_string());
        vars.insert("disk_gb", vm.disk_gb.to_string());
        vars.insert("os_variant", vm.os_variant.to_string());
        self.run("vm_create", &self.commands.vm_create, &vars)
            .await
            .map(drop)
    }

    async fn ping(&self, host: &HostTarget) -> Result<(), Report<CapabilityError>> {
        self.run("ping", &self.commands.ping, &host_vars(host))
            .await
            .map(drop)
            .change_context_lazy(|| CapabilityError::Unreachable {
                message: format!("{} ({}) did not answer", host.hostname, host.ip),
            })
    }
}

/// Accepts every request without touching any machine
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCapability;

#[async_trait]
impl HostCapability for NoopCapability {
    async fn provision(&self, host: &HostTarget) -> Result<ProvisionReport, Report<CapabilityError>> {
        info!(host_id = %host.id, "dry run: skipping provisioning");
        Ok(ProvisionReport::default())
    }

    async fn install_virtualization(&self, host: &HostTarget) -> Result<(), Report<CapabilityError>> {
        info!(host_id = %host.id, "dry run: skipping virtualization setup");
        Ok(())
    }

    async fn create_vm(&self, host: &HostTarget, vm: &VmSpec) -> Result<(), Report<CapabilityError>> {
        info!(host_id = %host.id, vm_name = %vm.name, "dry run: skipping VM creation");
        Ok(())
    }

    async fn ping(&self, _host: &HostTarget) -> Result<(), Report<CapabilityError>> {
        Ok(())
    }
}

fn host_vars(host: &HostTarget) -> BTreeMap<&'static str, String> {
    BTreeMap::from([
        ("host_id", host.id.clone()),
        ("hostname", host.hostname.clone()),
        ("host_ip", host.ip.to_string()),
        ("ssh_user", host.ssh_user.clone()),
        ("ssh_port", host.ssh_port.to_string()),
    ])
}

/// `host_ip` becomes `HOST_IP`; VM fields get a `VM_` prefix.
fn env_name(key: &str) -> String {
    let upper = key.to_ascii_uppercase();
    match key {
        "vcpus" | "memory_mb" | "disk_gb" | "os_variant" => format!("VM_{upper}"),
        "hostname" => "HOST_NAME".to_string(),
        _ => upper,
    }
}

/// Replaces every `{name}` in `template` with its value.
fn render(template: &str, vars: &BTreeMap<&'static str, String>) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Extracts host facts from a `HOST_FACTS {json}` line, if one is present.
fn parse_facts(stdout: &str) -> Result<Option<HostCapacity>, Report<CapabilityError>> {
    let Some(json) = stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(FACTS_MARKER))
    else {
        return Ok(None);
    };
    let facts = serde_json::from_str(json.trim()).change_context_lazy(|| {
        CapabilityError::InvalidOutput {
            message: format!("malformed {FACTS_MARKER} line"),
        }
    })?;
    Ok(Some(facts))
}
