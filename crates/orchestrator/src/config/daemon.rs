use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::ValueEnum;

use crate::domain::OrchestratorConfig;
use crate::domain::RunnerConfig;
use crate::infrastructure::capability::CommandSet;
use crate::infrastructure::capability::CommandSpec;

/// Which backend performs the privileged work
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CapabilityBackend {
    /// Run the configured external commands
    Command,
    /// Accept every request without touching any machine
    Noop,
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "0.0.0.0:8080",
        help = "HTTP API server listen address"
    )]
    pub api_listen_addr: String,

    #[arg(
        long,
        env = "METAL_API_TOKEN",
        help = "Bearer token required on API requests (unauthenticated when unset)"
    )]
    pub api_token: Option<String>,

    #[arg(
        long,
        env = "METAL_STATE_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "JSON file holding hosts and VMs across restarts (in-memory when unset)"
    )]
    pub state_file: Option<PathBuf>,

    #[arg(
        long,
        env = "METAL_INVENTORY_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML list of hosts registered at startup, e.g. /etc/metal/inventory.yaml"
    )]
    pub inventory_file: Option<PathBuf>,

    #[arg(
        long,
        env = "METAL_CAPABILITY_BACKEND",
        value_enum,
        default_value_t = CapabilityBackend::Command,
        help = "Backend performing provisioning work"
    )]
    pub capability_backend: CapabilityBackend,

    #[arg(
        long,
        env = "METAL_PROVISION_COMMAND",
        default_value = "ansible-playbook -i {host_ip}, -u {ssh_user} -e ansible_port={ssh_port} playbooks/provision.yml",
        help = "Command provisioning a host; {placeholders} are replaced with host fields"
    )]
    pub provision_command: String,

    #[arg(
        long,
        env = "METAL_VM_HOST_SETUP_COMMAND",
        default_value = "ansible-playbook -i {host_ip}, -u {ssh_user} -e ansible_port={ssh_port} playbooks/vm_host.yml"
    )]
    pub vm_host_setup_command: String,

    #[arg(
        long,
        env = "METAL_VM_CREATE_COMMAND",
        default_value = "ansible-playbook -i {host_ip}, -u {ssh_user} -e ansible_port={ssh_port} -e vm_name={vm_name} playbooks/create_vm.yml",
        help = "Command creating a VM; VM fields are also exported as VM_* variables"
    )]
    pub vm_create_command: String,

    #[arg(
        long,
        env = "METAL_PING_COMMAND",
        default_value = "ansible all -i {host_ip}, -u {ssh_user} -e ansible_port={ssh_port} -m ping"
    )]
    pub ping_command: String,

    #[arg(long, default_value_t = 1800, value_parser = clap::value_parser!(u64).range(1..))]
    pub provision_timeout_secs: u64,

    #[arg(long, default_value_t = 1800, value_parser = clap::value_parser!(u64).range(1..))]
    pub vm_host_setup_timeout_secs: u64,

    #[arg(long, default_value_t = 600, value_parser = clap::value_parser!(u64).range(1..))]
    pub vm_create_timeout_secs: u64,

    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub health_check_timeout_secs: u64,

    #[arg(
        long,
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Attempts per job including the first"
    )]
    pub max_attempts: u32,

    #[arg(long, default_value_t = 5000, help = "Delay between job attempts")]
    pub retry_backoff_ms: u64,

    #[arg(
        long,
        default_value_t = 300,
        help = "Seconds between background health sweeps, 0 disables them"
    )]
    pub health_check_interval_secs: u64,

    #[arg(
        long,
        default_value_t = 30,
        help = "Seconds to wait for running jobs on shutdown before abandoning them"
    )]
    pub shutdown_grace_secs: u64,

    #[arg(
        long,
        env = "METAL_JOB_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "logs/jobs.log",
        help = "Audit log of job dispatch and resolution, rotated daily"
    )]
    pub job_log_file: PathBuf,
}

impl DaemonArgs {
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            provision_timeout: Duration::from_secs(self.provision_timeout_secs),
            vm_host_setup_timeout: Duration::from_secs(self.vm_host_setup_timeout_secs),
            vm_create_timeout: Duration::from_secs(self.vm_create_timeout_secs),
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            runner: self.runner_config(),
            health_check_timeout: Duration::from_secs(self.health_check_timeout_secs),
        }
    }

    /// `None` when background health sweeps are disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn command_set(&self) -> anyhow::Result<CommandSet> {
        let parse = |flag: &str, value: &str| -> anyhow::Result<CommandSpec> {
            value
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("invalid --{flag}"))
        };
        Ok(CommandSet {
            provision: parse("provision-command", &self.provision_command)?,
            vm_host_setup: parse("vm-host-setup-command", &self.vm_host_setup_command)?,
            vm_create: parse("vm-create-command", &self.vm_create_command)?,
            ping: parse("ping-command", &self.ping_command)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::cli::Cli;
    use crate::config::cli::Commands;

    fn daemon_args(extra: &[&str]) -> DaemonArgs {
        let argv = ["metal-orchestrator", "daemon"].iter().chain(extra);
        match Cli::try_parse_from(argv).expect("arguments should parse").command {
            Commands::Daemon(args) => *args,
            Commands::Version => panic!("expected daemon command"),
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let args = daemon_args(&[]);

        assert_eq!(args.runner_config(), RunnerConfig::default());
        assert_eq!(args.orchestrator_config(), OrchestratorConfig::default());
        assert_eq!(args.capability_backend, CapabilityBackend::Command);
        assert_eq!(args.health_check_interval(), Some(Duration::from_secs(300)));
        assert_eq!(args.job_log_file, PathBuf::from("logs/jobs.log"));
        assert_eq!(args.shutdown_grace(), Duration::from_secs(30));
        assert!(args.state_file.is_none());
    }

    #[test]
    fn default_commands_use_ansible() {
        let commands = daemon_args(&[]).command_set().unwrap();

        assert_eq!(commands.provision.program, "ansible-playbook");
        assert_eq!(commands.ping.program, "ansible");
        assert!(commands.vm_create.args.iter().any(|a| a == "-e"));
    }

    #[test]
    fn flags_override_defaults() {
        let args = daemon_args(&[
            "--capability-backend",
            "noop",
            "--max-attempts",
            "3",
            "--retry-backoff-ms",
            "250",
            "--vm-create-timeout-secs",
            "60",
            "--health-check-interval-secs",
            "0",
            "--ping-command",
            "true",
        ]);

        let runner = args.runner_config();
        assert_eq!(args.capability_backend, CapabilityBackend::Noop);
        assert_eq!(runner.max_attempts, 3);
        assert_eq!(runner.retry_backoff, Duration::from_millis(250));
        assert_eq!(runner.vm_create_timeout, Duration::from_secs(60));
        assert_eq!(args.health_check_interval(), None);
        assert_eq!(args.command_set().unwrap().ping, CommandSpec::new("true", Vec::<String>::new()));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let result = Cli::try_parse_from(["metal-orchestrator", "daemon", "--max-attempts", "0"]);
        assert!(result.is_err(), "max attempts must be at least one");
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        for flag in [
            "--provision-timeout-secs",
            "--vm-host-setup-timeout-secs",
            "--vm-create-timeout-secs",
            "--health-check-timeout-secs",
        ] {
            let result = Cli::try_parse_from(["metal-orchestrator", "daemon", flag, "0"]);
            assert!(result.is_err(), "{flag} 0 should be rejected");
        }
        assert_eq!(daemon_args(&["--vm-create-timeout-secs", "1"]).vm_create_timeout_secs, 1);
    }

    #[test]
    fn blank_command_is_rejected() {
        let mut args = daemon_args(&[]);
        args.provision_command = "  ".to_string();

        let err = args.command_set().unwrap_err();

        assert!(format!("{err:#}").contains("--provision-command"), "{err:#}");
    }
}
