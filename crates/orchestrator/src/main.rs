use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use metal_orchestrator::app::ApplicationBuilder;
use metal_orchestrator::config::Cli;
use metal_orchestrator::config::Commands;
use metal_orchestrator::config::DaemonArgs;
use metal_orchestrator::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::Version => {
            println!("{}", &**version::VERSION);
            Ok(())
        }
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(&daemon_args.job_log_file).context("failed to initialize logging")?;

    tracing::info!("Starting metal orchestrator {}", &**version::VERSION);

    let app = ApplicationBuilder::new(daemon_args).build().await?;

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}
