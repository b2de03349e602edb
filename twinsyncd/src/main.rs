use tracing_subscriber::EnvFilter;
use twinsyncd::daemon::{DaemonConfig, DaemonRuntime, reset_baseline};

const DEFAULT_LOG_FILTER: &str = "twinsyncd=info,twinsync_core=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    ResetBaseline,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--reset-baseline" => mode = CliMode::ResetBaseline,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: twinsyncd [--reset-baseline]");
        println!("  --reset-baseline   Forget every synced state and exit");
        return Ok(());
    }
    let config = DaemonConfig::from_env()?;
    if mode == CliMode::ResetBaseline {
        return reset_baseline(&config).await;
    }
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
