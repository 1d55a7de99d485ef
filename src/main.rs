use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use tradeloop::config::Settings;
use tradeloop::engine::{run_engine, ShutdownSignal};
use tradeloop::logging;
use tradeloop::EngineError;

const EXIT_CONFIG: u8 = 2;
const EXIT_RESTART_BUDGET: u8 = 3;

#[derive(Parser)]
#[command(author, version, about = "Live trading orchestration engine")]
struct Cli {
    /// TOML configuration file, layered over the defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine until interrupted (default)
    Run(RunArgs),
    /// Validate the configuration and print it
    CheckConfig,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Use the exchange's sandbox endpoint
    #[arg(long)]
    sandbox: bool,
    /// Override the configured symbols (comma separated)
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let heartbeat = match logging::init() {
        Ok(heartbeat) => Some(heartbeat),
        Err(err) => {
            eprintln!("logging setup failed: {err}");
            None
        }
    };

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::error!(error = %err, "Configuration rejected");
            eprintln!("{err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::CheckConfig => match print_settings(&settings) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("{err:#}");
                ExitCode::FAILURE
            }
        },
        Command::Run(args) => run(settings, args, heartbeat).await,
    }
}

async fn run(mut settings: Settings, args: RunArgs, heartbeat: Option<logging::Heartbeat>) -> ExitCode {
    if args.sandbox {
        settings.exchange.sandbox_mode = true;
    }
    if !args.symbols.is_empty() {
        settings.trading.symbols = args.symbols;
    }
    if let Err(err) = settings.validate() {
        tracing::error!(error = %err, "Configuration rejected");
        eprintln!("{err}");
        return ExitCode::from(EXIT_CONFIG);
    }

    tracing::info!(
        exchange = ?settings.exchange.kind,
        sandbox = settings.exchange.sandbox_mode,
        symbols = ?settings.trading.symbols,
        timeframe = settings.trading.timeframe.as_str(),
        "🚀 tradeloop starting"
    );

    let shutdown = ShutdownSignal::new();
    shutdown.listen_for_signals();

    match run_engine(settings, shutdown, heartbeat).await {
        Ok(()) => {
            tracing::info!("👋 tradeloop stopped");
            ExitCode::SUCCESS
        }
        Err(err @ EngineError::RestartBudgetExhausted { .. }) => {
            tracing::error!(alert = true, error = %err, "tradeloop halted");
            ExitCode::from(EXIT_RESTART_BUDGET)
        }
        Err(err @ EngineError::Config(_)) => {
            tracing::error!(error = %err, "tradeloop could not start");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(err) => {
            tracing::error!(alert = true, error = %err, "tradeloop failed");
            ExitCode::FAILURE
        }
    }
}

fn print_settings(settings: &Settings) -> anyhow::Result<()> {
    let mut shown = settings.clone();
    for secret in [&mut shown.exchange.api_key, &mut shown.exchange.api_secret] {
        if !secret.is_empty() {
            *secret = "********".to_string();
        }
    }
    let rendered = serde_json::to_string_pretty(&shown).context("failed to render settings")?;
    println!("{rendered}");
    Ok(())
}
