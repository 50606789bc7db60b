use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use flowswitch::{
    config::Config,
    engine::Engine,
    plan::Instruction,
    signal::HttpTransport,
    version,
};
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    author,
    version = version::get_short_version(),
    about = "Call-control engine driving switch channels from XML call flows",
    long_about = version::get_version_info()
)]
struct Cli {
    /// Path to the configuration file
    #[clap(
        long,
        global = true,
        help = "Path to the configuration file (TOML format)"
    )]
    conf: Option<String>,
    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration and exit
    CheckConfig,
    /// Parse and validate a call-flow document, then print its instructions
    Parse { file: String },
}

fn print_tree(instructions: &[Instruction], depth: usize) {
    for instruction in instructions {
        let attrs = instruction
            .attrs
            .iter()
            .map(|(k, v)| format!(" {}=\"{}\"", k, v))
            .collect::<String>();
        let text = instruction.text.trim();
        if text.is_empty() {
            println!("{}{}{}", "  ".repeat(depth), instruction.kind, attrs);
        } else {
            println!("{}{}{} {:?}", "  ".repeat(depth), instruction.kind, attrs, text);
        }
        print_tree(&instruction.children, depth + 1);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.conf {
        Some(ref path) => {
            println!("Loading config from: {}", path);
            Config::load(path)?
        }
        None => {
            println!("Loading default config");
            Config::default()
        }
    };

    match cli.command {
        Some(Commands::CheckConfig) => {
            if let Err(err) = config.validate() {
                eprintln!("Configuration validation failed: {}", err);
                std::process::exit(1);
            }
            println!("Configuration is valid.");
            return Ok(());
        }
        Some(Commands::Parse { ref file }) => {
            let xml = std::fs::read_to_string(file)
                .map_err(|e| anyhow::anyhow!("{}: {}", e, file))?;
            let transport = Arc::new(HttpTransport::new(&config)?);
            let engine = Engine::new(config, transport);
            match engine.producer().build_plan(&xml) {
                Ok(plan) => {
                    print_tree(&plan, 0);
                    return Ok(());
                }
                Err(err) => {
                    eprintln!("{}: {}", file, err);
                    std::process::exit(1);
                }
            }
        }
        None => {}
    }

    println!("Start at {}", Utc::now());
    println!("{}", version::get_version_info());

    let mut env_filter = EnvFilter::from_default_env();
    if let Some(Ok(level)) = config
        .log_level
        .as_ref()
        .map(|level| level.parse::<LevelFilter>())
    {
        env_filter = env_filter.add_directive(level.into());
    }

    let mut file_layer = None;
    let mut guard_holder = None;
    if let Some(ref log_file) = config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| anyhow::anyhow!("{}: {}", e, log_file))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        guard_holder = Some(guard);
        file_layer = Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        );
    }
    let stdout_layer = file_layer
        .is_none()
        .then(tracing_subscriber::fmt::layer);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .ok();

    let transport = Arc::new(HttpTransport::new(&config)?);
    let engine = Engine::new(config, transport);
    info!(
        answer_url = ?engine.config().call.default_answer_url,
        hangup_url = ?engine.config().call.default_hangup_url,
        "flowswitch engine ready, waiting for switch connections"
    );

    tokio::signal::ctrl_c().await?;
    info!("Received CTRL+C, shutting down");
    engine.shutdown();
    drop(guard_holder);
    Ok(())
}
