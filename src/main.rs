mod cmd;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "engine-router")]
#[command(version = "0.5.0")]
#[command(about = "Run inference on the best available compute backend", long_about = None)]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(alias = "ls")]
    Engines,
    Hardware,
    Run {
        #[arg(short, long, default_value = "best")]
        engine: String,
        #[arg(short, long, value_delimiter = ',', allow_hyphen_values = true, default_value = "1.0")]
        input: Vec<f32>,
        #[arg(long, default_value_t = 8)]
        output_size: usize,
        #[arg(long, default_value_t = 1.0)]
        temperature: f32,
        #[arg(long)]
        stream: bool,
        #[arg(long, default_value_t = 8)]
        max_tokens: usize,
    },
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Engines => cmd::engines(config).await,
        Commands::Hardware => cmd::hardware().await,
        Commands::Run { engine, input, output_size, temperature, stream, max_tokens } => {
            let args = cmd::RunArgs { engine, input, output_size, temperature, stream, max_tokens };
            cmd::run(config, args).await
        }
        Commands::Version => cmd::version().await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
