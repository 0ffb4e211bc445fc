//! Relay CI CLI entrypoint.

use clap::Parser;

mod commands;
mod handlers;

use commands::Commands;

#[derive(Parser)]
#[command(name = "relay")]
#[command(author, version, about = "Run CI pipelines locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run(args) => handlers::run(args).await,
        Commands::Validate { pipeline } => handlers::validate(pipeline.as_deref()).await,
    };

    if code != 0 {
        std::process::exit(code);
    }
}
