/// src/main.rs - Application entry point for the StreamFix proxy server.

use clap::{Parser, Subcommand};
use streamfix_proxy::{Config, ProxyServer};

#[derive(Parser)]
#[command(name = "streamfix-proxy")]
#[command(about = "OpenAI-compatible proxy with streaming JSON extraction and repair")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy server
    Serve(Config),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(config) => {
            let server = ProxyServer::new(config)?;
            server.run().await?;
        }
    }
    Ok(())
}
