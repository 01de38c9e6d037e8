//! Ferry Server Binary
//!
//! Usage: ferry-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a default configuration file
//!   -h, --help           Print help information

use std::env;

use ferry::config::ServerConfig;
use ferry::server::ProxyServer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            print!("{}", toml::to_string_pretty(&ServerConfig::default())?);
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            let config = ServerConfig::load(&args[2])?;
            init_tracing(config.verbose);
            run_server(config).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"Ferry Server - egress side of the ferry proxy

USAGE:
    ferry-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file (TOML)
    -g, --generate       Print a default configuration file
    -h, --help           Print help information

EXAMPLES:
    Generate a starting configuration:
        ferry-server --generate > server.toml

    Run the server:
        ferry-server --config server.toml
"#
    );
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    tracing::info!("ferry server starting");
    let server = ProxyServer::new(config)?;
    server.run().await?;
    Ok(())
}
