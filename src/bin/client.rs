//! Ferry Client Binary
//!
//! Usage: ferry-client [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -h, --help           Print help information

use std::env;

use ferry::client::ProxyClient;
use ferry::config::ClientConfig;
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
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            let config = ClientConfig::load(&args[2])?;
            init_tracing(config.verbose);
            run_client(config).await?;
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
        r#"Ferry Client - local SOCKS5 entry to a ferry server

USAGE:
    ferry-client [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file
    -h, --help           Print help information

CONFIGURATION FILE FORMAT (JSON):
    {{
        "socks_addr": "127.0.0.1:1080",
        "server_addr": "proxy.example.com:8443",
        "tls": true,
        "ca_file": "ca.pem",
        "server_name": "proxy.example.com",
        "verbose": false
    }}

EXAMPLES:
    Run the client:
        ferry-client --config client.json
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

async fn run_client(config: ClientConfig) -> anyhow::Result<()> {
    tracing::info!("ferry client starting (server: {})", config.server_addr);
    let client = ProxyClient::new(config)?;
    client.run().await?;
    Ok(())
}
