//! huddle-server - relay server entry point

use clap::Parser;
use huddle::config::Config;
use huddle::Server;
use log::{error, info};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "huddle-server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Conferencing relay server", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address for both planes
    #[arg(long)]
    host: Option<String>,

    /// TCP control port
    #[arg(long)]
    tcp_port: Option<u16>,

    /// UDP media relay port
    #[arg(long)]
    udp_port: Option<u16>,

    /// Verbose logging
    #[arg(short, long, action)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::new()
        .parse_filters(&format!("huddle={}", log_level))
        .init();

    info!("huddle-server v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.tcp_port {
        config.server.tcp_port = port;
    }
    if let Some(port) = args.udp_port {
        config.server.udp_port = port;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let bound = runtime.block_on(Server::bind(
        &config.server.host,
        config.server.tcp_port,
        config.server.udp_port,
    ));
    let server = match bound {
        Ok(s) => s,
        Err(e) => {
            error!("socket bind failed: {}", e);
            eprintln!(
                "Failed to bind {}:{}/{}: {}",
                config.server.host, config.server.tcp_port, config.server.udp_port, e
            );
            std::process::exit(1);
        }
    };

    runtime.block_on(server.run());
}
