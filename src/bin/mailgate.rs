#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI entry point for the mailgate IMAP proxy

use std::path::PathBuf;

use clap::Parser;
use mailgate::{Config, Server};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailgate")]
#[command(about = "Credential-brokering IMAP reverse proxy")]
struct Args {
    /// Config file
    #[arg(short = 'c', value_name = "PATH")]
    config: Option<PathBuf>,

    /// Dump a config file sample and exit
    #[arg(short = 'd')]
    dump: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump {
        print!("{}", Config::sample());
        return Ok(());
    }

    let Some(config_path) = args.config else {
        eprintln!("-c is required");
        std::process::exit(1);
    };

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_file(&config_path)?;
    Server::new(config).run().await?;

    Ok(())
}
