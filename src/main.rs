mod access;
mod config;
mod delivery;
mod engine;
mod envelope;
mod relay;
mod session;
mod utils;

#[cfg(test)]
mod testutil;

use structopt::StructOpt;
use anyhow::Result;
use std::sync::Arc;
use std::path::PathBuf;

use crate::config::Config;
use crate::delivery::DirectDelivery;
use crate::utils::Logger;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-proxy",
    about = "A restrictive SMTP relay: accepts mail from allowed hosts and delivers it directly"
)]
pub struct Opt {
    /// Configuration file
    #[structopt(short = "c", long = "config", default_value = "config.toml", parse(from_os_str))]
    pub config: PathBuf,

    /// Listening port, overrides `port` from the configuration file
    #[structopt(short = "p", long = "port")]
    pub port: Option<u16>,

    /// Verbose mode - same as `debug = true`
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();

    let mut config = match Config::load(&opt.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[ERROR] {:#}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = opt.port {
        config.port = port;
    }
    if opt.verbose {
        config.debug = true;
    }

    eprintln!("[INFO] smtp-proxy v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("[INFO] PID: {}", std::process::id());
    eprintln!("[INFO] Config: {:?}", opt.config);

    let logger = Logger::new(&config.log_dir, config.debug);

    let delivery = match DirectDelivery::from_system_conf(&config.delivery) {
        Ok(delivery) => Arc::new(delivery),
        Err(e) => {
            eprintln!("[ERROR] {:#}", e);
            std::process::exit(1);
        }
    };

    let relay = match relay::SmtpRelay::new(config, logger, delivery) {
        Ok(relay) => Arc::new(relay),
        Err(e) => {
            eprintln!("[ERROR] Failed to create relay: {:#}", e);
            std::process::exit(1);
        }
    };

    eprintln!("[INFO] Listening on {}", relay.config.listen_addr());
    eprintln!("[INFO] Allowed sources: {:?}", relay.config.allow_ip);
    if !relay.config.map_ip.is_empty() {
        eprintln!("[INFO] Address map: {:?}", relay.config.map_ip);
    }
    if relay.tls_acceptor.is_some() {
        eprintln!("[INFO] STARTTLS enabled");
    }

    if relay.run().await.is_err() {
        std::process::exit(1);
    }

    Ok(())
}
