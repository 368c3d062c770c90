pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod models;
pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod utils;

use std::path::PathBuf;

use anyhow::{bail, Result};
use config::{LoggerConfig, DEFAULT_CONFIG_FILE};
use log::{info, warn};
use supervisor::{ConnectOutcome, Supervisor};
use transport::{SerialProvider, TransportProvider};
use utils::logging::FacadeLog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub list_ports: bool,
    pub write_config: bool,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_FILE),
            list_ports: false,
            write_config: false,
        }
    }
}

impl CliArgs {
    /// Parse everything after the program name.
    pub fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => match args.next() {
                    Some(path) => parsed.config_path = PathBuf::from(path),
                    None => bail!("--config needs a path"),
                },
                "--list-ports" => parsed.list_ports = true,
                "--write-config" => parsed.write_config = true,
                other => bail!("unknown argument '{other}'"),
            }
        }

        Ok(parsed)
    }
}

pub async fn run() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = CliArgs::parse(std::env::args().skip(1))?;

    if args.list_ports {
        for port in SerialProvider.candidates()? {
            println!("{port}");
        }
        return Ok(());
    }

    let config = LoggerConfig::load(&args.config_path)?;
    if args.write_config {
        config.save(&args.config_path)?;
        info!("Wrote configuration to {}", args.config_path.display());
        return Ok(());
    }

    info!("Sensor logger starting up...");

    let mut supervisor = Supervisor::with_serial_ports(config, FacadeLog::shared("sensor_logger"));

    match supervisor.connect().await? {
        ConnectOutcome::Connected { port } | ConnectOutcome::AlreadyConnected { port } => {
            info!("Logging readings from {port}; press Ctrl+C to stop");
        }
        ConnectOutcome::NoDevice => {
            supervisor.disconnect().await;
            bail!("no sensor gateway found on any serial port");
        }
        ConnectOutcome::LinkFailed { port, reason } => {
            supervisor.disconnect().await;
            bail!("sensor gateway on {port} could not be polled: {reason}");
        }
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("Failed to listen for Ctrl+C: {err}");
            }
            info!("Shutting down");
        }
        _ = supervisor.wait_until_stopped() => {
            warn!("Connection to the sensor gateway was lost");
        }
    }

    supervisor.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_arguments_uses_default_config_file() {
        assert_eq!(CliArgs::parse(Vec::new()).unwrap(), CliArgs::default());
    }

    #[test]
    fn flags_and_config_path_are_read() {
        let parsed = CliArgs::parse(args(&["--config", "/etc/sensors.json", "--list-ports"])).unwrap();

        assert_eq!(parsed.config_path, PathBuf::from("/etc/sensors.json"));
        assert!(parsed.list_ports);
        assert!(!parsed.write_config);
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert!(CliArgs::parse(args(&["--config"])).is_err());
        assert!(CliArgs::parse(args(&["--verbose"])).is_err());
    }
}
