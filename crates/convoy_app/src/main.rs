//! `convoy`: runs the fleet control plane until Ctrl-C.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use convoy_core::config::FleetConfig;
use convoy_core::logging;
use convoy_network::FleetServer;

#[derive(Parser, Debug)]
#[command(name = "convoy")]
#[command(about = "UDP control plane for a small fleet of ground vehicles", long_about = None)]
struct Args {
    /// Config file (JSON). Defaults to the user config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for rolling log files
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    /// Start with periodic telemetry broadcast enabled
    #[arg(long)]
    enable_broadcast: bool,

    /// Cars per broadcast frame
    #[arg(short, long)]
    group_size: Option<usize>,

    /// Subnet broadcast address (skips detection)
    #[arg(long)]
    broadcast_addr: Option<Ipv4Addr>,

    /// Write the effective config to the config path and exit
    #[arg(long)]
    save_config: bool,
}

impl Args {
    /// Overlay command-line flags on the loaded config.
    fn apply(&self, config: &mut FleetConfig) {
        if self.enable_broadcast {
            config.broadcast_enabled = true;
        }
        if let Some(group_size) = self.group_size {
            config.broadcast_group_size = group_size;
        }
        if let Some(addr) = self.broadcast_addr {
            config.broadcast_addr = Some(addr);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let logs_dir = args.logs_dir.clone().unwrap_or_else(logging::default_logs_dir);
    let _log_guard = logging::init_logging(&logs_dir, logging::DEFAULT_FILTER)?;

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => FleetConfig::default_path()?,
    };
    let mut config = FleetConfig::load_or_default(&config_path);
    args.apply(&mut config);

    if args.save_config {
        config
            .save_to_file(&config_path)
            .map_err(anyhow::Error::msg)?;
        println!("Config written to {}", config_path.display());
        return Ok(());
    }

    let mut server = FleetServer::new(config).context("Invalid configuration")?;
    server.start().await.context("Failed to start fleet server")?;

    let control = server.control()?;
    let settings = control.broadcast_settings();
    let telemetry = server
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let broadcast = settings
        .target
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "disabled".to_string());

    println!("Telemetry: udp://{telemetry}");
    println!("Broadcast: {broadcast} (enabled: {}, group size: {})", settings.enabled, settings.group_size);
    println!("Logs: {}", logs_dir.display());
    info!("convoy running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    server.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "convoy",
            "--enable-broadcast",
            "--group-size",
            "2",
            "--broadcast-addr",
            "10.0.0.255",
        ])
        .unwrap();

        let mut config = FleetConfig::default();
        args.apply(&mut config);
        assert!(config.broadcast_enabled);
        assert_eq!(config.broadcast_group_size, 2);
        assert_eq!(config.broadcast_addr, Some(Ipv4Addr::new(10, 0, 0, 255)));
    }

    #[test]
    fn test_no_flags_keep_config() {
        let args = Args::try_parse_from(["convoy"]).unwrap();
        let mut config = FleetConfig {
            broadcast_group_size: 3,
            ..FleetConfig::default()
        };
        args.apply(&mut config);
        assert!(!config.broadcast_enabled);
        assert_eq!(config.broadcast_group_size, 3);
        assert!(config.broadcast_addr.is_none());
    }

    #[test]
    fn test_rejects_bad_broadcast_addr() {
        assert!(Args::try_parse_from(["convoy", "--broadcast-addr", "not-an-ip"]).is_err());
    }
}
