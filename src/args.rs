use clap::{Parser, Subcommand};
use std::path::PathBuf;

use webrtclite_core::config;

#[derive(Parser, Debug)]
#[command(name = "webrtclite")]
#[command(author = "WebRTC-Lite Team")]
#[command(version)]
#[command(about = "WebRTC-Lite call core tools", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/webrtclite.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch TURN credentials for a session through the cache
    Credentials {
        /// Session identifier
        session: String,
    },

    /// Score a set of connection metrics
    Quality {
        /// Round-trip time in milliseconds
        #[arg(long)]
        rtt: f64,

        /// Packet loss in percent
        #[arg(long, default_value = "0")]
        loss: f64,

        /// Bitrate in bits per second
        #[arg(long)]
        bitrate: f64,
    },

    /// Print the reconnection backoff schedule
    Backoff,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        Ok(config::Config::load(&self.config)?)
    }

    /// Environment filter wins, then `--verbose`, then the configured level
    pub fn log_filter(&self, env_filter: Option<String>, configured: &str) -> String {
        match env_filter {
            Some(filter) if !filter.is_empty() => filter,
            _ if self.verbose => "debug".to_string(),
            _ => configured.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quality() {
        let args = Args::parse_from(["webrtclite", "quality", "--rtt", "120", "--bitrate", "800000"]);
        match args.command {
            Command::Quality { rtt, loss, bitrate } => {
                assert_eq!(rtt, 120.0);
                assert_eq!(loss, 0.0);
                assert_eq!(bitrate, 800_000.0);
            }
            other => panic!("Expected quality, got {:?}", other),
        }
        assert_eq!(args.config, PathBuf::from("/etc/webrtclite.toml"));
    }

    #[test]
    fn test_log_filter_precedence() {
        let quiet = Args::parse_from(["webrtclite", "backoff"]);
        assert_eq!(quiet.log_filter(None, "warn"), "warn");
        assert_eq!(quiet.log_filter(Some(String::new()), "warn"), "warn");
        assert_eq!(quiet.log_filter(Some("trace".to_string()), "warn"), "trace");

        let verbose = Args::parse_from(["webrtclite", "-v", "backoff"]);
        assert_eq!(verbose.log_filter(None, "warn"), "debug");
        assert_eq!(verbose.log_filter(Some("error".to_string()), "warn"), "error");
    }

    #[test]
    fn test_parse_credentials_with_config() {
        let args = Args::parse_from(["webrtclite", "-c", "/tmp/w.toml", "-v", "credentials", "abc"]);
        assert!(args.verbose);
        assert_eq!(args.config, PathBuf::from("/tmp/w.toml"));
        assert!(matches!(args.command, Command::Credentials { ref session } if session == "abc"));
    }
}
