//! webrtclite - command line tools for the call core

mod args;

use args::{Args, Command};
use clap::Parser;
use log::{debug, error, info, warn};
use webrtclite_core::config::Config;
use webrtclite_core::credentials::{fetcher_from_config, CredentialCache};
use webrtclite_core::quality::QualityReport;
use webrtclite_core::reconnect::ReconnectionCoordinator;
use webrtclite_core::signaling::{SignalingMessage, TurnCredentialMessage};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let loaded = args.load_config();
    let configured_level = match &loaded {
        Ok(cfg) => cfg.logging.level.clone(),
        Err(_) => Config::default().logging.level,
    };

    // Quiet the webrtc-rs internals unless asked for explicitly
    env_logger::Builder::new()
        .parse_filters(&args.log_filter(std::env::var("WEBRTCLITE_LOG").ok(), &configured_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    debug!("webrtclite v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match loaded {
        Ok(cfg) => {
            debug!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };
    config.apply_env_overrides();

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    match args.command {
        Command::Credentials { session } => print_credentials(&config, &session).await,
        Command::Quality { rtt, loss, bitrate } => {
            print_quality(rtt, loss, bitrate);
            Ok(())
        }
        Command::Backoff => {
            print_backoff(&config);
            Ok(())
        }
    }
}

async fn print_credentials(config: &Config, session: &str) -> Result<(), Box<dyn std::error::Error>> {
    let cache = CredentialCache::new(fetcher_from_config(&config.turn), &config.credential_cache);
    let credential = cache.get_credentials(session).await?;
    info!("Fetched credentials for session {} ({} URIs)", session, credential.server_uris.len());

    let message = SignalingMessage::TurnCredential(TurnCredentialMessage::from_credential(session, &credential));
    println!("{}", message.to_json()?);
    println!("expires in {}s", cache.get_time_to_expiry(session).as_secs());
    Ok(())
}

fn print_quality(rtt_ms: f64, packet_loss_pct: f64, bitrate_bps: f64) {
    let report = QualityReport {
        rtt_ms,
        packet_loss_pct,
        bitrate_bps,
        ..Default::default()
    };
    println!("score {} ({})", report.quality_score(), report.quality_state().as_str());
}

fn print_backoff(config: &Config) {
    let coordinator = ReconnectionCoordinator::new(&config.reconnection);
    for attempt in 1..=coordinator.max_retry_attempts() {
        println!("attempt {}: {:?}", attempt, coordinator.delay_for_attempt(attempt));
    }
}
