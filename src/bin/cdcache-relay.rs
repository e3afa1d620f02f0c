//! Standalone relay broker for cache invalidation events.

use std::{path::PathBuf, process};

use cdcache::{
    CacheError, ServiceConfig, Transport, TransportEvent, TransportEvents,
    config::TransportSettings, transport::RelayBroker,
};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Relays cache invalidation events between service instances.
#[derive(Parser, Debug)]
#[command(name = "cdcache-relay", version, about)]
struct Cli {
    /// TOML file whose `[transport.settings]` table configures the relay.
    #[arg(long, conflicts_with_all = ["subscription_uri", "submission_uri"])]
    config: Option<PathBuf>,

    /// Endpoint subscribers connect to, e.g. `tcp://*:5556`.
    #[arg(long, required_unless_present = "config")]
    subscription_uri: Option<String>,

    /// Endpoint publishers push to, e.g. `tcp://*:5557`.
    #[arg(long, required_unless_present = "config")]
    submission_uri: Option<String>,

    /// Topic this relay raises locally (everything is relayed regardless).
    #[arg(long)]
    topic: Option<String>,
}

impl Cli {
    fn settings(&self) -> Result<TransportSettings, CacheError> {
        let mut settings = match &self.config {
            Some(path) => ServiceConfig::load(path)?.transport.settings,
            None => TransportSettings::new(),
        };
        if let Some(uri) = &self.subscription_uri {
            settings.insert("subscriptionUri", uri.as_str());
        }
        if let Some(uri) = &self.submission_uri {
            settings.insert("submissionUri", uri.as_str());
        }
        if let Some(topic) = &self.topic {
            settings.insert("topic", topic.as_str());
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli).await {
        error!("cdcache-relay: {}", e);
        process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<(), CacheError> {
    let (events, mut rx) = TransportEvents::channel();
    let broker = RelayBroker::new(&cli.settings()?, events)?;
    broker.connect().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutting down relay");
                break;
            }
            event = rx.recv() => match event {
                Some(TransportEvent::Disconnected) | None => {
                    broker.disconnect().await;
                    return Err(std::io::Error::other("relay stopped unexpectedly").into());
                }
                Some(TransportEvent::Connected) => {
                    if let Some(endpoints) = broker.endpoints() {
                        info!(
                            "Relaying on subscription {} and submission {} (topic \"{}\")",
                            endpoints.subscription,
                            endpoints.submission,
                            broker.topic()
                        );
                    }
                }
                Some(TransportEvent::Cache(event)) => info!("Cache event: {}", event),
            }
        }
    }

    broker.disconnect().await;
    Ok(())
}
