//! Network watcher — the "did connectivity come back" signal.
//!
//! Probes the stream origin on a fixed interval and feeds the offline→online
//! edge into the DaemonCore loop.  Only the edge matters: a restore while
//! playback is wanted but silent triggers a forced-reload start; steady
//! online/offline states are just reflected in the shared snapshot.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::DaemonEvent;

pub struct ProbeConfig {
    pub url: String,
    pub interval: Duration,
    pub timeout: Duration,
}

pub fn start_watcher(
    config: ProbeConfig,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder().timeout(config.timeout).build() {
            Ok(c) => c,
            Err(e) => {
                warn!("net watcher: failed to build HTTP client: {}", e);
                return;
            }
        };

        info!(
            "net watcher: probing {} every {:?}",
            config.url, config.interval
        );

        // Assume online at startup; the first probe corrects this.
        let mut online = true;

        loop {
            tokio::time::sleep(config.interval).await;

            let reachable = probe(&client, &config.url).await;
            if reachable == online {
                continue;
            }
            online = reachable;

            let event = if online {
                info!("net watcher: stream origin reachable again");
                DaemonEvent::NetworkUp
            } else {
                warn!("net watcher: stream origin unreachable");
                DaemonEvent::NetworkDown
            };
            if event_tx.send(event).await.is_err() {
                break;
            }
        }
    })
}

/// A HEAD round-trip counts as reachable regardless of status code —
/// this measures connectivity, not stream correctness.
async fn probe(client: &reqwest::Client, url: &str) -> bool {
    match client.head(url).send().await {
        Ok(resp) => {
            debug!("net watcher: probe {} → {}", url, resp.status());
            true
        }
        Err(e) => {
            debug!("net watcher: probe {} failed: {}", url, e);
            false
        }
    }
}
