use crate::domain::events::NetworkState;
use std::time::Duration;
use tokio::sync::watch;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Tracks link state by probing a known URL with a known exact-match body.
///
/// Remote transfers and the integrity auditor gate on `Verified`; a local
/// vault ignores network state entirely.
#[derive(Debug)]
pub struct NetworkMonitor {
    client: reqwest::Client,
    probe_url: String,
    expected_body: String,
    state_tx: watch::Sender<NetworkState>,
}

impl NetworkMonitor {
    #[must_use]
    pub fn new(probe_url: String, expected_body: String) -> (Self, watch::Receiver<NetworkState>) {
        let (state_tx, state_rx) = watch::channel(NetworkState::Disconnected);
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        (Self { client, probe_url, expected_body, state_tx }, state_rx)
    }

    /// One verification probe.
    pub async fn probe_once(&self) -> NetworkState {
        let request = self
            .client
            .get(&self.probe_url)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .header(reqwest::header::PRAGMA, "no-cache");

        match request.send().await {
            Ok(response) => match response.text().await {
                Ok(body) if body.trim() == self.expected_body.trim() => NetworkState::Verified,
                // Reachable but answering with someone else's page: an
                // interception portal is rewriting traffic.
                Ok(_) => NetworkState::CaptivePortal,
                Err(_) => NetworkState::Connected,
            },
            Err(e) if e.is_connect() => NetworkState::Disconnected,
            Err(_) => NetworkState::Connected,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(PROBE_INTERVAL);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    let observed = self.probe_once().await;
                    self.state_tx.send_if_modified(|current| {
                        if *current == observed {
                            false
                        } else {
                            tracing::info!(from = %current, to = %observed, "Network state changed");
                            *current = observed;
                            true
                        }
                    });
                }
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Network monitor shutting down...");
    }
}
