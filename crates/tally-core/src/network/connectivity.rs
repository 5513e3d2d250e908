//! Connectivity signal shared by the offline caches.
//!
//! [`ConnectivityMonitor`] holds the current online/offline state in a watch
//! channel. Platform glue calls [`ConnectivityMonitor::set_online`]; caches
//! subscribe and react to transitions. [`ConnectivityProbe`] is an optional
//! feeder that HEAD-probes known URLs in the background.

use crate::config::{ClientConfig, NetworkConfig};
use crate::error::{Result, TallyError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Network connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Network is available.
    Online,
    /// Network is not available.
    Offline,
    /// No signal received yet; treated as online.
    Unknown,
}

impl ConnectivityState {
    pub fn from_online(online: bool) -> Self {
        if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        !matches!(self, ConnectivityState::Offline)
    }
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Online => write!(f, "online"),
            ConnectivityState::Offline => write!(f, "offline"),
            ConnectivityState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Process-wide connectivity signal.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    state: watch::Sender<ConnectivityState>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Unknown)
    }
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        Self { state }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Report the platform's connectivity.
    ///
    /// Returns true when the state actually changed; subscribers are only
    /// woken on changes.
    pub fn set_online(&self, online: bool) -> bool {
        self.set_state(ConnectivityState::from_online(online))
    }

    pub fn set_state(&self, next: ConnectivityState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });

        if changed {
            match next {
                ConnectivityState::Online => info!("Network connectivity restored"),
                ConnectivityState::Offline => warn!("Network connectivity lost"),
                ConnectivityState::Unknown => debug!("Connectivity state reset"),
            }
        }

        changed
    }

    /// Receiver for connectivity transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }
}

/// Background HEAD prober feeding a [`ConnectivityMonitor`].
pub struct ConnectivityProbe {
    monitor: Arc<ConnectivityMonitor>,
    probe_urls: Vec<String>,
    interval: Duration,
    client: reqwest::Client,
    active: AtomicBool,
}

impl ConnectivityProbe {
    pub fn new(monitor: Arc<ConnectivityMonitor>, probe_urls: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(NetworkConfig::PROBE_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| TallyError::Config {
                message: format!("Failed to create probe client: {}", e),
            })?;

        Ok(Self {
            monitor,
            probe_urls,
            interval: NetworkConfig::PROBE_INTERVAL,
            client,
            active: AtomicBool::new(false),
        })
    }

    /// Build a probe from configuration. Returns `None` when no URLs are configured.
    pub fn from_config(
        config: &ClientConfig,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Result<Option<Self>> {
        if config.probe_urls.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            Self::new(monitor, config.probe_urls.clone())?
                .with_interval(Duration::from_secs(config.probe_interval_secs.max(1))),
        ))
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Probe every URL in order and publish the result.
    ///
    /// Without probe URLs the monitor is left untouched.
    pub async fn check(&self) -> ConnectivityState {
        if self.probe_urls.is_empty() {
            return self.monitor.state();
        }

        for url in &self.probe_urls {
            if self.probe_url(url).await {
                self.monitor.set_online(true);
                return ConnectivityState::Online;
            }
            debug!("Probe failed for {}", url);
        }

        self.monitor.set_online(false);
        ConnectivityState::Offline
    }

    async fn probe_url(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(resp) => {
                let status = resp.status();
                // 403 still proves the network path works
                status.is_success() || status.is_redirection() || status.as_u16() == 403
            }
            Err(e) => {
                debug!("Probe request failed: {}", e);
                false
            }
        }
    }

    /// Spawn the periodic probe loop. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::SeqCst) {
            debug!("Connectivity probe already running");
            return;
        }

        let probe = Arc::clone(self);
        tokio::spawn(async move {
            info!("Starting connectivity probe");

            while probe.active.load(Ordering::SeqCst) {
                probe.check().await;
                tokio::time::sleep(probe.interval).await;
            }

            info!("Connectivity probe stopped");
        });
    }

    /// Stop the loop after its current sleep.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
