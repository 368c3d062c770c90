use std::sync::Arc;

use anyhow::{Context, Result};

use crate::{
    config::LoggerConfig,
    db::ReadingStore,
    discovery::{DiscoveryEngine, DiscoveryOutcome},
    session::{PollingSession, SessionState, StatsSnapshot},
    sink_info, sink_warn,
    transport::{SerialProvider, TransportProvider},
    utils::logging::SharedLog,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected { port: String },
    AlreadyConnected { port: String },
    /// Every candidate was tried and none answered.
    NoDevice,
    /// A device answered but the session could not be started on it.
    LinkFailed { port: String, reason: String },
}

impl ConnectOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectOutcome::Connected { .. } | ConnectOutcome::AlreadyConnected { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorStatus {
    Running { port: String },
    Stopped,
}

/// What a shell talks to: connect, reconnect, disconnect, status.
///
/// Owns at most one polling session and one open store.
pub struct Supervisor {
    config: LoggerConfig,
    provider: Arc<dyn TransportProvider>,
    log: SharedLog,
    store: Option<ReadingStore>,
    session: Option<PollingSession>,
}

impl Supervisor {
    pub fn new(config: LoggerConfig, provider: Arc<dyn TransportProvider>, log: SharedLog) -> Self {
        Self {
            config,
            provider,
            log,
            store: None,
            session: None,
        }
    }

    pub fn with_serial_ports(config: LoggerConfig, log: SharedLog) -> Self {
        Self::new(config, Arc::new(SerialProvider), log)
    }

    /// Open the store, find the gateway and start polling it.
    ///
    /// Only a store that cannot be opened is an error; everything on the
    /// serial side is reported through the outcome.
    pub async fn connect(&mut self) -> Result<ConnectOutcome> {
        if let Some(session) = &self.session {
            if session.state() == SessionState::Connected {
                return Ok(ConnectOutcome::AlreadyConnected {
                    port: session.port().to_string(),
                });
            }
        }

        // A session that dropped on its own still holds tasks; retire it.
        if let Some(mut finished) = self.session.take() {
            finished.disconnect().await;
        }

        let store = self.open_store().await?;

        let engine = DiscoveryEngine::new(
            self.provider.clone(),
            self.config.probe_settings(),
            self.log.clone(),
        );
        let outcome = tokio::task::spawn_blocking(move || engine.discover())
            .await
            .context("discovery worker failed")?;

        let device = match outcome {
            DiscoveryOutcome::Confirmed(device) => device,
            DiscoveryOutcome::Exhausted { failures } => {
                sink_warn!(
                    self.log,
                    "No sensor gateway found after {} candidate(s)",
                    failures.len()
                );
                return Ok(ConnectOutcome::NoDevice);
            }
        };

        let port = device.port.clone();
        match PollingSession::start(
            device.transport,
            store,
            self.config.session_settings(),
            self.log.clone(),
        ) {
            Ok(session) => {
                sink_info!(self.log, "Connected to sensor gateway on {port}");
                self.session = Some(session);
                Ok(ConnectOutcome::Connected { port })
            }
            Err(err) => {
                sink_warn!(self.log, "Could not start polling {port}: {err}");
                Ok(ConnectOutcome::LinkFailed {
                    port,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Stop the session and release the store.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.disconnect().await;
        }

        if let Some(store) = self.store.take() {
            // Dropping the last handle joins the store thread.
            if let Err(err) = tokio::task::spawn_blocking(move || drop(store)).await {
                sink_warn!(self.log, "Store shutdown failed: {err}");
            }
            sink_info!(self.log, "Store released");
        }
    }

    pub async fn reconnect(&mut self) -> Result<ConnectOutcome> {
        self.disconnect().await;
        self.connect().await
    }

    pub fn status(&self) -> SupervisorStatus {
        match &self.session {
            Some(session) if session.state() == SessionState::Connected => SupervisorStatus::Running {
                port: session.port().to_string(),
            },
            _ => SupervisorStatus::Stopped,
        }
    }

    pub fn session_stats(&self) -> Option<StatsSnapshot> {
        self.session.as_ref().map(PollingSession::stats)
    }

    pub fn store(&self) -> Option<&ReadingStore> {
        self.store.as_ref()
    }

    /// Resolves when the current session ends; immediately if there is none.
    pub async fn wait_until_stopped(&self) {
        if let Some(session) = &self.session {
            session.closed().await;
        }
    }

    async fn open_store(&mut self) -> Result<ReadingStore> {
        if let Some(store) = &self.store {
            return Ok(store.clone());
        }

        let paths = self.config.store_paths();
        let log = self.log.clone();
        let store = tokio::task::spawn_blocking(move || ReadingStore::open(paths, log))
            .await
            .context("store worker failed")??;

        self.store = Some(store.clone());
        Ok(store)
    }
}
