//! Daemon core
//!
//! Wraps a [`WifiContext`] in the async run loop: the scan dwell timer
//! that paces channel visits, the periodic node ageing pass, statistics
//! logging and the fanout of node manager events to registered
//! handlers. The context sits behind one mutex; every loop takes it for
//! the duration of a single operation.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, RwLock};

use super::config::DaemonConfig;
use crate::context::{WifiContext, WifiEvent, WifiStats};
use crate::driver::Drivers;
use crate::Result;

/// Daemon lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonState {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// Receiver of node manager events
#[async_trait::async_trait]
pub trait WifiEventHandler: Send + Sync {
    async fn handle_event(&self, event: &WifiEvent) -> Result<()>;

    fn name(&self) -> &str;
}

/// The node manager daemon
pub struct WifiDaemon {
    config: DaemonConfig,
    state: Arc<RwLock<DaemonState>>,
    context: Arc<Mutex<WifiContext>>,
    handlers: Arc<RwLock<Vec<Arc<dyn WifiEventHandler>>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl WifiDaemon {
    pub fn new(config: DaemonConfig, drivers: Drivers) -> Result<Self> {
        config.validate()?;
        let context = WifiContext::new(config.wifi.clone(), drivers)?;
        Ok(Self {
            config,
            state: Arc::new(RwLock::new(DaemonState::Initializing)),
            context: Arc::new(Mutex::new(context)),
            handlers: Arc::new(RwLock::new(Vec::new())),
            shutdown_tx: None,
        })
    }

    /// Shared handle to the node manager state
    pub fn context(&self) -> Arc<Mutex<WifiContext>> {
        Arc::clone(&self.context)
    }

    pub async fn state(&self) -> DaemonState {
        *self.state.read().await
    }

    pub async fn stats(&self) -> WifiStats {
        self.context.lock().await.stats.clone()
    }

    /// Register an event handler. Handlers are invoked in registration
    /// order for every drained event.
    pub async fn add_handler(&self, handler: Arc<dyn WifiEventHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Start the run loops and kick the initial scan off.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting {} v{}", self.config.general.name, self.config.general.version);
        *self.state.write().await = DaemonState::Running;

        self.context.lock().await.begin_scan();

        self.spawn_dwell_loop();
        self.spawn_age_loop();
        self.spawn_event_loop();
        if self.config.general.enable_stats {
            self.spawn_stats_loop();
        }

        log::info!("Daemon started");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        log::info!("Stopping daemon");
        *self.state.write().await = DaemonState::Stopping;
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.context.lock().await.free_all_nodes();
        *self.state.write().await = DaemonState::Stopped;
        log::info!("Daemon stopped");
        Ok(())
    }

    /// Run until shutdown is signalled.
    pub async fn run(&mut self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.shutdown_tx = Some(tx);
        self.start().await?;
        let _ = rx.await;
        if self.state().await == DaemonState::Running {
            self.stop().await?;
        }
        Ok(())
    }

    /// Ask a running daemon to shut down.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// The dwell timer paces the scan: each tick completes the pending
    /// channel visit and lets the scan move to the next channel.
    fn spawn_dwell_loop(&self) {
        let context = Arc::clone(&self.context);
        let state = Arc::clone(&self.state);
        let dwell = Duration::from_millis(self.config.general.dwell_time_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(dwell);
            loop {
                interval.tick().await;
                if *state.read().await != DaemonState::Running {
                    break;
                }
                context.lock().await.channel_switch_done();
            }
        });
    }

    fn spawn_age_loop(&self) {
        let context = Arc::clone(&self.context);
        let state = Arc::clone(&self.state);
        let period = Duration::from_secs(self.config.general.age_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                if *state.read().await != DaemonState::Running {
                    break;
                }
                let mut ctx = context.lock().await;
                if ctx.inactivity_timer_armed() {
                    ctx.age_nodes();
                }
            }
        });
    }

    /// Drain node manager events and fan them out to the handlers.
    fn spawn_event_loop(&self) {
        let context = Arc::clone(&self.context);
        let state = Arc::clone(&self.state);
        let handlers = Arc::clone(&self.handlers);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(20));
            loop {
                interval.tick().await;
                if *state.read().await != DaemonState::Running {
                    break;
                }
                let events = context.lock().await.drain_events();
                if events.is_empty() {
                    continue;
                }
                let handlers = handlers.read().await.clone();
                for event in &events {
                    for handler in &handlers {
                        if let Err(e) = handler.handle_event(event).await {
                            log::warn!("event handler {} failed: {}", handler.name(), e);
                        }
                    }
                }
            }
        });
    }

    fn spawn_stats_loop(&self) {
        let context = Arc::clone(&self.context);
        let state = Arc::clone(&self.state);
        let period = Duration::from_secs(self.config.general.stats_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if *state.read().await != DaemonState::Running {
                    break;
                }
                let ctx = context.lock().await;
                log::info!(
                    "uptime {}s, {} nodes, {} scans ({} no match), {} evicted, {} merges",
                    ctx.stats.uptime().as_secs(),
                    ctx.node_count(),
                    ctx.stats.scans_completed,
                    ctx.stats.scan_no_match,
                    ctx.stats.nodes_evicted,
                    ctx.stats.merges
                );
            }
        });
    }
}
