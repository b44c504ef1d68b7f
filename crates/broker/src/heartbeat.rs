//! Heartbeat publishing and the service health registry.
//!
//! Every process broadcasts a liveness record on a fan-out exchange at
//! a fixed interval. The registry side consumes the broadcast and
//! answers readiness questions from its latest view.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use reporter_core::config::HeartbeatConfig;
use reporter_core::errors::Result;
use reporter_core::models::HeartbeatRecord;
use reporter_core::traits::Broker;

/// Probes one mandatory dependency of the publishing service. Pingers
/// run under a short timeout each beat; a probe that hangs counts as
/// unreachable rather than delaying the beat.
#[async_trait]
pub trait DependencyPinger: Send + Sync {
    fn name(&self) -> &str;
    async fn ping(&self) -> bool;
}

/// Periodically broadcasts this service's heartbeat record.
pub struct HeartbeatPublisher {
    broker: Arc<dyn Broker>,
    config: HeartbeatConfig,
    service: String,
    version: String,
    pingers: Vec<Arc<dyn DependencyPinger>>,
}

impl HeartbeatPublisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        config: HeartbeatConfig,
        service: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            config,
            service: service.into(),
            version: version.into(),
            pingers: Vec::new(),
        }
    }

    pub fn register_pinger(&mut self, pinger: Arc<dyn DependencyPinger>) {
        self.pingers.push(pinger);
    }

    /// Publishes one beat immediately, then keeps beating on the
    /// configured interval until shutdown. The immediate first beat is
    /// what lets a registry mark a fresh process healthy without
    /// waiting a full interval.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        self.broker.declare_fanout(&self.config.exchange).await?;
        info!(service = %self.service, "heartbeat publisher started");

        self.beat().await;
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.tick().await; // first tick fires immediately, already beaten
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(service = %self.service, "heartbeat publisher stopping");
                    return Ok(());
                }
                _ = ticker.tick() => self.beat().await,
            }
        }
    }

    async fn beat(&self) {
        let mut dependencies = HashMap::new();
        for pinger in &self.pingers {
            let reachable = tokio::time::timeout(self.config.pinger_timeout(), pinger.ping())
                .await
                .unwrap_or(false);
            if !reachable {
                warn!(service = %self.service, dependency = %pinger.name(), "dependency unreachable");
            }
            dependencies.insert(pinger.name().to_string(), reachable);
        }
        let record = HeartbeatRecord::new(&self.service, &self.version, dependencies);
        match serde_json::to_vec(&record) {
            Ok(payload) => {
                if let Err(e) = self.broker.publish_fanout(&self.config.exchange, &payload).await {
                    warn!(service = %self.service, "failed to publish heartbeat: {e}");
                }
            }
            Err(e) => warn!("failed to encode heartbeat: {e}"),
        }
    }
}

/// Latest-known view of every heartbeating service, keyed by service
/// name. Records only move forward in time; a delayed older beat never
/// overwrites a newer one.
#[derive(Default)]
pub struct HeartbeatRegistry {
    records: RwLock<HashMap<String, HeartbeatRecord>>,
}

impl HeartbeatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the heartbeat broadcast until shutdown.
    pub async fn run(
        self: Arc<Self>,
        broker: Arc<dyn Broker>,
        config: HeartbeatConfig,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        broker.declare_fanout(&config.exchange).await?;
        let mut rx = broker
            .subscribe_fanout(&config.exchange, "heartbeat-registry")
            .await?;
        info!(exchange = %config.exchange, "heartbeat registry started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                delivery = rx.recv() => match delivery {
                    Some(delivery) => {
                        match serde_json::from_slice::<HeartbeatRecord>(&delivery.payload) {
                            Ok(record) => self.observe(record).await,
                            Err(e) => warn!("discarding malformed heartbeat: {e}"),
                        }
                        let _ = delivery.acker.ack().await;
                    }
                    None => {
                        warn!("heartbeat subscription closed");
                        return Ok(());
                    }
                },
            }
        }
    }

    pub async fn observe(&self, record: HeartbeatRecord) {
        let mut records = self.records.write().await;
        match records.get(&record.service) {
            Some(existing) if existing.timestamp > record.timestamp => {
                debug!(service = %record.service, "ignoring out-of-date heartbeat");
            }
            _ => {
                records.insert(record.service.clone(), record);
            }
        }
    }

    pub async fn get(&self, service: &str) -> Option<HeartbeatRecord> {
        self.records.read().await.get(service).cloned()
    }

    pub async fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// `(service, dependency)` pairs currently failing, where a stale
    /// service counts every one of its declared dependencies as
    /// missing. The readiness endpoint reports exactly this list.
    pub async fn missing_mandatory_services(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Vec<(String, String)> {
        let records = self.records.read().await;
        let mut missing = Vec::new();
        for (service, record) in records.iter() {
            if record.is_stale(now, stale_after) {
                let mut names: Vec<String> = record.dependencies.keys().cloned().collect();
                names.sort();
                for name in names {
                    missing.push((service.clone(), name));
                }
            } else {
                for name in record.unreachable_dependencies() {
                    missing.push((service.clone(), name));
                }
            }
        }
        missing.sort();
        missing
    }

    pub async fn is_healthy(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.missing_mandatory_services(now, stale_after)
            .await
            .is_empty()
    }
}
