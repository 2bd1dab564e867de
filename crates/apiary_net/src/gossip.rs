//! Gossip anti-entropy engine.
//!
//! On a fixed interval the engine pulls, for every hosted hive, whatever
//! each configured peer has stored after our per-(peer, hive) cursor, and
//! feeds it through the owning actor's append path. uid dedup makes repeats
//! harmless, so convergence is eventual and best-effort: a failing peer is
//! logged, counted, and retried next cycle. Nothing here ever blocks or
//! fails the client request path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use apiary_core::ApiaryConfig;
use apiary_core::error::ApiaryError;
use apiary_core::protocol;
use apiary_hive::{HiveHandle, HiveRegistry};

use crate::wire::{GossipFeed, GossipRecord};

/// Shared-secret header both gossip endpoints check and the engine attaches.
pub const GOSSIP_SECRET_HEADER: &str = "x-gossip-secret";

// ---------------------------------------------------------------------------
// Batch merge (shared with the push endpoint)
// ---------------------------------------------------------------------------

/// What one batch merge did. `max_accepted_ms` covers accepted records only,
/// so a cursor advanced by it never skips past anything unseen.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeOutcome {
    pub accepted: usize,
    pub skipped: usize,
    pub max_accepted_ms: i64,
}

/// Feeds a batch of remote records through the hive's serialized append
/// path. Malformed records and already-present uids are skipped, never
/// fatal; only a storage fault aborts the batch.
pub async fn merge_batch(
    hive: &HiveHandle,
    hive_id: &str,
    records: Vec<GossipRecord>,
) -> Result<MergeOutcome, ApiaryError> {
    let mut outcome = MergeOutcome::default();
    for record in records {
        let candidate = match record.into_candidate(hive_id) {
            Ok(candidate) => candidate,
            Err(reason) => {
                debug!(hive_id, %reason, "skipping malformed gossip record");
                outcome.skipped += 1;
                continue;
            }
        };
        match hive.append(candidate).await? {
            Some(stored) => {
                outcome.accepted += 1;
                outcome.max_accepted_ms = outcome.max_accepted_ms.max(stored.created_at_ms);
            }
            None => outcome.skipped += 1,
        }
    }
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Gossip tunables, floors already applied.
#[derive(Debug, Clone)]
pub struct GossipSettings {
    /// Peer base URLs, no trailing slash.
    pub peers: Vec<String>,
    pub secret: Option<String>,
    pub interval: Duration,
    pub http_timeout: Duration,
}

impl GossipSettings {
    pub fn from_config(config: &ApiaryConfig) -> Self {
        Self {
            peers: config.gossip_peers.clone(),
            secret: config.gossip_secret.clone(),
            interval: Duration::from_secs(
                config
                    .gossip_interval_secs
                    .max(protocol::GOSSIP_MIN_INTERVAL_SECS),
            ),
            http_timeout: Duration::from_secs(config.gossip_http_timeout_secs.max(1)),
        }
    }
}

/// The background synchronizer. One instance per server process.
pub struct GossipEngine {
    registry: Arc<HiveRegistry>,
    client: reqwest::Client,
    settings: GossipSettings,
    cycles_run: AtomicU64,
    peer_failures: AtomicU64,
}

impl GossipEngine {
    pub fn new(registry: Arc<HiveRegistry>, settings: GossipSettings) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .build()
            .context("Failed to build gossip HTTP client")?;
        Ok(Arc::new(Self {
            registry,
            client,
            settings,
            cycles_run: AtomicU64::new(0),
            peer_failures: AtomicU64::new(0),
        }))
    }

    /// Completed poll cycles, failing peers included.
    pub fn cycles_run(&self) -> u64 {
        self.cycles_run.load(Ordering::Relaxed)
    }

    /// Individual (peer, hive) fetch failures since start.
    pub fn peer_failures(&self) -> u64 {
        self.peer_failures.load(Ordering::Relaxed)
    }

    /// Starts the poll loop. It wakes every interval until the shutdown
    /// signal arrives.
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.settings.peers.is_empty() {
                debug!("no gossip peers configured; engine idle");
            }
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.interval) => {
                        self.run_cycle().await;
                    }
                    _ = shutdown.recv() => {
                        debug!("gossip engine shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// One full poll: every peer concurrently, every hosted hive within a
    /// peer sequentially. Public so tests can drive cycles deterministically.
    pub async fn run_cycle(&self) {
        let hive_ids = self.registry.hive_ids().await;
        if !self.settings.peers.is_empty() && !hive_ids.is_empty() {
            let pulls = self
                .settings
                .peers
                .iter()
                .map(|peer| self.sync_peer(peer, &hive_ids));
            futures::future::join_all(pulls).await;
        }
        let cycle = self.cycles_run.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(cycle, hives = hive_ids.len(), "gossip cycle complete");
    }

    async fn sync_peer(&self, peer: &str, hive_ids: &[String]) {
        for hive_id in hive_ids {
            if let Err(err) = self.sync_hive(peer, hive_id).await {
                self.peer_failures.fetch_add(1, Ordering::Relaxed);
                warn!(peer, hive_id, error = %err, "gossip pull failed");
            }
        }
    }

    async fn sync_hive(&self, peer: &str, hive_id: &str) -> Result<()> {
        // The hive may have been snapshotted just before a restart race;
        // nothing to do if it is not hosted anymore.
        let Some(hive) = self.registry.get(hive_id).await else {
            return Ok(());
        };
        let cursor = hive.peer_cursor(peer).await?;

        let since_ms = cursor.to_string();
        let limit = protocol::READ_LIMIT_CAP.to_string();
        let mut request = self
            .client
            .get(format!("{peer}/gossip/messages"))
            .query(&[
                ("hive_id", hive_id),
                ("since_ms", since_ms.as_str()),
                ("limit", limit.as_str()),
            ]);
        if let Some(secret) = &self.settings.secret {
            request = request.header(GOSSIP_SECRET_HEADER, secret);
        }

        let feed: GossipFeed = request
            .send()
            .await
            .with_context(|| format!("GET {peer}/gossip/messages"))?
            .error_for_status()
            .with_context(|| format!("peer {peer} rejected the pull"))?
            .json()
            .await
            .with_context(|| format!("peer {peer} returned a malformed feed"))?;

        let records: Vec<GossipRecord> = feed
            .messages
            .iter()
            .map(GossipRecord::from_message)
            .collect();
        let outcome = merge_batch(&hive, hive_id, records).await?;

        if outcome.accepted > 0 {
            hive.advance_peer_cursor(peer, outcome.max_accepted_ms)
                .await?;
            debug!(
                peer,
                hive_id,
                accepted = outcome.accepted,
                skipped = outcome.skipped,
                cursor = outcome.max_accepted_ms,
                "gossip pull merged"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_hive::{HiveSettings, MessageCandidate, StoreBacking};

    fn registry() -> Arc<HiveRegistry> {
        Arc::new(HiveRegistry::new(
            HiveSettings::default(),
            StoreBacking::Memory,
        ))
    }

    fn record(uid: &str, created_at_ms: i64) -> GossipRecord {
        GossipRecord {
            uid: Some(uid.to_string()),
            agent_id: Some("remote-agent".to_string()),
            content: Some("relayed".to_string()),
            created_at_ms: Some(created_at_ms),
            ..GossipRecord::default()
        }
    }

    #[tokio::test]
    async fn merge_batch_counts_accepted_skipped_and_tracks_the_cursor() {
        let registry = registry();
        let hive = registry.get_or_spawn("h1").await.unwrap();

        // Seed one record so its uid collides below.
        let seeded = MessageCandidate::local("h1", "a", "x", None, Some("dup".to_string()));
        hive.append(seeded).await.unwrap().unwrap();

        let batch = vec![
            record("fresh-1", 2000),
            record("fresh-2", 5000),
            record("dup", 9000),
            GossipRecord::default(), // malformed: everything missing
        ];
        let outcome = merge_batch(&hive, "h1", batch).await.unwrap();

        assert_eq!(outcome.accepted, 2);
        assert_eq!(outcome.skipped, 2);
        // The duplicate's 9000 never counts; only accepted records move it.
        assert_eq!(outcome.max_accepted_ms, 5000);
    }

    #[tokio::test]
    async fn merged_records_are_gossip_sourced_and_ids_are_local() {
        let registry = registry();
        let hive = registry.get_or_spawn("h1").await.unwrap();

        merge_batch(&hive, "h1", vec![record("u1", 1000)])
            .await
            .unwrap();
        let log = hive.read_since(0, 50).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].id, 1);
        assert_eq!(log[0].source, apiary_hive::MessageSource::Gossip);
    }

    #[tokio::test]
    async fn empty_batch_merges_to_nothing() {
        let registry = registry();
        let hive = registry.get_or_spawn("h1").await.unwrap();
        let outcome = merge_batch(&hive, "h1", Vec::new()).await.unwrap();
        assert_eq!(outcome.accepted, 0);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(outcome.max_accepted_ms, 0);
    }

    #[test]
    fn settings_apply_the_interval_floor() {
        let mut config = ApiaryConfig::default();
        config.gossip_interval_secs = 0;
        config.gossip_http_timeout_secs = 0;
        let settings = GossipSettings::from_config(&config);
        assert_eq!(settings.interval, Duration::from_secs(1));
        assert_eq!(settings.http_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unreachable_peer_is_counted_not_fatal() {
        let registry = registry();
        let hive = registry.get_or_spawn("h1").await.unwrap();
        hive.append(MessageCandidate::local("h1", "a", "x", None, None))
            .await
            .unwrap()
            .unwrap();

        let settings = GossipSettings {
            // Nothing listens here.
            peers: vec!["http://127.0.0.1:1".to_string()],
            secret: None,
            interval: Duration::from_secs(1),
            http_timeout: Duration::from_secs(1),
        };
        let engine = GossipEngine::new(registry.clone(), settings).unwrap();

        engine.run_cycle().await;
        engine.run_cycle().await;

        assert_eq!(engine.cycles_run(), 2);
        assert!(engine.peer_failures() >= 2);
        // Local state is untouched by the failing peer.
        assert_eq!(hive.read_since(0, 50).await.unwrap().len(), 1);
    }
}
