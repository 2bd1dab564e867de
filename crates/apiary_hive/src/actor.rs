//! Per-hive actor — the single writer for everything one hive owns.
//!
//! Each hive runs as one tokio task holding its challenges, sessions,
//! message log, and peer cursors. Commands arrive on an mpsc channel and are
//! processed strictly in order, which is what makes id allocation, uid
//! dedup-and-insert, and cursor advancement atomic without any locking.
//! Different hives are fully independent tasks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::debug;

use apiary_core::error::{ApiaryError, AuthFailure};
use apiary_core::{ApiaryConfig, protocol};

use crate::auth::{self, AuthPolicy, JoinRequest};
use crate::challenge::{Challenge, ChallengeManager};
use crate::message::{HiveMessage, MessageCandidate};
use crate::session::{Session, SessionStore};
use crate::store::{MemoryBackend, MessageStore, SqliteBackend};

/// Channel depth per hive actor.
const COMMAND_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Settings and backing selection
// ---------------------------------------------------------------------------

/// Per-hive tunables, shared by every actor the registry spawns.
#[derive(Debug, Clone, Copy)]
pub struct HiveSettings {
    pub challenge_ttl_ms: i64,
    pub session_ttl_ms: i64,
    pub auth: AuthPolicy,
}

impl Default for HiveSettings {
    fn default() -> Self {
        Self {
            challenge_ttl_ms: protocol::CHALLENGE_TTL_MS,
            session_ttl_ms: protocol::SESSION_TTL_MS,
            auth: AuthPolicy::default(),
        }
    }
}

impl HiveSettings {
    pub fn from_config(config: &ApiaryConfig) -> Self {
        Self {
            challenge_ttl_ms: config.challenge_ttl_secs as i64 * 1000,
            session_ttl_ms: config.session_ttl_secs as i64 * 1000,
            auth: AuthPolicy {
                max_clock_skew_ms: config.max_clock_skew_secs as i64 * 1000,
                device_proof_required: config.device_proof_required,
                device_proof_max_age_ms: config.device_proof_max_age_secs as i64 * 1000,
            },
        }
    }
}

/// Where a hive's message log lives. Challenges, sessions, and cursors are
/// always in-memory; losing them on restart only forces a re-join.
#[derive(Debug, Clone)]
pub enum StoreBacking {
    Memory,
    /// All hives share one SQLite file; each actor opens its own connection.
    Sqlite(PathBuf),
}

impl StoreBacking {
    fn open(&self) -> Result<MessageStore, ApiaryError> {
        match self {
            Self::Memory => Ok(MessageStore::new(Box::new(MemoryBackend::new()))),
            Self::Sqlite(path) => {
                let backend = SqliteBackend::open(path)
                    .map_err(|e| ApiaryError::Storage(e.to_string()))?;
                Ok(MessageStore::new(Box::new(backend)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Everything minted by a successful join.
#[derive(Debug, Clone)]
pub struct JoinGrant {
    pub token: String,
    pub session: Session,
}

enum HiveCommand {
    IssueChallenge {
        agent_id: String,
        pubkey: String,
        reply: oneshot::Sender<Result<Challenge, ApiaryError>>,
    },
    Join {
        request: Box<JoinRequest>,
        reply: oneshot::Sender<Result<JoinGrant, ApiaryError>>,
    },
    ValidateSession {
        token: String,
        reply: oneshot::Sender<Option<Session>>,
    },
    Append {
        candidate: MessageCandidate,
        reply: oneshot::Sender<Result<Option<HiveMessage>, ApiaryError>>,
    },
    ReadSince {
        since_id: i64,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<HiveMessage>, ApiaryError>>,
    },
    ReadSinceTime {
        since_ms: i64,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<HiveMessage>, ApiaryError>>,
    },
    PeerCursor {
        peer: String,
        reply: oneshot::Sender<i64>,
    },
    AdvancePeerCursor {
        peer: String,
        cursor_ms: i64,
    },
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct HiveActor {
    hive_id: String,
    challenges: ChallengeManager,
    sessions: SessionStore,
    store: MessageStore,
    /// Per-peer gossip high-water marks on created_at_ms.
    cursors: HashMap<String, i64>,
    auth_policy: AuthPolicy,
}

impl HiveActor {
    async fn run(mut self, mut rx: mpsc::Receiver<HiveCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        debug!("hive actor for '{}' stopped", self.hive_id);
    }

    fn handle(&mut self, command: HiveCommand) {
        match command {
            HiveCommand::IssueChallenge { agent_id, pubkey, reply } => {
                let result = self.challenges.issue(&agent_id, &pubkey, &self.hive_id);
                let _ = reply.send(result);
            }
            HiveCommand::Join { request, reply } => {
                let _ = reply.send(self.join(&request));
            }
            HiveCommand::ValidateSession { token, reply } => {
                let _ = reply.send(self.sessions.validate(&token));
            }
            HiveCommand::Append { candidate, reply } => {
                let result = self
                    .store
                    .append(candidate)
                    .map_err(|e| ApiaryError::Storage(e.to_string()));
                let _ = reply.send(result);
            }
            HiveCommand::ReadSince { since_id, limit, reply } => {
                let result = self
                    .store
                    .read_since(&self.hive_id, since_id, limit)
                    .map_err(|e| ApiaryError::Storage(e.to_string()));
                let _ = reply.send(result);
            }
            HiveCommand::ReadSinceTime { since_ms, limit, reply } => {
                let result = self
                    .store
                    .read_since_time(&self.hive_id, since_ms, limit)
                    .map_err(|e| ApiaryError::Storage(e.to_string()));
                let _ = reply.send(result);
            }
            HiveCommand::PeerCursor { peer, reply } => {
                let _ = reply.send(self.cursors.get(&peer).copied().unwrap_or(0));
            }
            HiveCommand::AdvancePeerCursor { peer, cursor_ms } => {
                // Cursors never move backwards.
                let entry = self.cursors.entry(peer).or_insert(0);
                *entry = (*entry).max(cursor_ms);
            }
        }
    }

    fn join(&mut self, request: &JoinRequest) -> Result<JoinGrant, ApiaryError> {
        if request.hive_id != self.hive_id {
            return Err(AuthFailure::BindingMismatch.into());
        }
        let consumed = auth::authenticate(&mut self.challenges, request, &self.auth_policy)?;
        let (token, session) =
            self.sessions
                .create(&consumed.agent_id, &consumed.pubkey, &consumed.hive_id);
        Ok(JoinGrant { token, session })
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheaply cloneable sender side of a hive actor. Every await resolves once
/// the actor has serialized the command, so callers observe a consistent
/// per-hive ordering.
#[derive(Clone)]
pub struct HiveHandle {
    hive_id: Arc<str>,
    tx: mpsc::Sender<HiveCommand>,
}

impl HiveHandle {
    pub fn hive_id(&self) -> &str {
        &self.hive_id
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> HiveCommand,
    ) -> Result<T, ApiaryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| ApiaryError::Storage("hive actor unavailable".to_string()))?;
        reply_rx
            .await
            .map_err(|_| ApiaryError::Storage("hive actor dropped reply".to_string()))
    }

    pub async fn issue_challenge(
        &self,
        agent_id: &str,
        pubkey: &str,
    ) -> Result<Challenge, ApiaryError> {
        let agent_id = agent_id.to_string();
        let pubkey = pubkey.to_string();
        self.request(|reply| HiveCommand::IssueChallenge { agent_id, pubkey, reply })
            .await?
    }

    pub async fn join(&self, request: JoinRequest) -> Result<JoinGrant, ApiaryError> {
        self.request(|reply| HiveCommand::Join { request: Box::new(request), reply })
            .await?
    }

    pub async fn validate_session(&self, token: &str) -> Result<Option<Session>, ApiaryError> {
        let token = token.to_string();
        self.request(|reply| HiveCommand::ValidateSession { token, reply })
            .await
    }

    pub async fn append(
        &self,
        candidate: MessageCandidate,
    ) -> Result<Option<HiveMessage>, ApiaryError> {
        self.request(|reply| HiveCommand::Append { candidate, reply })
            .await?
    }

    pub async fn read_since(
        &self,
        since_id: i64,
        limit: usize,
    ) -> Result<Vec<HiveMessage>, ApiaryError> {
        self.request(|reply| HiveCommand::ReadSince { since_id, limit, reply })
            .await?
    }

    pub async fn read_since_time(
        &self,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<HiveMessage>, ApiaryError> {
        self.request(|reply| HiveCommand::ReadSinceTime { since_ms, limit, reply })
            .await?
    }

    pub async fn peer_cursor(&self, peer: &str) -> Result<i64, ApiaryError> {
        let peer = peer.to_string();
        self.request(|reply| HiveCommand::PeerCursor { peer, reply })
            .await
    }

    /// Fire-and-forget by design: the mpsc channel still orders it after
    /// every append the caller already awaited.
    pub async fn advance_peer_cursor(&self, peer: &str, cursor_ms: i64) -> Result<(), ApiaryError> {
        self.tx
            .send(HiveCommand::AdvancePeerCursor {
                peer: peer.to_string(),
                cursor_ms,
            })
            .await
            .map_err(|_| ApiaryError::Storage("hive actor unavailable".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Routes a hive id to its actor, spawning one on first use.
pub struct HiveRegistry {
    hives: RwLock<HashMap<String, HiveHandle>>,
    settings: HiveSettings,
    backing: StoreBacking,
}

impl HiveRegistry {
    pub fn new(settings: HiveSettings, backing: StoreBacking) -> Self {
        Self {
            hives: RwLock::new(HashMap::new()),
            settings,
            backing,
        }
    }

    pub fn settings(&self) -> &HiveSettings {
        &self.settings
    }

    /// Returns the hive's handle without creating it.
    pub async fn get(&self, hive_id: &str) -> Option<HiveHandle> {
        self.hives.read().await.get(hive_id).cloned()
    }

    /// Returns the hive's handle, spawning its actor if this is the first
    /// time the hive is referenced.
    pub async fn get_or_spawn(&self, hive_id: &str) -> Result<HiveHandle, ApiaryError> {
        if let Some(handle) = self.get(hive_id).await {
            return Ok(handle);
        }

        let mut hives = self.hives.write().await;
        // Lost the race to another spawner.
        if let Some(handle) = hives.get(hive_id) {
            return Ok(handle.clone());
        }

        let store = self.backing.open()?;
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = HiveActor {
            hive_id: hive_id.to_string(),
            challenges: ChallengeManager::new(self.settings.challenge_ttl_ms),
            sessions: SessionStore::new(self.settings.session_ttl_ms),
            store,
            cursors: HashMap::new(),
            auth_policy: self.settings.auth,
        };
        tokio::spawn(actor.run(rx));
        debug!("hive actor for '{hive_id}' spawned");

        let handle = HiveHandle {
            hive_id: Arc::from(hive_id),
            tx,
        };
        hives.insert(hive_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Snapshot of the hives this server currently hosts.
    pub async fn hive_ids(&self) -> Vec<String> {
        self.hives.read().await.keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
