//! Encounter admission.
//!
//! Before a session starts, both ends exchange peer ids and the manager
//! decides whether the encounter should happen at all: denied peers, peers
//! with a live connection, and peers met within the cool-down are refused.
//!
//! Transports where both sides may dial each other at the same moment set
//! `double_connect_prone`. Both ends then exchange a random `u32`; an
//! initiator that drew the smaller value backs off for a moment and checks
//! again, by which time the other connection has usually been registered.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use asap_core::PeerId;

use crate::codec;
use crate::config::EncounterConfig;
use crate::error::{Result, SyncError};
use crate::listener::ListenerRegistry;
use crate::session::{ConnectionListener, SessionHandle};

/// Outcome of the tie-break exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// Go ahead with the connection.
    Proceed,
    /// Wait, then re-check admission.
    Wait,
}

/// Decide the tie-break for one end of a connection.
///
/// Only the initiator ever waits, and only when its value is the smaller one.
/// Equal values let both ends proceed; registration then admits one
/// connection and refuses the other.
pub fn tie_break(initiator: bool, local: u32, remote: u32) -> TieBreak {
    if initiator && local < remote {
        TieBreak::Wait
    } else {
        TieBreak::Proceed
    }
}

/// Observer of the set of connected peers.
pub trait OnlinePeersListener: Send + Sync {
    fn online_peers_changed(&self, peers: &[PeerId]);
}

/// A connection that passed admission.
pub struct Admitted<R, W> {
    pub remote: PeerId,
    pub address: String,
    pub reader: R,
    pub writer: W,
}

#[derive(Default)]
struct Registry {
    denied: HashSet<PeerId>,
    /// Connected peers and the address they are connected from.
    active: HashMap<PeerId, String>,
    /// Alternative addresses known to belong to a peer.
    aliases: HashMap<String, PeerId>,
    last_encounter: HashMap<PeerId, Instant>,
}

impl Registry {
    fn resolve(&self, address: &str) -> Option<&PeerId> {
        self.aliases.get(address)
    }

    fn address_active(&self, address: &str) -> bool {
        self.active.values().any(|active| active == address)
            || self
                .resolve(address)
                .map(|peer| self.active.contains_key(peer))
                .unwrap_or(false)
    }

    fn online(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.active.keys().cloned().collect();
        peers.sort();
        peers
    }
}

/// Admission control for encounters.
pub struct EncounterManager {
    local: PeerId,
    config: EncounterConfig,
    registry: Mutex<Registry>,
    listeners: ListenerRegistry<dyn OnlinePeersListener>,
}

impl EncounterManager {
    pub fn new(local: PeerId, config: EncounterConfig) -> Self {
        Self {
            local,
            config,
            registry: Mutex::new(Registry::default()),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn config(&self) -> &EncounterConfig {
        &self.config
    }

    pub fn listeners(&self) -> &ListenerRegistry<dyn OnlinePeersListener> {
        &self.listeners
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse every future encounter with `peer`.
    pub fn deny(&self, peer: PeerId) {
        self.registry().denied.insert(peer);
    }

    /// Lift a denial.
    pub fn allow(&self, peer: &PeerId) {
        self.registry().denied.remove(peer);
    }

    /// Record that `address` also reaches `peer`. Aliases last until the
    /// peer's encounter ends.
    pub fn add_alias(&self, address: impl Into<String>, peer: PeerId) {
        self.registry().aliases.insert(address.into(), peer);
    }

    /// Peers with a live session, sorted.
    pub fn online_peers(&self) -> Vec<PeerId> {
        self.registry().online()
    }

    /// Whether a connection to `peer` (if known) at `address` should be made.
    pub fn should_connect(&self, peer: Option<&PeerId>, address: &str) -> bool {
        self.should_connect_at(peer, address, Instant::now())
    }

    /// [`Self::should_connect`] evaluated at `now`.
    pub fn should_connect_at(&self, peer: Option<&PeerId>, address: &str, now: Instant) -> bool {
        let registry = self.registry();
        Self::admissible(&registry, &self.config, peer, address, now)
    }

    fn admissible(
        registry: &Registry,
        config: &EncounterConfig,
        peer: Option<&PeerId>,
        address: &str,
        now: Instant,
    ) -> bool {
        if registry.address_active(address) {
            return false;
        }

        let Some(peer) = peer.or_else(|| registry.resolve(address)) else {
            return true;
        };
        if registry.denied.contains(peer) || registry.active.contains_key(peer) {
            return false;
        }
        match registry.last_encounter.get(peer) {
            Some(last) => now.saturating_duration_since(*last) >= config.cool_down,
            None => true,
        }
    }

    /// Admit `peer` at `address` if still admissible. Check and insert happen
    /// under one lock, so of two racing connections only one registers.
    fn try_register(&self, peer: &PeerId, address: &str) -> bool {
        let online = {
            let mut registry = self.registry();
            if !Self::admissible(&registry, &self.config, Some(peer), address, Instant::now()) {
                return false;
            }
            registry.active.insert(peer.clone(), address.to_string());
            registry.online()
        };
        self.notify(&online);
        true
    }

    /// Forget the live connection of `peer` and its aliases, starting its
    /// cool-down.
    pub fn unregister(&self, peer: &PeerId) {
        let online = {
            let mut registry = self.registry();
            let Some(address) = registry.active.remove(peer) else {
                return;
            };
            registry.aliases.retain(|_, owner| owner != peer);
            registry.last_encounter.insert(peer.clone(), Instant::now());
            tracing::debug!(peer = %peer, address = %address, "encounter ended");
            registry.online()
        };
        self.notify(&online);
    }

    fn notify(&self, online: &[PeerId]) {
        for listener in self.listeners.snapshot() {
            listener.online_peers_changed(online);
        }
    }

    /// Run the admission handshake on a fresh connection.
    ///
    /// On success the remote peer is registered as online until
    /// [`Self::unregister`] (or the session's termination, when the manager
    /// is a connection listener) removes it.
    pub async fn accept<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        address: impl Into<String>,
        initiator: bool,
    ) -> Result<Admitted<R, W>>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let address = address.into();
        let deadline = self.config.handshake_timeout;

        let remote = tokio::time::timeout(deadline, async {
            codec::write_peer_id(&mut writer, &self.local).await?;
            codec::read_peer_id(&mut reader).await
        })
        .await
        .map_err(|_| SyncError::Timeout(deadline))??;

        if remote == self.local {
            return Err(SyncError::AdmissionDenied("connected to self".into()));
        }
        if !self.should_connect(Some(&remote), &address) {
            return Err(SyncError::AdmissionDenied(format!("encounter with {} refused", remote)));
        }

        if self.config.double_connect_prone {
            let local_value: u32 = rand::random();
            let remote_value = tokio::time::timeout(deadline, async {
                writer.write_u32(local_value).await?;
                writer.flush().await?;
                reader.read_u32().await
            })
            .await
            .map_err(|_| SyncError::Timeout(deadline))??;

            if tie_break(initiator, local_value, remote_value) == TieBreak::Wait {
                tracing::debug!(peer = %remote, local_value, remote_value, "lost tie-break, waiting");
                tokio::time::sleep(self.config.tie_break_delay).await;
                if !self.should_connect(Some(&remote), &address) {
                    return Err(SyncError::AdmissionDenied(format!(
                        "{} already connected after tie-break",
                        remote
                    )));
                }
            }
        }

        if !self.try_register(&remote, &address) {
            return Err(SyncError::AdmissionDenied(format!("{} already connected", remote)));
        }

        tracing::info!(peer = %remote, address = %address, initiator, "encounter admitted");
        Ok(Admitted {
            remote,
            address,
            reader,
            writer,
        })
    }
}

impl ConnectionListener for EncounterManager {
    fn session_terminated(&self, session: &SessionHandle, _reason: &SyncError) {
        self.unregister(session.remote());
    }
}
