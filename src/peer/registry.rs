use crate::peer::connection::PeerTransport;
use crate::peer::types::{MediaStatus, Participant};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Slot of the local publish session.
pub const LOCAL_SLOT: u32 = 0;

/// One negotiation channel to (or from) a participant.
#[derive(Clone)]
pub struct PeerSession {
    pub participant: Participant,
    pub slot: u32,
    pub transport: Arc<dyn PeerTransport>,
    /// Set once the remote description has been applied; candidates are
    /// buffered until then.
    pub has_remote_description: bool,
}

impl PeerSession {
    pub fn new(participant: Participant, slot: u32, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            participant,
            slot,
            transport,
            has_remote_description: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.participant.id
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("participant", &self.participant.id)
            .field("slot", &self.slot)
            .field("state", &self.transport.connection_state())
            .field("has_remote_description", &self.has_remote_description)
            .finish()
    }
}

/// Maps participant ids to their peer sessions, slots and media flags.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    local_id: Option<String>,
    sessions: HashMap<String, PeerSession>,
    used_slots: BTreeSet<u32>,
    media: HashMap<String, MediaStatus>,
    remote_count: usize,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local_id(&mut self, id: Option<String>) {
        self.local_id = id;
    }

    fn is_local(&self, id: &str) -> bool {
        self.local_id.as_deref() == Some(id)
    }

    /// Registers `session`, first removing any session it supersedes.
    pub fn put(&mut self, id: &str, session: PeerSession) -> Option<PeerSession> {
        let previous = self.remove(id);
        if !self.is_local(id) {
            self.remote_count += 1;
        }
        self.used_slots.insert(session.slot);
        self.sessions.insert(id.to_owned(), session);
        previous
    }

    pub fn get(&self, id: &str) -> Option<&PeerSession> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PeerSession> {
        self.sessions.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Removes the session and media flags for `id`. Unknown ids are a no-op.
    pub fn remove(&mut self, id: &str) -> Option<PeerSession> {
        self.media.remove(id);
        let removed = self.sessions.remove(id)?;
        self.used_slots.remove(&removed.slot);
        if !self.is_local(id) {
            self.remote_count = self.remote_count.saturating_sub(1);
        }
        Some(removed)
    }

    pub fn remove_many<'a, I>(&mut self, ids: I) -> Vec<PeerSession>
    where
        I: IntoIterator<Item = &'a str>,
    {
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn remote_count(&self) -> usize {
        self.remote_count
    }

    /// Lowest positive slot not held by a live session.
    pub fn next_free_slot(&self) -> u32 {
        let mut candidate = LOCAL_SLOT + 1;
        for &used in self.used_slots.range(candidate..) {
            if used != candidate {
                break;
            }
            candidate += 1;
        }
        candidate
    }

    /// Slots of remote sessions, ascending.
    pub fn remote_slots(&self) -> Vec<u32> {
        self.used_slots
            .iter()
            .copied()
            .filter(|slot| *slot != LOCAL_SLOT)
            .collect()
    }

    pub fn media_status(&self, id: &str) -> Option<MediaStatus> {
        self.media.get(id).copied()
    }

    pub fn media_status_mut(&mut self, id: &str) -> &mut MediaStatus {
        self.media.entry(id.to_owned()).or_default()
    }

    pub fn clear(&mut self) -> Vec<PeerSession> {
        let ids = self.ids();
        self.remove_many(ids.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::peer::types::{ConnectionState, IceCandidate, LocalMedia, MediaKind};
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl PeerTransport for NullTransport {
        async fn add_local_media(&self, _media: &LocalMedia) -> Result<()> {
            Ok(())
        }
        async fn add_receive_only(&self, _kind: MediaKind) -> Result<()> {
            Ok(())
        }
        async fn create_offer(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn set_local_offer(&self, _sdp: &str) -> Result<()> {
            Ok(())
        }
        async fn set_remote_answer(&self, _sdp: &str) -> Result<()> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<()> {
            Ok(())
        }
        fn connection_state(&self) -> ConnectionState {
            ConnectionState::New
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn session(id: &str, slot: u32) -> PeerSession {
        PeerSession::new(Participant::new(id), slot, Arc::new(NullTransport))
    }

    fn registry_with_slots(slots: &[u32]) -> PeerRegistry {
        let mut registry = PeerRegistry::new();
        registry.set_local_id(Some("me".into()));
        for slot in slots {
            let id = format!("u{slot}");
            registry.put(&id, session(&id, *slot));
        }
        registry
    }

    #[test]
    fn next_slot_fills_the_lowest_gap() {
        assert_eq!(registry_with_slots(&[1, 3, 4]).next_free_slot(), 2);
        assert_eq!(registry_with_slots(&[1, 2, 3]).next_free_slot(), 4);
        assert_eq!(registry_with_slots(&[]).next_free_slot(), 1);
        assert_eq!(registry_with_slots(&[2]).next_free_slot(), 1);
    }

    #[test]
    fn local_slot_is_never_handed_out() {
        let mut registry = registry_with_slots(&[]);
        registry.put("me", session("me", LOCAL_SLOT));
        assert_eq!(registry.next_free_slot(), 1);
        assert!(registry.remote_slots().is_empty());
        assert_eq!(registry.remote_count(), 0);
    }

    #[test]
    fn removing_unknown_id_is_a_noop() {
        let mut registry = registry_with_slots(&[1]);
        assert!(registry.remove("ghost").is_none());
        assert!(registry.remove_many(["ghost", "phantom"]).is_empty());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.remote_count(), 1);
    }

    #[test]
    fn put_supersedes_existing_session() {
        let mut registry = registry_with_slots(&[1]);
        let previous = registry.put("u1", session("u1", 2));
        assert_eq!(previous.map(|s| s.slot), Some(1));
        assert_eq!(registry.remote_slots(), vec![2]);
        assert_eq!(registry.remote_count(), 1);
    }

    #[test]
    fn removal_discards_media_status_and_frees_slot() {
        let mut registry = registry_with_slots(&[1, 2]);
        registry.media_status_mut("u1").set(MediaKind::Audio, false);
        registry.remove("u1");
        assert!(registry.media_status("u1").is_none());
        assert_eq!(registry.next_free_slot(), 1);
        assert_eq!(registry.remote_count(), 1);
    }

    #[test]
    fn local_removal_keeps_remote_count() {
        let mut registry = registry_with_slots(&[1]);
        registry.put("me", session("me", LOCAL_SLOT));
        registry.remove("me");
        assert_eq!(registry.remote_count(), 1);
        assert_eq!(registry.clear().len(), 1);
        assert_eq!(registry.remote_count(), 0);
    }
}
