use crate::config::DEFAULT_STUN_URL;
use crate::peer::types::{IceCandidate, IceServer, Participant};
use log::{debug, warn};
use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};

static DEFAULT_STUN: Lazy<IceServer> = Lazy::new(|| IceServer::stun(DEFAULT_STUN_URL));

/// Holds candidates and joins that reference a peer session which does not
/// exist yet (or cannot accept them yet).
#[derive(Debug)]
pub struct EarlyArrivals {
    candidates: HashMap<String, VecDeque<IceCandidate>>,
    joins: HashMap<String, Participant>,
    max_candidates: usize,
}

impl EarlyArrivals {
    pub fn new(max_candidates: usize) -> Self {
        Self {
            candidates: HashMap::new(),
            joins: HashMap::new(),
            max_candidates: max_candidates.max(1),
        }
    }

    /// Appends in arrival order. On overflow the oldest candidate is dropped.
    pub fn buffer_candidate(&mut self, participant_id: &str, candidate: IceCandidate) {
        let queue = self.candidates.entry(participant_id.to_owned()).or_default();
        if queue.len() >= self.max_candidates {
            warn!(
                "Early candidate buffer for {} full ({}), dropping oldest",
                participant_id, self.max_candidates
            );
            queue.pop_front();
        }
        queue.push_back(candidate);
        debug!(
            "Queued early candidate for {}, {} pending",
            participant_id,
            queue.len()
        );
    }

    /// Returns and clears every buffered candidate for the participant, oldest first.
    pub fn flush(&mut self, participant_id: &str) -> Vec<IceCandidate> {
        self.candidates
            .remove(participant_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn pending_candidates(&self, participant_id: &str) -> usize {
        self.candidates.get(participant_id).map_or(0, VecDeque::len)
    }

    /// Upserts by participant id; a later join replaces an earlier one.
    pub fn buffer_join(&mut self, participant: Participant) {
        debug!("Queued early join for {}", participant.id);
        self.joins.insert(participant.id.clone(), participant);
    }

    /// Drains every buffered join. Order is unspecified.
    pub fn flush_all(&mut self) -> Vec<Participant> {
        self.joins.drain().map(|(_, participant)| participant).collect()
    }

    pub fn pending_joins(&self) -> usize {
        self.joins.len()
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
        self.joins.clear();
    }
}

/// Server list handed to every new transport: configured servers, then
/// fetched TURN credentials, then the public STUN fallback.
pub fn assemble_ice_servers(configured: &[IceServer], fetched: &[IceServer]) -> Vec<IceServer> {
    let mut servers: Vec<IceServer> = configured.iter().chain(fetched).cloned().collect();
    let has_default = servers
        .iter()
        .any(|s| s.urls.iter().any(|u| u == DEFAULT_STUN_URL));
    if !has_default {
        servers.push(DEFAULT_STUN.clone());
    }
    servers
}

pub fn analyze_candidates(label: &str, candidates: &[IceCandidate]) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host_count += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx_count += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay_count += 1;
        }
    }

    debug!(
        "Candidates for {}: {} host, {} srflx, {} relay",
        label, host_count, srflx_count, relay_count
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn flush_preserves_arrival_order_and_clears() {
        let mut early = EarlyArrivals::new(16);
        for n in 1..=3 {
            early.buffer_candidate("u9", cand(n));
        }
        early.buffer_candidate("u7", cand(9));
        assert_eq!(early.flush("u9"), vec![cand(1), cand(2), cand(3)]);
        assert!(early.flush("u9").is_empty());
        assert_eq!(early.pending_candidates("u7"), 1);
    }

    #[test]
    fn overflow_drops_the_oldest() {
        let mut early = EarlyArrivals::new(2);
        for n in 1..=3 {
            early.buffer_candidate("u9", cand(n));
        }
        assert_eq!(early.flush("u9"), vec![cand(2), cand(3)]);
    }

    #[test]
    fn joins_upsert_by_id_and_drain_once() {
        let mut early = EarlyArrivals::new(4);
        early.buffer_join(Participant::new("a").with_user_name("first"));
        early.buffer_join(Participant::new("b"));
        early.buffer_join(Participant::new("a").with_user_name("second"));
        assert_eq!(early.pending_joins(), 2);

        let mut drained = early.flush_all();
        drained.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].user_name.as_deref(), Some("second"));
        assert!(early.flush_all().is_empty());
    }

    #[test]
    fn default_stun_is_appended_once() {
        let turn = IceServer {
            urls: vec!["turn:10.0.0.1:3478?transport=udp".into()],
            username: "1652113421:abc".into(),
            credential: "secret".into(),
            ttl: 86400,
        };
        let servers = assemble_ice_servers(&[], &[turn.clone()]);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0], turn);
        assert_eq!(servers[1].urls, vec![DEFAULT_STUN_URL.to_owned()]);

        let again = assemble_ice_servers(&servers, &[]);
        assert_eq!(again.len(), 2);
    }
}
