//! The choke algorithm, decides which peers we upload to.
use std::time::Duration;

use hashbrown::HashSet;
use rand::seq::SliceRandom;

use crate::peer::PeerId;

/// What the choker knows about a connected peer, sampled at the start of a
/// round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChokeCandidate {
    pub id: PeerId,
    /// Rate of the peer in the direction that matters for the torrent,
    /// download when leeching, upload when seeding.
    pub rate: u64,
    pub interested: bool,
}

/// Ranks peers by their recent rate and unchokes the best of them, plus one
/// optimistic slot that gives unknown peers a chance to prove themselves.
#[derive(Debug)]
pub struct Choker {
    unchoke_slots: usize,
    round: u64,
    optimistic: Option<PeerId>,
}

impl Choker {
    /// Interval of a choke round.
    pub const INTERVAL: Duration = Duration::from_secs(10);

    /// The optimistic unchoke is rotated every this many rounds.
    pub const OPTIMISTIC_ROUNDS: u64 = 3;

    pub fn new(unchoke_slots: usize) -> Self {
        Self { unchoke_slots, round: 0, optimistic: None }
    }

    pub fn optimistic(&self) -> Option<&PeerId> {
        self.optimistic.as_ref()
    }

    /// Run a round and return the peers that must be unchoked, every other
    /// peer must be choked.
    pub fn run(&mut self, candidates: &[ChokeCandidate]) -> HashSet<PeerId> {
        let mut interested: Vec<&ChokeCandidate> =
            candidates.iter().filter(|c| c.interested).collect();

        // fastest first, the id breaks ties so that rounds are stable
        interested.sort_by(|a, b| b.rate.cmp(&a.rate).then(a.id.0.cmp(&b.id.0)));

        let mut unchoked: HashSet<PeerId> = interested
            .iter()
            .take(self.unchoke_slots)
            .map(|c| c.id.clone())
            .collect();

        let optimistic_alive = self
            .optimistic
            .as_ref()
            .is_some_and(|id| interested.iter().any(|c| c.id == *id && !unchoked.contains(id)));

        if self.round % Self::OPTIMISTIC_ROUNDS == 0 || !optimistic_alive {
            let rest: Vec<&PeerId> = interested
                .iter()
                .map(|c| &c.id)
                .filter(|id| !unchoked.contains(*id))
                .collect();
            self.optimistic =
                rest.choose(&mut rand::thread_rng()).map(|id| (*id).clone());
        }

        if let Some(id) = &self.optimistic {
            unchoked.insert(id.clone());
        }

        self.round += 1;
        unchoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u8, rate: u64, interested: bool) -> ChokeCandidate {
        ChokeCandidate { id: PeerId([n; 20]), rate, interested }
    }

    #[test]
    fn unchokes_fastest_plus_optimistic() {
        let mut choker = Choker::new(2);
        let candidates = vec![
            candidate(1, 100, true),
            candidate(2, 500, true),
            candidate(3, 300, true),
            candidate(4, 900, false),
            candidate(5, 10, true),
        ];

        let unchoked = choker.run(&candidates);

        assert_eq!(unchoked.len(), 3);
        assert!(unchoked.contains(&PeerId([2; 20])));
        assert!(unchoked.contains(&PeerId([3; 20])));
        // not interested peers are never unchoked
        assert!(!unchoked.contains(&PeerId([4; 20])));

        let optimistic = choker.optimistic().cloned().unwrap();
        assert!(optimistic == PeerId([1; 20]) || optimistic == PeerId([5; 20]));
    }

    #[test]
    fn optimistic_rotates_every_three_rounds() {
        let mut choker = Choker::new(0);
        let candidates: Vec<_> = (1..=20).map(|n| candidate(n, 0, true)).collect();

        choker.run(&candidates);
        let first = choker.optimistic().cloned();
        assert!(first.is_some());

        // kept for the rest of the period
        choker.run(&candidates);
        assert_eq!(choker.optimistic().cloned(), first);
        choker.run(&candidates);
        assert_eq!(choker.optimistic().cloned(), first);

        // a new pick on the 4th round, which may be the same peer by chance
        let unchoked = choker.run(&candidates);
        assert_eq!(unchoked.len(), 1);
    }

    #[test]
    fn optimistic_is_replaced_when_it_leaves() {
        let mut choker = Choker::new(0);
        let candidates = vec![candidate(1, 0, true)];
        choker.run(&candidates);
        assert_eq!(choker.optimistic(), Some(&PeerId([1; 20])));

        let candidates = vec![candidate(2, 0, true)];
        let unchoked = choker.run(&candidates);
        assert_eq!(choker.optimistic(), Some(&PeerId([2; 20])));
        assert!(unchoked.contains(&PeerId([2; 20])));

        assert!(choker.run(&[]).is_empty());
        assert!(choker.optimistic().is_none());
    }
}
