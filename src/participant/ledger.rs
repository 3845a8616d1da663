//! The per-participant vote ledger and majority decision.

use std::collections::{BTreeMap, BTreeSet};

use crate::protocol::{Identity, Vote};

/// What a participant reports once its rounds are over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// The majority choice.
    pub choice: String,
    /// Every identity that contributed at least one vote, ascending.
    pub contributors: Vec<Identity>,
    /// Number of rounds that were run.
    pub rounds: u32,
}

/// Every distinct vote a participant has seen. Never shrinks.
#[derive(Debug, Clone, Default)]
pub struct VoteLedger {
    votes: BTreeSet<Vote>,
}

impl VoteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn contains(&self, vote: &Vote) -> bool {
        self.votes.contains(vote)
    }

    pub fn votes(&self) -> impl Iterator<Item = &Vote> {
        self.votes.iter()
    }

    /// Merge pending votes and return the ones not seen before.
    ///
    /// The result is what gets flooded this round; duplicates inside
    /// `pending` itself are collapsed too.
    pub fn absorb(&mut self, pending: impl IntoIterator<Item = Vote>) -> Vec<Vote> {
        let mut fresh: Vec<Vote> = pending
            .into_iter()
            .filter(|vote| self.votes.insert(vote.clone()))
            .collect();
        fresh.sort();
        fresh
    }

    /// The choice with the most votes.
    ///
    /// Ties go to the lexicographically smallest choice.
    pub fn majority(&self) -> Option<&str> {
        let mut tally: BTreeMap<&str, usize> = BTreeMap::new();
        for vote in &self.votes {
            *tally.entry(vote.choice.as_str()).or_default() += 1;
        }

        let mut best: Option<(&str, usize)> = None;
        for (choice, count) in tally {
            if best.map_or(true, |(_, top)| count > top) {
                best = Some((choice, count));
            }
        }
        best.map(|(choice, _)| choice)
    }

    /// Distinct voters, ascending.
    pub fn contributors(&self) -> Vec<Identity> {
        let ids: BTreeSet<Identity> = self.votes.iter().map(|v| v.participant).collect();
        ids.into_iter().collect()
    }

    /// Majority plus contributors, if any vote has been seen.
    pub fn decide(&self, rounds: u32) -> Option<Decision> {
        self.majority().map(|choice| Decision {
            choice: choice.to_string(),
            contributors: self.contributors(),
            rounds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn ledger_of(votes: &[(Identity, &str)]) -> VoteLedger {
        let mut ledger = VoteLedger::new();
        ledger.absorb(votes.iter().map(|(id, c)| Vote::new(*id, *c)));
        ledger
    }

    #[test]
    fn test_absorb_returns_only_new_votes() {
        let mut ledger = VoteLedger::new();
        let fresh = ledger.absorb(vec![Vote::new(1, "yes"), Vote::new(2, "no")]);
        assert_eq!(fresh.len(), 2);

        let fresh = ledger.absorb(vec![
            Vote::new(2, "no"),
            Vote::new(3, "yes"),
            Vote::new(3, "yes"),
        ]);
        assert_eq!(fresh, vec![Vote::new(3, "yes")]);
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_same_identity_different_choice_is_distinct() {
        let ledger = ledger_of(&[(1, "yes"), (1, "no")]);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.contributors(), vec![1]);
    }

    #[test]
    fn test_no_duplicates_for_any_insertion_order() {
        let base: Vec<Vote> = [(1, "a"), (2, "b"), (3, "a"), (1, "a"), (2, "b"), (4, "c"), (3, "a")]
            .iter()
            .map(|(id, c)| Vote::new(*id, *c))
            .collect();
        let expected: BTreeSet<Vote> = base.iter().cloned().collect();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let mut sequence = base.clone();
            sequence.shuffle(&mut rng);
            let split = sequence.len() / 2;

            let mut ledger = VoteLedger::new();
            let mut flooded = ledger.absorb(sequence[..split].to_vec());
            flooded.extend(ledger.absorb(sequence[split..].to_vec()));

            assert_eq!(ledger.len(), expected.len());
            assert_eq!(ledger.votes().cloned().collect::<BTreeSet<_>>(), expected);
            flooded.sort();
            flooded.dedup();
            assert_eq!(flooded.len(), expected.len());
        }
    }

    #[test]
    fn test_majority_wins() {
        let ledger = ledger_of(&[(1, "A"), (2, "A"), (3, "A"), (4, "B"), (5, "B")]);
        assert_eq!(ledger.majority(), Some("A"));

        let ledger = ledger_of(&[(1, "B"), (2, "A"), (3, "B")]);
        assert_eq!(ledger.majority(), Some("B"));
    }

    #[test]
    fn test_majority_tie_is_lexicographic() {
        let ledger = ledger_of(&[(1, "no"), (2, "yes")]);
        assert_eq!(ledger.majority(), Some("no"));

        let ledger = ledger_of(&[(3, "yes"), (1, "maybe"), (2, "no"), (4, "yes"), (5, "maybe")]);
        assert_eq!(ledger.majority(), Some("maybe"));
    }

    #[test]
    fn test_empty_ledger_has_no_decision() {
        let ledger = VoteLedger::new();
        assert_eq!(ledger.majority(), None);
        assert!(ledger.decide(0).is_none());
    }

    #[test]
    fn test_decide() {
        let ledger = ledger_of(&[(5003, "no"), (5001, "yes"), (5002, "yes")]);
        assert_eq!(
            ledger.decide(2),
            Some(Decision {
                choice: "yes".to_string(),
                contributors: vec![5001, 5002, 5003],
                rounds: 2,
            })
        );
    }
}
