//! Tally state for the active poll of a meeting.

use std::collections::HashMap;

/// One question with up to five answers and the votes cast so far.
///
/// Inputs are validated at the meeting layer; the poll trusts that every
/// recorded answer index is within `answers`.
#[derive(Debug)]
pub struct Poll {
    question: String,
    answers: Vec<String>,
    votes: HashMap<i32, usize>,
}

impl Poll {
    pub fn new(question: String, answers: Vec<String>) -> Self {
        Self {
            question,
            answers,
            votes: HashMap::new(),
        }
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn answers(&self) -> &[String] {
        &self.answers
    }

    /// Record or overwrite a vote. Returns true iff this key had already
    /// voted (the caller announces a changed vote differently).
    pub fn cast_vote(&mut self, keyid: i32, answer: usize) -> bool {
        self.votes.insert(keyid, answer).is_some()
    }

    /// Number of distinct voters.
    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    /// Counts per answer slot. Always five slots; positions beyond the
    /// declared answers stay zero.
    pub fn tally(&self) -> [i32; 5] {
        let mut tally = [0; 5];
        for &answer in self.votes.values() {
            tally[answer] += 1;
        }
        tally
    }

    /// Membership keys that have voted. Empty when nobody has.
    pub fn voted(&self) -> Vec<i32> {
        self.votes.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll() -> Poll {
        Poll::new(
            "Approve the budget?".to_string(),
            vec!["yes".to_string(), "no".to_string()],
        )
    }

    #[test]
    fn first_vote_is_not_a_change() {
        let mut p = poll();
        assert!(!p.cast_vote(1, 0));
        assert!(p.cast_vote(1, 1));
        assert_eq!(p.vote_count(), 1);
    }

    #[test]
    fn recast_overwrites_the_tally() {
        let mut p = poll();
        p.cast_vote(1, 0);
        p.cast_vote(2, 0);
        p.cast_vote(1, 1);
        assert_eq!(p.tally(), [1, 1, 0, 0, 0]);
        assert_eq!(p.vote_count(), 2);
    }

    #[test]
    fn voted_is_empty_not_absent() {
        let p = poll();
        assert!(p.voted().is_empty());
    }

    #[test]
    fn last_answer_index_is_countable() {
        let mut p = poll();
        p.cast_vote(5, p.answers().len() - 1);
        assert_eq!(p.tally()[1], 1);
    }
}
