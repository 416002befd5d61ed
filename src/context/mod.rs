mod sqlite;

pub use sqlite::SqliteContextStore;

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::types::{StoreStats, Turn};

/// Durable mapping from conversation id to ordered turn history.
///
/// Session consistency only: a successful `append` must be visible to the
/// immediately following `get_recent` on the same conversation. Nothing is
/// promised across conversations.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Up to `limit` most recent turns, oldest of the returned window first.
    async fn get_recent(&self, conversation_id: i64, limit: usize) -> anyhow::Result<Vec<Turn>>;

    /// Durably add one turn. Safe to call twice back-to-back for the
    /// user/assistant pair of one exchange; no atomicity across the pair.
    async fn append(&self, conversation_id: i64, turn: &Turn) -> anyhow::Result<()>;

    /// Remove all turns. Subsequent `get_recent` returns empty.
    async fn clear(&self, conversation_id: i64) -> anyhow::Result<()>;

    async fn stats(&self) -> anyhow::Result<StoreStats>;
}

/// Evict oldest turns two-at-a-time until the deque fits the cap.
///
/// History always starts with a user turn, so dropping pairs keeps it that
/// way; dropping single turns would leave an assistant turn dangling at the
/// head with no matching user turn.
pub(crate) fn evict_oldest_pairs(deque: &mut VecDeque<Turn>, cap: usize) -> usize {
    let mut evicted = 0;
    while deque.len() > cap {
        if deque.pop_front().is_some() {
            evicted += 1;
        }
        if deque.pop_front().is_some() {
            evicted += 1;
        }
    }
    evicted
}

/// How many oldest rows to delete so `count` fits `cap`, rounded up to a
/// whole pair.
pub(crate) fn overflow_rows(count: u64, cap: usize) -> u64 {
    let overflow = count.saturating_sub(cap as u64);
    if overflow == 0 {
        0
    } else {
        overflow.div_ceil(2) * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(n: usize) -> VecDeque<Turn> {
        // Alternating user/assistant starting with user.
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Turn::user(format!("u{}", i / 2))
                } else {
                    Turn::assistant(format!("a{}", i / 2))
                }
            })
            .collect()
    }

    #[test]
    fn eviction_drops_whole_pairs() {
        let mut deque = history(6);
        let evicted = evict_oldest_pairs(&mut deque, 4);
        assert_eq!(evicted, 2);
        assert_eq!(deque.len(), 4);
        assert_eq!(deque[0].content.persisted_text(), "u1");
    }

    #[test]
    fn eviction_never_leaves_dangling_assistant_at_head() {
        // Odd overflow: 7 turns with cap 4 drops two pairs.
        let mut deque = history(7);
        evict_oldest_pairs(&mut deque, 4);
        assert_eq!(deque.len(), 3);
        assert_eq!(deque[0].role, crate::types::Role::User);
    }

    #[test]
    fn eviction_is_noop_under_cap() {
        let mut deque = history(4);
        assert_eq!(evict_oldest_pairs(&mut deque, 10), 0);
        assert_eq!(deque.len(), 4);
    }

    #[test]
    fn overflow_rows_round_up_to_pairs() {
        assert_eq!(overflow_rows(20, 20), 0);
        assert_eq!(overflow_rows(21, 20), 2);
        assert_eq!(overflow_rows(22, 20), 2);
        assert_eq!(overflow_rows(25, 20), 6);
    }
}
