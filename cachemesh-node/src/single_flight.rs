// Per-(cache, key) load table
// At most one loader runs per key on this node; waiters observe the
// leader's outcome, success or failure, without re-running the loader

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;

type LoadKey = (String, String);

/// Final state of one load, shared with every waiter
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Resolved(Bytes),
    Failed(String),
}

struct InFlightSlot {
    rx: watch::Receiver<Option<LoadOutcome>>,
}

/// Result of claiming a key: either this caller runs the loader, or it
/// waits on the one already in flight
pub enum Claim {
    Leader(LoadGuard),
    Follower(watch::Receiver<Option<LoadOutcome>>),
}

pub struct LoadTable {
    slots: Arc<DashMap<LoadKey, InFlightSlot>>,
}

impl Default for LoadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadTable {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    pub fn claim(&self, cache_name: &str, key: &str) -> Claim {
        let load_key = (cache_name.to_string(), key.to_string());
        match self.slots.entry(load_key.clone()) {
            Entry::Occupied(occupied) => Claim::Follower(occupied.get().rx.clone()),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(InFlightSlot { rx });
                Claim::Leader(LoadGuard {
                    slots: Arc::clone(&self.slots),
                    key: load_key,
                    tx,
                })
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }
}

/// Held by the loading caller; resolving publishes the outcome and frees
/// the slot. Dropping without resolving frees the slot so waiters retry.
pub struct LoadGuard {
    slots: Arc<DashMap<LoadKey, InFlightSlot>>,
    key: LoadKey,
    tx: watch::Sender<Option<LoadOutcome>>,
}

impl LoadGuard {
    pub fn resolve(self, outcome: LoadOutcome) {
        let _ = self.tx.send(Some(outcome));
        // Drop removes the slot
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.slots.remove(&self.key);
    }
}

/// Wait for the leader's outcome; None means the leader vanished without
/// resolving and the caller should claim again
pub async fn wait(mut rx: watch::Receiver<Option<LoadOutcome>>) -> Option<LoadOutcome> {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return Some(outcome);
        }
        if rx.changed().await.is_err() {
            // Sender gone; pick up any final value it left behind
            return rx.borrow().clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_claim_is_follower() {
        let table = LoadTable::new();
        let first = table.claim("c", "k");
        assert!(matches!(first, Claim::Leader(_)));
        assert!(matches!(table.claim("c", "k"), Claim::Follower(_)));
        // Distinct keys are independent
        assert!(matches!(table.claim("c", "other"), Claim::Leader(_)));
    }

    #[tokio::test]
    async fn test_followers_observe_resolution() {
        let table = LoadTable::new();
        let leader = match table.claim("c", "k") {
            Claim::Leader(guard) => guard,
            Claim::Follower(_) => panic!("expected leader"),
        };
        let follower = match table.claim("c", "k") {
            Claim::Follower(rx) => rx,
            Claim::Leader(_) => panic!("expected follower"),
        };

        let waiter = tokio::spawn(wait(follower));
        leader.resolve(LoadOutcome::Resolved(Bytes::from_static(b"v")));

        match waiter.await.unwrap() {
            Some(LoadOutcome::Resolved(v)) => assert_eq!(v, Bytes::from_static(b"v")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(table.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_followers_observe_failure() {
        let table = LoadTable::new();
        let leader = match table.claim("c", "k") {
            Claim::Leader(guard) => guard,
            Claim::Follower(_) => panic!("expected leader"),
        };
        let follower = match table.claim("c", "k") {
            Claim::Follower(rx) => rx,
            Claim::Leader(_) => panic!("expected follower"),
        };

        leader.resolve(LoadOutcome::Failed("boom".to_string()));
        match wait(follower).await {
            Some(LoadOutcome::Failed(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_leader_frees_slot() {
        let table = LoadTable::new();
        let leader = match table.claim("c", "k") {
            Claim::Leader(guard) => guard,
            Claim::Follower(_) => panic!("expected leader"),
        };
        let follower = match table.claim("c", "k") {
            Claim::Follower(rx) => rx,
            Claim::Leader(_) => panic!("expected follower"),
        };

        drop(leader);
        assert!(wait(follower).await.is_none());
        assert_eq!(table.in_flight(), 0);
        // The key can be claimed again
        assert!(matches!(table.claim("c", "k"), Claim::Leader(_)));
    }
}
