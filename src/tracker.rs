//! Per-endpoint credential-attempt tracking and the admission decision.
//!
//! The honeypot has to look plausibly real: admitting the very first
//! password is suspicious, refusing forever is useless. Every submission is
//! recorded; the third attempt from an endpoint is always admitted, earlier
//! ones win a fair 1-in-3 draw. An endpoint's state lives from its first
//! attempt until its session record is persisted (or process exit).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Attempts after which admission is unconditional.
const ALWAYS_ADMIT_AT: u32 = 3;

/// Odds of the early-admission draw (1 in N).
const ADMIT_ODDS: u32 = 3;

/// Outcome of one password submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Reject,
}

/// Source of randomness for the admission draw. A seam so tests can force
/// either outcome deterministically.
pub trait Chance: Send {
    /// A fair 1-in-`n` draw.
    fn one_in(&mut self, n: u32) -> bool;
}

/// Production draw backed by an OS-seeded RNG.
pub struct RandomChance(StdRng);

impl RandomChance {
    pub fn new() -> Self {
        Self(StdRng::from_os_rng())
    }
}

impl Default for RandomChance {
    fn default() -> Self {
        Self::new()
    }
}

impl Chance for RandomChance {
    fn one_in(&mut self, n: u32) -> bool {
        self.0.random_range(0..n) == 0
    }
}

/// Live state for one source endpoint.
#[derive(Debug, Clone, Default)]
pub struct EndpointState {
    pub attempts: u32,
    pub tried: Vec<(String, String)>,
}

struct TrackerInner {
    endpoints: HashMap<SocketAddr, EndpointState>,
    chance: Box<dyn Chance>,
}

/// Process-wide attempt tracker. All access goes through one mutex; the
/// decision is atomic with the bookkeeping and the lock is never held
/// across an await point.
pub struct CredentialTracker {
    inner: Mutex<TrackerInner>,
}

impl CredentialTracker {
    pub fn new() -> Self {
        Self::with_chance(Box::new(RandomChance::new()))
    }

    pub fn with_chance(chance: Box<dyn Chance>) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                endpoints: HashMap::new(),
                chance,
            }),
        }
    }

    /// Records one password submission from `endpoint` and decides whether
    /// to admit it.
    pub fn submit(&self, endpoint: SocketAddr, username: &str, password: &str) -> Decision {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.endpoints.entry(endpoint).or_default();
        state
            .tried
            .push((username.to_string(), password.to_string()));
        state.attempts += 1;

        if state.attempts >= ALWAYS_ADMIT_AT {
            return Decision::Admit;
        }
        if inner.chance.one_in(ADMIT_ODDS) {
            Decision::Admit
        } else {
            Decision::Reject
        }
    }

    /// Removes and returns the endpoint's state. Called at the moment the
    /// session record is persisted, so the next connection from the same
    /// endpoint starts fresh.
    pub fn take(&self, endpoint: &SocketAddr) -> Option<EndpointState> {
        self.inner.lock().unwrap().endpoints.remove(endpoint)
    }
}

impl Default for CredentialTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub struct Never;
    impl Chance for Never {
        fn one_in(&mut self, _n: u32) -> bool {
            false
        }
    }

    pub struct Always;
    impl Chance for Always {
        fn one_in(&mut self, _n: u32) -> bool {
            true
        }
    }

    fn endpoint() -> SocketAddr {
        "203.0.113.7:40001".parse().unwrap()
    }

    #[test]
    fn third_attempt_always_admits() {
        let tracker = CredentialTracker::with_chance(Box::new(Never));
        let ep = endpoint();

        assert_eq!(tracker.submit(ep, "root", "a"), Decision::Reject);
        assert_eq!(tracker.submit(ep, "root", "b"), Decision::Reject);
        assert_eq!(tracker.submit(ep, "root", "c"), Decision::Admit);

        let state = tracker.take(&ep).unwrap();
        assert_eq!(state.attempts, 3);
        assert_eq!(
            state.tried,
            vec![
                ("root".to_string(), "a".to_string()),
                ("root".to_string(), "b".to_string()),
                ("root".to_string(), "c".to_string()),
            ]
        );
    }

    #[test]
    fn lucky_first_attempt_admits() {
        let tracker = CredentialTracker::with_chance(Box::new(Always));
        let ep = endpoint();
        assert_eq!(tracker.submit(ep, "admin", "hunter2"), Decision::Admit);
        let state = tracker.take(&ep).unwrap();
        assert_eq!(state.attempts, 1);
        assert_eq!(state.tried.len(), 1);
    }

    #[test]
    fn take_clears_state_so_endpoint_starts_fresh() {
        let tracker = CredentialTracker::with_chance(Box::new(Never));
        let ep = endpoint();
        for pw in ["a", "b", "c"] {
            tracker.submit(ep, "root", pw);
        }
        assert!(tracker.take(&ep).is_some());
        assert!(tracker.take(&ep).is_none());

        // Back to the probation phase, not an instant admit
        assert_eq!(tracker.submit(ep, "root", "d"), Decision::Reject);
    }

    #[test]
    fn endpoints_are_tracked_independently() {
        let tracker = CredentialTracker::with_chance(Box::new(Never));
        let a: SocketAddr = "203.0.113.7:40001".parse().unwrap();
        let b: SocketAddr = "203.0.113.7:40002".parse().unwrap();

        tracker.submit(a, "root", "a");
        tracker.submit(a, "root", "b");
        // A different source port is a different endpoint
        assert_eq!(tracker.submit(b, "root", "x"), Decision::Reject);
        assert_eq!(tracker.submit(a, "root", "c"), Decision::Admit);
        assert_eq!(tracker.take(&b).unwrap().attempts, 1);
    }

    #[test]
    fn random_chance_is_roughly_fair() {
        let mut chance = RandomChance::new();
        let hits = (0..3000).filter(|_| chance.one_in(3)).count();
        // Loose bound: a fair 1-in-3 draw lands well inside this window
        assert!((700..1300).contains(&hits), "hits = {}", hits);
    }
}
