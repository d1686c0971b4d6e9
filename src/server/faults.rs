//! Simulated unreliability: random processing delays and silent drops of
//! work or responses.

use std::collections::VecDeque;
use std::sync::Mutex;

use rand::Rng;

use tokio::time::Duration;

/// Source of the simulated faults and delays the service injects. Pluggable
/// so tests can script exact fault sequences.
pub trait FaultInjector: Send + Sync {
    /// One Bernoulli draw: whether to silently drop the outcome at the
    /// calling site.
    fn should_drop(&self, probability: f64) -> bool;

    /// Samples the simulated processing delay for one request.
    fn process_delay(&self, max: Duration) -> Duration;
}

/// The default injector, backed by the thread-local RNG.
#[derive(Debug, Default)]
pub struct RandomFaults;

impl FaultInjector for RandomFaults {
    fn should_drop(&self, probability: f64) -> bool {
        rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
    }

    fn process_delay(&self, max: Duration) -> Duration {
        let max_ms = max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }
}

/// Deterministic injector replaying a fixed drop sequence. Once the script
/// runs out, every further draw reports `tail`. Processing delays are always
/// zero.
#[derive(Debug)]
pub struct ScriptedFaults {
    /// Scripted outcomes of the upcoming drop draws, front first.
    script: Mutex<VecDeque<bool>>,

    /// Outcome reported after the script is exhausted.
    tail: bool,
}

impl ScriptedFaults {
    /// Creates an injector replaying the given drop draws, then `tail`.
    pub fn new(script: impl IntoIterator<Item = bool>, tail: bool) -> Self {
        ScriptedFaults {
            script: Mutex::new(script.into_iter().collect()),
            tail,
        }
    }

    /// Creates an injector that never drops anything.
    pub fn none() -> Self {
        Self::new([], false)
    }
}

impl FaultInjector for ScriptedFaults {
    fn should_drop(&self, _probability: f64) -> bool {
        let mut script = self.script.lock().expect("poisoned fault script");
        script.pop_front().unwrap_or(self.tail)
    }

    fn process_delay(&self, _max: Duration) -> Duration {
        Duration::ZERO
    }
}
