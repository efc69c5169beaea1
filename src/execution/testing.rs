//! Scripted capabilities for engine tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use super::capability::{Capability, CapabilityOutcome, CapabilityRequest};

/// What a scripted capability observed on one call.
#[derive(Debug, Clone)]
pub struct Observed {
    pub attempt: u32,
    pub context_keys: Vec<String>,
    pub overrides: Option<Value>,
    pub started: Instant,
    pub finished: Instant,
}

/// Capability replaying a fixed sequence of outcomes.
///
/// Once the script runs out the last outcome repeats.
pub struct Scripted {
    outcomes: Vec<CapabilityOutcome>,
    delay: Duration,
    calls: AtomicU32,
    observed: Mutex<Vec<Observed>>,
}

impl Scripted {
    pub fn new(outcomes: Vec<CapabilityOutcome>) -> Arc<Self> {
        Self::with_delay(outcomes, Duration::ZERO)
    }

    pub fn with_delay(outcomes: Vec<CapabilityOutcome>, delay: Duration) -> Arc<Self> {
        assert!(!outcomes.is_empty(), "script needs at least one outcome");
        Arc::new(Self {
            outcomes,
            delay,
            calls: AtomicU32::new(0),
            observed: Mutex::new(Vec::new()),
        })
    }

    pub fn always_ok(output: Value) -> Arc<Self> {
        Self::new(vec![CapabilityOutcome::success(output)])
    }

    pub fn always_fail(error: &str) -> Arc<Self> {
        Self::new(vec![CapabilityOutcome::failure(error)])
    }

    pub fn delayed(delay: Duration, output: Value) -> Arc<Self> {
        Self::with_delay(vec![CapabilityOutcome::success(output)], delay)
    }

    /// Fails `failures` times, then succeeds with `output`.
    pub fn fail_then_ok(failures: usize, output: Value) -> Arc<Self> {
        let mut outcomes: Vec<CapabilityOutcome> = (0..failures)
            .map(|i| CapabilityOutcome::failure(format!("transient failure #{}", i + 1)))
            .collect();
        outcomes.push(CapabilityOutcome::success(output));
        Self::new(outcomes)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn observed(&self) -> Vec<Observed> {
        self.observed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Capability for Scripted {
    async fn invoke(&self, request: CapabilityRequest<'_>) -> CapabilityOutcome {
        let started = Instant::now();
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let context_keys = request.context.keys().map(str::to_string).collect();
        let overrides = request.overrides.cloned();

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.observed.lock().unwrap().push(Observed {
            attempt: request.attempt,
            context_keys,
            overrides,
            started,
            finished: Instant::now(),
        });

        let index = call.min(self.outcomes.len() - 1);
        self.outcomes[index].clone()
    }
}
