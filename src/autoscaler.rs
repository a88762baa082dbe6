// Auto-scaler: grows or shrinks the active fleet from load samples.
//
// States: IDLE -> SCALING_UP | SCALING_DOWN -> COOLDOWN -> IDLE.
// COOLDOWN swallows a fixed number of samples so one burst of load produces
// one decision instead of a decision per tick.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    config::SystemConfig,
    events::{Event, EventSink, ScalingEvent},
    fleet::FleetRegistry,
    sampler::LoadSample,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScalerState {
    Idle,
    ScalingUp,
    ScalingDown,
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "buses", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScalingDecision {
    AddBus(usize),
    RemoveBus(usize),
    NoOp,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScalingError {
    #[error("Capacity ceiling reached: {active} active buses, maximum {max}")]
    CapacityCeilingReached { active: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingPolicy {
    pub high_threshold: f64,
    pub low_threshold: f64,
    pub min_fleet_size: usize,
    pub max_fleet_size: usize,
    pub cooldown_samples: u32,
}

impl From<&SystemConfig> for ScalingPolicy {
    fn from(config: &SystemConfig) -> Self {
        Self {
            high_threshold: config.high_threshold,
            low_threshold: config.low_threshold,
            min_fleet_size: config.min_fleet_size,
            max_fleet_size: config.max_fleet_size,
            cooldown_samples: config.cooldown_samples,
        }
    }
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self::from(&SystemConfig::default())
    }
}

enum State {
    Idle,
    ScalingUp,
    ScalingDown,
    Cooldown { remaining: u32 },
}

pub struct AutoScaler {
    policy: ScalingPolicy,
    state: State,
}

impl AutoScaler {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            state: State::Idle,
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn state(&self) -> ScalerState {
        match self.state {
            State::Idle => ScalerState::Idle,
            State::ScalingUp => ScalerState::ScalingUp,
            State::ScalingDown => ScalerState::ScalingDown,
            State::Cooldown { .. } => ScalerState::Cooldown,
        }
    }

    pub fn cooldown_remaining(&self) -> u32 {
        match self.state {
            State::Cooldown { remaining } => remaining,
            _ => 0,
        }
    }

    // ceil((occupancy - high) * active), at least one bus
    fn overflow_buses(&self, sample: &LoadSample) -> usize {
        let overflow = (sample.occupancy_ratio - self.policy.high_threshold) * sample.active_buses as f64;
        // Absorb float noise such as (0.9 - 0.85) * 20 = 1.0000000000000009
        let buses = (overflow - 1e-9).ceil();
        if buses < 1.0 {
            1
        } else {
            buses as usize
        }
    }

    // Decides what this sample calls for and moves the state machine.
    // Leaves the scaler in SCALING_UP / SCALING_DOWN until `finish` is called.
    pub fn evaluate(&mut self, sample: &LoadSample) -> Result<ScalingDecision, ScalingError> {
        self.evaluate_against(sample, sample.active_buses)
    }

    // Like `evaluate`, but bounds the decision by `active`, the fleet as it stands
    // now. A sample may predate the last scaling action.
    pub fn evaluate_against(
        &mut self,
        sample: &LoadSample,
        active: usize,
    ) -> Result<ScalingDecision, ScalingError> {
        match &mut self.state {
            State::Cooldown { remaining } => {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    self.state = State::Idle;
                    debug!("cooldown over");
                }
                return Ok(ScalingDecision::NoOp);
            }
            State::ScalingUp | State::ScalingDown => return Ok(ScalingDecision::NoOp),
            State::Idle => {}
        }

        let occupancy = sample.occupancy_ratio;

        if occupancy >= self.policy.high_threshold {
            let headroom = self.policy.max_fleet_size.saturating_sub(active);
            if headroom == 0 {
                return Err(ScalingError::CapacityCeilingReached {
                    active,
                    max: self.policy.max_fleet_size,
                });
            }

            self.state = State::ScalingUp;
            return Ok(ScalingDecision::AddBus(self.overflow_buses(sample).min(headroom)));
        }

        if occupancy <= self.policy.low_threshold && active > self.policy.min_fleet_size {
            self.state = State::ScalingDown;
            return Ok(ScalingDecision::RemoveBus(1));
        }

        Ok(ScalingDecision::NoOp)
    }

    // Enters COOLDOWN after a scaling action has been carried out
    pub fn finish(&mut self) {
        self.state = if self.policy.cooldown_samples == 0 {
            State::Idle
        } else {
            State::Cooldown {
                remaining: self.policy.cooldown_samples,
            }
        };
    }

    // Evaluates one sample and applies the decision to the fleet
    pub fn step(&mut self, sample: &LoadSample, registry: &FleetRegistry, sink: &dyn EventSink) -> ScalingDecision {
        let from = self.state();
        let active_now = registry.active_buses();

        let decision = match self.evaluate_against(sample, active_now) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    error = %e,
                    occupancy = sample.occupancy_ratio,
                    "scale-up suppressed"
                );
                return ScalingDecision::NoOp;
            }
        };

        let affected_buses = match decision {
            ScalingDecision::NoOp => return decision,
            ScalingDecision::AddBus(count) => registry.add_buses(count),
            ScalingDecision::RemoveBus(count) => (0..count)
                .filter_map(|_| registry.drain_newest())
                .map(|outcome| outcome.bus_id)
                .collect(),
        };
        let to = self.state();

        info!(
            ?decision,
            occupancy = sample.occupancy_ratio,
            active_buses = active_now,
            ?affected_buses,
            "fleet rescaled"
        );
        sink.emit(Event::Scaling(ScalingEvent {
            timestamp: Utc::now(),
            decision,
            from,
            to,
            occupancy: sample.occupancy_ratio,
            active_buses: active_now,
            affected_buses,
        }));

        self.finish();
        decision
    }
}

// Consumes samples as they are published, newest first, until shutdown
pub async fn run_control_loop(
    scaler: Arc<Mutex<AutoScaler>>,
    registry: Arc<FleetRegistry>,
    sink: Arc<dyn EventSink>,
    mut samples: watch::Receiver<Option<LoadSample>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("auto-scaler started");

    loop {
        tokio::select! {
            changed = samples.changed() => {
                if changed.is_err() {
                    info!("sample feed closed, auto-scaler stopping");
                    break;
                }
                let sample = *samples.borrow_and_update();
                if let Some(sample) = sample {
                    scaler.lock().step(&sample, &registry, sink.as_ref());
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("auto-scaler shutting down");
                    break;
                }
            }
        }
    }
}
