// Load sampler: periodically measures booking-system load.
//
// Each tick reads occupancy over ACTIVE buses and the dispatcher's queue depth,
// releases expired seat holds, and publishes one `LoadSample`. Publishing goes
// through a watch channel so the newest sample replaces any unread one and the
// sampler never waits on the auto-scaler. The last few samples are also kept
// in a bounded window for the load report.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::reservation::ReservationEngine;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadSample {
    pub timestamp: DateTime<Utc>,
    // In [0, 1]; 0 when no bus is ACTIVE
    pub occupancy_ratio: f64,
    pub pending_requests: usize,
    pub active_buses: usize,
}

impl LoadSample {
    pub fn new(occupancy_ratio: f64, pending_requests: usize, active_buses: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            occupancy_ratio: if active_buses == 0 {
                0.0
            } else {
                occupancy_ratio.clamp(0.0, 1.0)
            },
            pending_requests,
            active_buses,
        }
    }
}

// Aggregate over the samples currently in the window
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct LoadReport {
    pub samples: usize,
    pub min_occupancy: f64,
    pub avg_occupancy: f64,
    pub max_occupancy: f64,
    pub max_pending_requests: usize,
}

impl LoadReport {
    fn from_samples<'a>(samples: impl ExactSizeIterator<Item = &'a LoadSample>) -> Self {
        let count = samples.len();
        if count == 0 {
            return Self::default();
        }

        let mut report = Self {
            samples: count,
            min_occupancy: f64::MAX,
            ..Self::default()
        };
        let mut total = 0.0;
        for sample in samples {
            total += sample.occupancy_ratio;
            report.min_occupancy = report.min_occupancy.min(sample.occupancy_ratio);
            report.max_occupancy = report.max_occupancy.max(sample.occupancy_ratio);
            report.max_pending_requests = report.max_pending_requests.max(sample.pending_requests);
        }
        report.avg_occupancy = total / count as f64;
        report
    }
}

// Anything that can report how many requests are waiting for a worker
pub trait QueueProbe: Send + Sync + 'static {
    fn queue_depth(&self) -> usize;
}

pub struct LoadSampler {
    engine: Arc<ReservationEngine>,
    probe: Arc<dyn QueueProbe>,
    latest: watch::Sender<Option<LoadSample>>,
    history: Mutex<VecDeque<LoadSample>>,
    window: usize,
}

impl LoadSampler {
    pub const DEFAULT_WINDOW: usize = 60;

    pub fn new(engine: Arc<ReservationEngine>, probe: Arc<dyn QueueProbe>) -> Self {
        Self::with_window(engine, probe, Self::DEFAULT_WINDOW)
    }

    pub fn with_window(engine: Arc<ReservationEngine>, probe: Arc<dyn QueueProbe>, window: usize) -> Self {
        let (latest, _) = watch::channel(None);
        let window = window.max(1);
        Self {
            engine,
            probe,
            latest,
            history: Mutex::new(VecDeque::with_capacity(window)),
            window,
        }
    }

    // Receivers only ever observe the most recent sample
    pub fn subscribe(&self) -> watch::Receiver<Option<LoadSample>> {
        self.latest.subscribe()
    }

    pub fn latest(&self) -> Option<LoadSample> {
        *self.latest.borrow()
    }

    // Measures without publishing
    pub fn measure(&self) -> LoadSample {
        let registry = self.engine.registry();
        LoadSample::new(
            registry.occupancy(),
            self.probe.queue_depth(),
            registry.active_buses(),
        )
    }

    // One sampler tick: housekeeping, measurement, publication
    pub fn tick(&self) -> LoadSample {
        let expired = self.engine.release_expired_holds(Utc::now());
        let sample = self.measure();

        debug!(
            occupancy = sample.occupancy_ratio,
            pending = sample.pending_requests,
            active_buses = sample.active_buses,
            expired_holds = expired,
            "load sampled"
        );

        self.record(sample);
        self.latest.send_replace(Some(sample));
        sample
    }

    fn record(&self, sample: LoadSample) {
        let mut history = self.history.lock();
        if history.len() == self.window {
            history.pop_front();
        }
        history.push_back(sample);
    }

    // Oldest first
    pub fn history(&self) -> Vec<LoadSample> {
        self.history.lock().iter().copied().collect()
    }

    pub fn report(&self) -> LoadReport {
        LoadReport::from_samples(self.history.lock().iter())
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(period_ms = period.as_millis() as u64, "load sampler started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("load sampler shutting down");
                        break;
                    }
                }
            }
        }
    }
}
