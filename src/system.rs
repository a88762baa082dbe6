// Wires registry, engine, dispatcher, sampler and auto-scaler into one handle.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    autoscaler::{run_control_loop, AutoScaler, ScalerState, ScalingDecision, ScalingPolicy},
    config::{ConfigError, SystemConfig},
    dispatcher::{Dispatcher, DispatcherStats},
    events::EventSink,
    fleet::{BusStatus, FleetRegistry, ReservationId},
    reservation::{Ack, BookingError, BookingRequest, EngineStats, ReservationEngine, SeatHandle},
    sampler::{LoadReport, LoadSample, LoadSampler},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub sample: LoadSample,
    // Rolling aggregate over the sampler's window
    pub report: LoadReport,
    pub scaler_state: ScalerState,
    pub cooldown_remaining: u32,
    pub fleet: Vec<BusStatus>,
    pub stats: EngineStats,
    pub dispatcher: DispatcherStats,
}

pub struct BookingSystem {
    config: SystemConfig,
    registry: Arc<FleetRegistry>,
    engine: Arc<ReservationEngine>,
    dispatcher: Arc<Dispatcher<ReservationEngine>>,
    sampler: Arc<LoadSampler>,
    scaler: Arc<Mutex<AutoScaler>>,
    sink: Arc<dyn EventSink>,
    running: AtomicBool,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BookingSystem {
    // Must be called inside a tokio runtime: the dispatcher spawns its workers here
    pub fn new(config: SystemConfig, sink: Arc<dyn EventSink>) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(FleetRegistry::with_fleet(
            config.seats_per_bus,
            config.initial_fleet_size,
        ));
        let engine = Arc::new(ReservationEngine::from_config(
            &config,
            registry.clone(),
            sink.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::from_config(&config, engine.clone(), sink.clone()));
        let sampler = Arc::new(LoadSampler::with_window(
            engine.clone(),
            dispatcher.clone(),
            config.sample_history,
        ));
        let scaler = Arc::new(Mutex::new(AutoScaler::new(ScalingPolicy::from(&config))));
        let (shutdown, _) = watch::channel(false);

        info!(
            route = %config.route_id,
            buses = config.initial_fleet_size,
            seats_per_bus = config.seats_per_bus,
            "booking system ready"
        );

        Ok(Self {
            config,
            registry,
            engine,
            dispatcher,
            sampler,
            scaler,
            sink,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<FleetRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<ReservationEngine> {
        &self.engine
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<ReservationEngine>> {
        &self.dispatcher
    }

    // Spawns the periodic sampler and the auto-scaler control loop.
    // A system that has been shut down stays down.
    pub fn start(&self) -> Result<(), BookingError> {
        if self.stopped.load(Ordering::SeqCst) {
            warn!("booking system already shut down, not starting");
            return Err(BookingError::ShuttingDown);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("booking system already started");
            return Ok(());
        }

        let sampler = tokio::spawn(
            self.sampler
                .clone()
                .run(self.config.sampler_period(), self.shutdown.subscribe()),
        );
        let control = tokio::spawn(run_control_loop(
            self.scaler.clone(),
            self.registry.clone(),
            self.sink.clone(),
            self.sampler.subscribe(),
            self.shutdown.subscribe(),
        ));

        self.tasks.lock().extend([sampler, control]);
        info!("control loop started");
        Ok(())
    }

    pub async fn submit_booking(&self, request: BookingRequest) -> Result<SeatHandle, BookingError> {
        self.dispatcher.submit_booking(request).await
    }

    pub async fn submit_cancel(&self, reservation_id: ReservationId) -> Result<Ack, BookingError> {
        self.dispatcher.submit_cancel(reservation_id).await
    }

    pub async fn submit_cancel_for(
        &self,
        reservation_id: ReservationId,
        passenger: impl Into<String>,
    ) -> Result<Ack, BookingError> {
        self.dispatcher.submit_cancel_for(reservation_id, passenger).await
    }

    // One sample and scaling step on the caller's thread.
    // While the background loop runs it owns scaling, so this only publishes a sample.
    pub fn tick(&self) -> ScalingDecision {
        let sample = self.sampler.tick();
        if self.running.load(Ordering::SeqCst) {
            return ScalingDecision::NoOp;
        }
        self.scaler
            .lock()
            .step(&sample, &self.registry, self.sink.as_ref())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let sample = self
            .sampler
            .latest()
            .unwrap_or_else(|| self.sampler.measure());
        let (scaler_state, cooldown_remaining) = {
            let scaler = self.scaler.lock();
            (scaler.state(), scaler.cooldown_remaining())
        };

        MetricsSnapshot {
            sample,
            report: self.sampler.report(),
            scaler_state,
            cooldown_remaining,
            fleet: self.registry.fleet_status(),
            stats: self.engine.stats(),
            dispatcher: self.dispatcher.stats(),
        }
    }

    pub fn verify_invariants(&self) -> Result<(), BookingError> {
        self.engine.verify_invariants()
    }

    // Stops the background tasks, then drains the dispatcher
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        self.running.store(false, Ordering::SeqCst);

        self.dispatcher.shutdown().await;
        info!("booking system stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, MemorySink};
    use crate::fleet::BusState;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn config(buses: usize, seats: u16) -> SystemConfig {
        SystemConfig {
            route_id: "Nakuru-Nairobi".to_string(),
            seats_per_bus: seats,
            initial_fleet_size: buses,
            max_fleet_size: 4,
            worker_pool_size: 4,
            queue_capacity: 64,
            ..SystemConfig::default()
        }
    }

    fn request(n: usize) -> BookingRequest {
        BookingRequest::new("Nakuru-Nairobi", format!("passenger-{n}"))
    }

    async fn book_concurrently(system: &Arc<BookingSystem>, range: std::ops::Range<usize>) -> Vec<Result<SeatHandle, BookingError>> {
        let handles: Vec<_> = range
            .map(|n| {
                let system = system.clone();
                tokio::spawn(async move { system.submit_booking(request(n)).await })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let bad = SystemConfig {
            high_threshold: 0.2,
            ..SystemConfig::default()
        };
        assert!(matches!(
            BookingSystem::new(bad, Arc::new(MemorySink::default())),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fifteen_bookings_stay_below_threshold() {
        let sink = Arc::new(MemorySink::default());
        let system = Arc::new(assert_ok!(BookingSystem::new(config(2, 10), sink.clone())));

        let results = book_concurrently(&system, 0..15).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 15);

        assert_eq!(system.tick(), ScalingDecision::NoOp);
        let metrics = system.metrics();
        assert_eq!(metrics.sample.occupancy_ratio, 0.75);
        assert_eq!(metrics.sample.active_buses, 2);
        assert_eq!(metrics.scaler_state, ScalerState::Idle);
        assert_eq!(metrics.stats.successful_bookings, 15);
        assert!(sink.scaling_events().is_empty());
        assert_ok!(system.verify_invariants());

        system.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_fleet_recovers_after_scale_up() {
        let sink = Arc::new(MemorySink::default());
        let system = Arc::new(assert_ok!(BookingSystem::new(config(2, 10), sink.clone())));

        let results = book_concurrently(&system, 0..20).await;
        assert!(results.iter().all(|r| r.is_ok()));

        assert_eq!(
            system.submit_booking(request(20)).await,
            Err(BookingError::NoCapacity)
        );

        assert_eq!(system.tick(), ScalingDecision::AddBus(1));
        assert_eq!(system.metrics().scaler_state, ScalerState::Cooldown);

        let handle = assert_ok!(system.submit_booking(request(20)).await);
        assert_eq!((handle.bus_id, handle.seat_id), (3, 1));

        let scaling = sink.scaling_events();
        assert_eq!(scaling.len(), 1);
        assert_eq!(scaling[0].occupancy, 1.0);
        assert_eq!(scaling[0].affected_buses, vec![3]);

        // Still cooling down: no second decision while load stays high
        for i in 0..3 {
            assert_eq!(system.tick(), ScalingDecision::NoOp, "tick {i}");
        }
        assert_eq!(sink.scaling_events().len(), 1);

        system.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scale_down_waits_for_last_cancellation() {
        let sink = Arc::new(MemorySink::default());
        let system = Arc::new(assert_ok!(BookingSystem::new(
            SystemConfig {
                cooldown_samples: 0,
                ..config(3, 4)
            },
            sink.clone(),
        )));

        // Put one passenger on the newest bus
        let rider = assert_ok!(system.submit_booking(request(0).preferring(3, None)).await);
        assert_eq!(rider.bus_id, 3);

        assert_eq!(system.tick(), ScalingDecision::RemoveBus(1));
        assert_eq!(
            system.registry().bus_status(3).map(|s| s.state),
            Some(BusState::Draining)
        );
        assert_eq!(system.registry().active_buses(), 2);

        // Draining bus is skipped for new bookings
        let other = assert_ok!(system.submit_booking(request(1)).await);
        assert_eq!(other.bus_id, 1);

        let ack = assert_ok!(system.submit_cancel(rider.reservation_id).await);
        assert!(ack.bus_retired);
        assert!(system.registry().bus_status(3).is_none());
        assert_err!(system.submit_cancel(rider.reservation_id).await);

        assert_ok!(system.verify_invariants());
        system.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_after_shutdown_is_refused() {
        let system = assert_ok!(BookingSystem::new(config(2, 10), Arc::new(MemorySink::default())));
        system.shutdown().await;

        assert_eq!(system.start(), Err(BookingError::ShuttingDown));
        assert!(system.tasks.lock().is_empty());
        assert!(!system.running.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_metrics_report_rolls_over_ticks() {
        let system = Arc::new(assert_ok!(BookingSystem::new(
            SystemConfig {
                sample_history: 2,
                min_fleet_size: 2,
                ..config(2, 10)
            },
            Arc::new(MemorySink::default()),
        )));

        system.tick();
        let results = book_concurrently(&system, 0..10).await;
        assert!(results.iter().all(|r| r.is_ok()));
        system.tick();
        let results = book_concurrently(&system, 10..15).await;
        assert!(results.iter().all(|r| r.is_ok()));
        system.tick();

        // The empty-fleet sample has rolled out of a window of two
        let report = system.metrics().report;
        assert_eq!(report.samples, 2);
        assert_eq!(report.min_occupancy, 0.5);
        assert_eq!(report.max_occupancy, 0.75);
        assert_eq!(report.avg_occupancy, 0.625);

        system.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_checks_passenger() {
        let system = assert_ok!(BookingSystem::new(config(2, 10), Arc::new(MemorySink::default())));
        let handle = assert_ok!(system.submit_booking(request(1)).await);

        assert!(matches!(
            system.submit_cancel_for(handle.reservation_id, request(2).passenger).await,
            Err(BookingError::NotFound(_))
        ));
        assert_eq!(system.registry().booked_seats(), 1);

        let ack = assert_ok!(system.submit_cancel_for(handle.reservation_id, request(1).passenger).await);
        assert!(!ack.bus_retired);
        assert_eq!(system.registry().booked_seats(), 0);

        system.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_background_loop_scales_and_stops() {
        let sink = Arc::new(MemorySink::default());
        let system = Arc::new(assert_ok!(BookingSystem::new(
            SystemConfig {
                sampler_period_ms: 10,
                ..config(1, 4)
            },
            sink.clone(),
        )));

        let results = book_concurrently(&system, 0..4).await;
        assert!(results.iter().all(|r| r.is_ok()));

        assert_ok!(system.start());
        for _ in 0..200 {
            if system.registry().active_buses() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(system.registry().active_buses(), 2);

        system.shutdown().await;
        assert_eq!(
            system.submit_booking(request(9)).await,
            Err(BookingError::ShuttingDown)
        );
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, Event::Scaling(s) if s.decision == ScalingDecision::AddBus(1))));
    }
}
