// Concurrent seat booking for a bus route, with a fleet that scales to load

pub mod autoscaler;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod fleet;
pub mod reservation;
pub mod sampler;
pub mod system;

// Re-export key types for convenience
pub use autoscaler::{AutoScaler, ScalerState, ScalingDecision, ScalingError, ScalingPolicy};
pub use config::{ConfigError, SystemConfig};
pub use dispatcher::{Dispatcher, DispatcherStats, Request, RequestHandler, Response};
pub use events::{Event, EventSink, JsonLinesSink, MemorySink, NullSink, TracingSink};
pub use fleet::{BusId, BusState, BusStatus, FleetRegistry, HoldId, ReservationId, SeatId};
pub use reservation::{Ack, BookingError, BookingRequest, EngineStats, ReservationEngine, SeatHandle};
pub use sampler::{LoadReport, LoadSample, LoadSampler, QueueProbe};
pub use system::{BookingSystem, MetricsSnapshot};
