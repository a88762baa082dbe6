// Structured events handed to the external logging collaborator.
//
// The core makes no assumption about durability or format: it calls
// `EventSink::emit` once per event and moves on.

use std::{collections::VecDeque, io::Write};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    autoscaler::{ScalerState, ScalingDecision},
    fleet::{BusId, ReservationId, SeatId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Book,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingEvent {
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub reservation_id: ReservationId,
    pub passenger: String,
    pub bus_id: BusId,
    pub seat_id: SeatId,
    pub resulting_occupancy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancellationEvent {
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub reservation_id: ReservationId,
    pub bus_id: BusId,
    pub seat_id: SeatId,
    pub resulting_occupancy: f64,
    // The cancellation emptied a DRAINING bus and retired it
    pub bus_retired: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingEvent {
    pub timestamp: DateTime<Utc>,
    pub decision: ScalingDecision,
    pub from: ScalerState,
    pub to: ScalerState,
    pub occupancy: f64,
    pub active_buses: usize,
    // Buses deployed or drained by this decision
    pub affected_buses: Vec<BusId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverloadEvent {
    pub timestamp: DateTime<Utc>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Booking(BookingEvent),
    Cancellation(CancellationEvent),
    Scaling(ScalingEvent),
    Overload(OverloadEvent),
}

impl Event {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::Booking(e) => e.timestamp,
            Event::Cancellation(e) => e.timestamp,
            Event::Scaling(e) => e.timestamp,
            Event::Overload(e) => e.timestamp,
        }
    }
}

pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: Event);
}

// Drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

// Re-emits every event as a tracing record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match event {
            Event::Booking(e) => info!(
                reservation = %e.reservation_id,
                passenger = %e.passenger,
                bus_id = e.bus_id,
                seat_id = e.seat_id,
                occupancy = e.resulting_occupancy,
                "seat booked"
            ),
            Event::Cancellation(e) => info!(
                reservation = %e.reservation_id,
                bus_id = e.bus_id,
                seat_id = e.seat_id,
                occupancy = e.resulting_occupancy,
                bus_retired = e.bus_retired,
                "reservation cancelled"
            ),
            Event::Scaling(e) => info!(
                decision = ?e.decision,
                from = ?e.from,
                to = ?e.to,
                occupancy = e.occupancy,
                active_buses = e.active_buses,
                affected = ?e.affected_buses,
                "scaling decision"
            ),
            Event::Overload(e) => warn!(
                queue_depth = e.queue_depth,
                queue_capacity = e.queue_capacity,
                "dispatcher overloaded"
            ),
        }
    }
}

// Keeps the most recent `limit` events in memory
#[derive(Debug)]
pub struct MemorySink {
    limit: usize,
    events: Mutex<VecDeque<Event>>,
}

impl MemorySink {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn scaling_events(&self) -> Vec<ScalingEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Scaling(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        let mut events = self.events.lock();
        if events.len() == self.limit {
            events.pop_front();
        }
        events.push_back(event);
    }
}

// One JSON document per line
pub struct JsonLinesSink<W: Write + Send + 'static> {
    writer: Mutex<W>,
}

impl<W: Write + Send + 'static> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send + 'static> EventSink for JsonLinesSink<W> {
    fn emit(&self, event: Event) {
        let mut writer = self.writer.lock();
        let written = serde_json::to_writer(&mut *writer, &event)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"));

        // A broken sink must never fail a booking
        if let Err(e) = written {
            warn!(error = %e, "failed to write event");
        }
    }
}

impl<S: EventSink + ?Sized> EventSink for std::sync::Arc<S> {
    fn emit(&self, event: Event) {
        (**self).emit(event)
    }
}
