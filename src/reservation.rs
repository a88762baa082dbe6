// Reservation engine: seat exclusivity on top of the fleet registry.
//
// A seat is BOOKED iff exactly one live reservation references it. Removal from
// the reservation index is the single point that decides who frees a seat, so a
// reservation can never be released twice.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use crate::{
    config::SystemConfig,
    events::{BookingEvent, CancellationEvent, Event, EventSink, Operation},
    fleet::{BusId, Claim, FleetRegistry, HoldId, Occupant, ReservationId, SeatId},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BookingError {
    #[error("Unknown route: {0}")]
    RouteInvalid(String),

    #[error("No active bus has a free seat")]
    NoCapacity,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Dispatcher saturated: queue of {capacity} is full")]
    Overloaded { capacity: usize },

    #[error("Hold {0} expired before confirmation")]
    HoldExpired(HoldId),

    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("Dispatcher is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub route_id: String,
    pub passenger: String,
    pub preferred_bus: Option<BusId>,
    pub preferred_seat: Option<SeatId>,
}

impl BookingRequest {
    pub fn new(route_id: impl Into<String>, passenger: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            passenger: passenger.into(),
            preferred_bus: None,
            preferred_seat: None,
        }
    }

    pub fn preferring(mut self, bus: BusId, seat: Option<SeatId>) -> Self {
        self.preferred_bus = Some(bus);
        self.preferred_seat = seat;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeatHandle {
    pub reservation_id: ReservationId,
    pub bus_id: BusId,
    pub seat_id: SeatId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HoldHandle {
    pub hold_id: HoldId,
    pub bus_id: BusId,
    pub seat_id: SeatId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub reservation_id: ReservationId,
    pub bus_retired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub bus_id: BusId,
    pub seat_id: SeatId,
    pub passenger: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct HoldRecord {
    bus_id: BusId,
    seat_id: SeatId,
    passenger: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub requests: usize,
    pub successful_bookings: usize,
    pub failed_bookings: usize,
    pub cancellations: usize,
    pub holds_expired: usize,
    pub success_rate: f64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    requests: AtomicUsize,
    successful_bookings: AtomicUsize,
    failed_bookings: AtomicUsize,
    cancellations: AtomicUsize,
    holds_expired: AtomicUsize,
}

impl StatsCounters {
    fn snapshot(&self) -> EngineStats {
        let successful = self.successful_bookings.load(Ordering::SeqCst);
        let failed = self.failed_bookings.load(Ordering::SeqCst);
        let attempts = successful + failed;

        EngineStats {
            requests: self.requests.load(Ordering::SeqCst),
            successful_bookings: successful,
            failed_bookings: failed,
            cancellations: self.cancellations.load(Ordering::SeqCst),
            holds_expired: self.holds_expired.load(Ordering::SeqCst),
            success_rate: if attempts == 0 {
                0.0
            } else {
                successful as f64 / attempts as f64
            },
        }
    }
}

pub struct ReservationEngine {
    route_id: String,
    registry: Arc<FleetRegistry>,
    reservations: DashMap<ReservationId, Reservation>,
    holds: DashMap<HoldId, HoldRecord>,
    next_reservation: AtomicU64,
    next_hold: AtomicU64,
    hold_timeout: chrono::Duration,
    sink: Arc<dyn EventSink>,
    stats: StatsCounters,
}

impl ReservationEngine {
    pub fn new(
        route_id: impl Into<String>,
        registry: Arc<FleetRegistry>,
        hold_timeout: Duration,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            route_id: route_id.into(),
            registry,
            reservations: DashMap::new(),
            holds: DashMap::new(),
            next_reservation: AtomicU64::new(1),
            next_hold: AtomicU64::new(1),
            hold_timeout: chrono::Duration::from_std(hold_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
            sink,
            stats: StatsCounters::default(),
        }
    }

    pub fn from_config(
        config: &SystemConfig,
        registry: Arc<FleetRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::new(config.route_id.clone(), registry, config.hold_timeout(), sink)
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn registry(&self) -> &Arc<FleetRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    fn check_route(&self, request: &BookingRequest) -> Result<(), BookingError> {
        if request.route_id == self.route_id {
            Ok(())
        } else {
            Err(BookingError::RouteInvalid(request.route_id.clone()))
        }
    }

    fn record_failure(&self, err: BookingError) -> BookingError {
        self.stats.failed_bookings.fetch_add(1, Ordering::SeqCst);
        err
    }

    pub fn book(&self, request: &BookingRequest) -> Result<SeatHandle, BookingError> {
        self.stats.requests.fetch_add(1, Ordering::SeqCst);
        self.check_route(request)
            .map_err(|e| self.record_failure(e))?;

        let reservation_id = ReservationId(self.next_reservation.fetch_add(1, Ordering::SeqCst));
        let (bus_id, seat_id) = self
            .registry
            .claim_seat(
                request.preferred_bus,
                request.preferred_seat,
                Claim::Book(reservation_id),
            )
            .ok_or_else(|| self.record_failure(BookingError::NoCapacity))?;

        Ok(self.commit(reservation_id, bus_id, seat_id, &request.passenger))
    }

    // Index the reservation and announce it; the seat is already BOOKED
    fn commit(
        &self,
        reservation_id: ReservationId,
        bus_id: BusId,
        seat_id: SeatId,
        passenger: &str,
    ) -> SeatHandle {
        let created_at = Utc::now();
        self.reservations.insert(
            reservation_id,
            Reservation {
                id: reservation_id,
                bus_id,
                seat_id,
                passenger: passenger.to_string(),
                created_at,
            },
        );
        self.stats.successful_bookings.fetch_add(1, Ordering::SeqCst);

        let occupancy = self.registry.occupancy();
        debug!(reservation = %reservation_id, bus_id, seat_id, occupancy, "booked");
        self.sink.emit(Event::Booking(BookingEvent {
            timestamp: created_at,
            operation: Operation::Book,
            reservation_id,
            passenger: passenger.to_string(),
            bus_id,
            seat_id,
            resulting_occupancy: occupancy,
        }));

        SeatHandle {
            reservation_id,
            bus_id,
            seat_id,
        }
    }

    pub fn cancel(&self, reservation_id: ReservationId) -> Result<Ack, BookingError> {
        self.cancel_where(reservation_id, |_| true)
    }

    // Cancels only on behalf of the passenger who made the reservation.
    // Anyone else sees NotFound and the seat stays BOOKED.
    pub fn cancel_for(&self, reservation_id: ReservationId, passenger: &str) -> Result<Ack, BookingError> {
        self.cancel_where(reservation_id, |r| r.passenger == passenger)
    }

    fn cancel_where(
        &self,
        reservation_id: ReservationId,
        allowed: impl FnOnce(&Reservation) -> bool,
    ) -> Result<Ack, BookingError> {
        self.stats.requests.fetch_add(1, Ordering::SeqCst);

        let (_, reservation) = self
            .reservations
            .remove_if(&reservation_id, |_, r| allowed(r))
            .ok_or_else(|| BookingError::NotFound(reservation_id.to_string()))?;

        let released = match self.registry.release_seat(
            reservation.bus_id,
            reservation.seat_id,
            Occupant::Reservation(reservation_id),
        ) {
            Ok(released) => released,
            Err(e) => {
                error!(reservation = %reservation_id, error = %e, "cancel aborted");
                // Leave the record in place for whoever investigates the fault
                self.reservations.insert(reservation_id, reservation);
                return Err(e);
            }
        };

        self.stats.cancellations.fetch_add(1, Ordering::SeqCst);
        debug!(reservation = %reservation_id, bus_retired = released.retired, "cancelled");
        self.sink.emit(Event::Cancellation(CancellationEvent {
            timestamp: Utc::now(),
            operation: Operation::Cancel,
            reservation_id,
            bus_id: reservation.bus_id,
            seat_id: reservation.seat_id,
            resulting_occupancy: released.resulting_occupancy,
            bus_retired: released.retired,
        }));

        Ok(Ack {
            reservation_id,
            bus_retired: released.retired,
        })
    }

    // Puts a seat on hold until `hold_timeout` elapses; it must be confirmed to count as booked
    pub fn hold(&self, request: &BookingRequest) -> Result<HoldHandle, BookingError> {
        self.stats.requests.fetch_add(1, Ordering::SeqCst);
        self.check_route(request)
            .map_err(|e| self.record_failure(e))?;

        let hold_id = HoldId(self.next_hold.fetch_add(1, Ordering::SeqCst));
        let expires_at = Utc::now() + self.hold_timeout;
        let (bus_id, seat_id) = self
            .registry
            .claim_seat(
                request.preferred_bus,
                request.preferred_seat,
                Claim::Hold {
                    hold_id,
                    expires_at,
                },
            )
            .ok_or_else(|| self.record_failure(BookingError::NoCapacity))?;

        self.holds.insert(
            hold_id,
            HoldRecord {
                bus_id,
                seat_id,
                passenger: request.passenger.clone(),
                expires_at,
            },
        );
        debug!(hold = %hold_id, bus_id, seat_id, %expires_at, "seat held");

        Ok(HoldHandle {
            hold_id,
            bus_id,
            seat_id,
            expires_at,
        })
    }

    pub fn confirm(&self, hold_id: HoldId) -> Result<SeatHandle, BookingError> {
        self.stats.requests.fetch_add(1, Ordering::SeqCst);

        let (_, hold) = self
            .holds
            .remove(&hold_id)
            .ok_or_else(|| BookingError::NotFound(hold_id.to_string()))?;

        if hold.expires_at <= Utc::now() {
            self.registry
                .release_seat(hold.bus_id, hold.seat_id, Occupant::Hold(hold_id))?;
            self.stats.holds_expired.fetch_add(1, Ordering::SeqCst);
            return Err(self.record_failure(BookingError::HoldExpired(hold_id)));
        }

        let reservation_id = ReservationId(self.next_reservation.fetch_add(1, Ordering::SeqCst));
        self.registry
            .promote_hold(hold.bus_id, hold.seat_id, hold_id, reservation_id)
            .map_err(|e| self.record_failure(e))?;

        Ok(self.commit(reservation_id, hold.bus_id, hold.seat_id, &hold.passenger))
    }

    pub fn release_hold(&self, hold_id: HoldId) -> Result<(), BookingError> {
        let (_, hold) = self
            .holds
            .remove(&hold_id)
            .ok_or_else(|| BookingError::NotFound(hold_id.to_string()))?;

        self.registry
            .release_seat(hold.bus_id, hold.seat_id, Occupant::Hold(hold_id))?;
        Ok(())
    }

    // Frees every hold whose expiry is at or before `now`; returns how many were freed
    pub fn release_expired_holds(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<HoldId> = self
            .holds
            .iter()
            .filter(|h| h.expires_at <= now)
            .map(|h| *h.key())
            .collect();

        let mut released = 0;
        for hold_id in expired {
            // A concurrent confirm may have won the race for this hold
            let Some((_, hold)) = self.holds.remove_if(&hold_id, |_, h| h.expires_at <= now) else {
                continue;
            };

            match self
                .registry
                .release_seat(hold.bus_id, hold.seat_id, Occupant::Hold(hold_id))
            {
                Ok(_) => {
                    released += 1;
                    self.stats.holds_expired.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => error!(hold = %hold_id, error = %e, "failed to release expired hold"),
            }
        }

        if released > 0 {
            debug!(released, "expired holds released");
        }
        released
    }

    pub fn reservation(&self, reservation_id: ReservationId) -> Option<Reservation> {
        self.reservations
            .get(&reservation_id)
            .map(|r| r.value().clone())
    }

    pub fn reservations_for(&self, passenger: &str) -> Vec<Reservation> {
        let mut found: Vec<_> = self
            .reservations
            .iter()
            .filter(|r| r.passenger == passenger)
            .map(|r| r.value().clone())
            .collect();
        found.sort_by_key(|r| r.id);
        found
    }

    pub fn live_reservations(&self) -> usize {
        self.reservations.len()
    }

    pub fn live_holds(&self) -> usize {
        self.holds.len()
    }

    // Checks the seat/reservation bijection and the fleet counters.
    // Only meaningful when no request is in flight.
    pub fn verify_invariants(&self) -> Result<(), BookingError> {
        self.registry.verify_counters()?;

        let booked = self.registry.booked_seat_refs();
        if booked.len() != self.reservations.len() {
            return Err(BookingError::InternalInconsistency(format!(
                "{} booked seats but {} live reservations",
                booked.len(),
                self.reservations.len()
            )));
        }

        for (bus_id, seat_id, reservation_id) in booked {
            match self.reservations.get(&reservation_id) {
                Some(r) if r.bus_id == bus_id && r.seat_id == seat_id => {}
                _ => {
                    return Err(BookingError::InternalInconsistency(format!(
                        "bus {bus_id} seat {seat_id} is booked by {reservation_id} with no matching reservation"
                    )));
                }
            }
        }

        Ok(())
    }
}
