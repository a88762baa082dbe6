// Fleet registry: the authoritative set of buses and their seat maps.
//
// Every bus owns its seat map behind its own lock, so work on different buses
// never contends. The registry-wide lock only guards membership (insert and
// removal of `Arc<Bus>` pointers) and is never held while a seat map is locked.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::reservation::BookingError;

// Bus ids are handed out in deployment order, so ordering by id is ordering by creation
pub type BusId = u32;
// 1-based, unique within a bus
pub type SeatId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ReservationId(pub u64);

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BK{:06}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HoldId(pub u64);

impl fmt::Display for HoldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HD{:06}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusState {
    Active,
    Draining,
    Retired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatStatus {
    Free,
    Held,
    Booked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeatState {
    Free,
    Held {
        hold_id: HoldId,
        expires_at: DateTime<Utc>,
    },
    Booked {
        reservation_id: ReservationId,
    },
}

impl SeatState {
    fn status(&self) -> SeatStatus {
        match self {
            SeatState::Free => SeatStatus::Free,
            SeatState::Held { .. } => SeatStatus::Held,
            SeatState::Booked { .. } => SeatStatus::Booked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Seat {
    pub id: SeatId,
    pub status: SeatStatus,
}

// What a caller wants to put on a free seat
#[derive(Debug, Clone, Copy)]
pub(crate) enum Claim {
    Book(ReservationId),
    Hold {
        hold_id: HoldId,
        expires_at: DateTime<Utc>,
    },
}

impl Claim {
    fn into_state(self) -> SeatState {
        match self {
            Claim::Book(reservation_id) => SeatState::Booked { reservation_id },
            Claim::Hold {
                hold_id,
                expires_at,
            } => SeatState::Held {
                hold_id,
                expires_at,
            },
        }
    }
}

// What a caller believes currently occupies a seat it is about to free
#[derive(Debug, Clone, Copy)]
pub(crate) enum Occupant {
    Reservation(ReservationId),
    Hold(HoldId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Released {
    pub retired: bool,
    pub resulting_occupancy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainOutcome {
    pub bus_id: BusId,
    // An empty bus skips DRAINING and retires immediately
    pub retired: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusStatus {
    pub bus_id: BusId,
    pub state: BusState,
    pub total_seats: usize,
    pub free_seats: usize,
    pub held_seats: usize,
    pub booked_seats: usize,
    pub load_factor: f64,
}

struct SeatMap {
    state: BusState,
    seats: Vec<SeatState>,
    // Indices of FREE seats; first() is the lowest seat
    free: BTreeSet<usize>,
    held: usize,
    booked: usize,
}

impl SeatMap {
    fn new(seats: u16) -> Self {
        let seats = seats as usize;
        Self {
            state: BusState::Active,
            seats: vec![SeatState::Free; seats],
            free: (0..seats).collect(),
            held: 0,
            booked: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.held == 0 && self.booked == 0
    }

    fn pick(&self, preferred: Option<SeatId>) -> Option<usize> {
        if let Some(seat) = preferred {
            let idx = (seat as usize).checked_sub(1)?;
            if self.free.contains(&idx) {
                return Some(idx);
            }
        }
        self.free.first().copied()
    }
}

pub struct Bus {
    id: BusId,
    capacity: usize,
    seat_map: Mutex<SeatMap>,
}

impl Bus {
    fn new(id: BusId, seats: u16) -> Self {
        Self {
            id,
            capacity: seats as usize,
            seat_map: Mutex::new(SeatMap::new(seats)),
        }
    }

    pub fn id(&self) -> BusId {
        self.id
    }

    pub fn state(&self) -> BusState {
        self.seat_map.lock().state
    }

    pub fn seats(&self) -> Vec<Seat> {
        let map = self.seat_map.lock();
        map.seats
            .iter()
            .enumerate()
            .map(|(idx, state)| Seat {
                id: (idx + 1) as SeatId,
                status: state.status(),
            })
            .collect()
    }

    pub fn status(&self) -> BusStatus {
        let map = self.seat_map.lock();
        self.status_of(&map)
    }

    fn status_of(&self, map: &SeatMap) -> BusStatus {
        BusStatus {
            bus_id: self.id,
            state: map.state,
            total_seats: self.capacity,
            free_seats: map.free.len(),
            held_seats: map.held,
            booked_seats: map.booked,
            load_factor: if self.capacity == 0 {
                0.0
            } else {
                map.booked as f64 / self.capacity as f64
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, SeatMap> {
        self.seat_map.lock()
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .finish()
    }
}

// Aggregate counters, only ever mutated while the affected bus is locked
#[derive(Debug, Default)]
struct FleetCounters {
    // Seats on buses that are not yet retired
    total_seats: AtomicUsize,
    // BOOKED seats on any bus
    booked_seats: AtomicUsize,
    active_buses: AtomicUsize,
    active_seats: AtomicUsize,
    active_booked: AtomicUsize,
}

impl FleetCounters {
    fn occupancy(&self) -> f64 {
        let total = self.active_seats.load(Ordering::SeqCst);
        if total == 0 {
            return 0.0;
        }
        let booked = self.active_booked.load(Ordering::SeqCst);
        (booked as f64 / total as f64).clamp(0.0, 1.0)
    }
}

#[derive(Debug)]
pub struct FleetRegistry {
    buses: RwLock<BTreeMap<BusId, Arc<Bus>>>,
    next_bus_id: AtomicU32,
    seats_per_bus: u16,
    counters: FleetCounters,
}

impl FleetRegistry {
    pub fn new(seats_per_bus: u16) -> Self {
        Self {
            buses: RwLock::new(BTreeMap::new()),
            next_bus_id: AtomicU32::new(1),
            seats_per_bus,
            counters: FleetCounters::default(),
        }
    }

    pub fn with_fleet(seats_per_bus: u16, buses: usize) -> Self {
        let registry = Self::new(seats_per_bus);
        registry.add_buses(buses);
        registry
    }

    pub fn seats_per_bus(&self) -> u16 {
        self.seats_per_bus
    }

    // Deploys `count` fresh ACTIVE buses and returns their ids
    pub fn add_buses(&self, count: usize) -> Vec<BusId> {
        let mut added = Vec::with_capacity(count);

        for _ in 0..count {
            let id = self.next_bus_id.fetch_add(1, Ordering::SeqCst);
            let bus = Arc::new(Bus::new(id, self.seats_per_bus));
            let seats = bus.capacity;

            self.counters.total_seats.fetch_add(seats, Ordering::SeqCst);
            self.counters.active_seats.fetch_add(seats, Ordering::SeqCst);
            self.counters.active_buses.fetch_add(1, Ordering::SeqCst);
            self.buses.write().insert(id, bus);
            info!(bus_id = id, seats = self.seats_per_bus, "bus deployed");
            added.push(id);
        }

        added
    }

    // Marks the most recently deployed ACTIVE bus as DRAINING.
    // Booked passengers are never evicted; an empty bus retires on the spot.
    pub fn drain_newest(&self) -> Option<DrainOutcome> {
        for bus in self.buses().into_iter().rev() {
            let retired = {
                let mut map = bus.lock();
                if map.state != BusState::Active {
                    continue;
                }

                map.state = BusState::Draining;
                self.counters.active_buses.fetch_sub(1, Ordering::SeqCst);
                self.counters
                    .active_seats
                    .fetch_sub(bus.capacity, Ordering::SeqCst);
                self.counters
                    .active_booked
                    .fetch_sub(map.booked, Ordering::SeqCst);

                if map.is_empty() {
                    self.retire_locked(&bus, &mut map);
                    true
                } else {
                    false
                }
            };

            if retired {
                self.remove(bus.id);
            } else {
                info!(bus_id = bus.id, "bus draining");
            }

            return Some(DrainOutcome {
                bus_id: bus.id,
                retired,
            });
        }

        None
    }

    // Takes a FREE seat for `claim`. A preferred bus/seat is tried first, then the
    // lowest ACTIVE bus id with a free seat, then its lowest free seat.
    pub(crate) fn claim_seat(
        &self,
        preferred_bus: Option<BusId>,
        preferred_seat: Option<SeatId>,
        claim: Claim,
    ) -> Option<(BusId, SeatId)> {
        if let Some(bus) = preferred_bus.and_then(|id| self.get(id)) {
            if let Some(seat) = self.claim_on(&bus, preferred_seat, claim) {
                return Some((bus.id, seat));
            }
        }

        self.buses()
            .iter()
            .find_map(|bus| self.claim_on(bus, None, claim).map(|seat| (bus.id, seat)))
    }

    fn claim_on(&self, bus: &Bus, preferred_seat: Option<SeatId>, claim: Claim) -> Option<SeatId> {
        let mut map = bus.lock();
        if map.state != BusState::Active {
            return None;
        }

        let idx = map.pick(preferred_seat)?;
        map.free.remove(&idx);
        map.seats[idx] = claim.into_state();

        match claim {
            Claim::Book(_) => {
                map.booked += 1;
                self.counters.booked_seats.fetch_add(1, Ordering::SeqCst);
                self.counters.active_booked.fetch_add(1, Ordering::SeqCst);
            }
            Claim::Hold { .. } => map.held += 1,
        }

        Some((idx + 1) as SeatId)
    }

    // Frees a seat occupied by `occupant`. Anything else sitting there means the
    // caller's index and the seat map disagree.
    pub(crate) fn release_seat(
        &self,
        bus_id: BusId,
        seat: SeatId,
        occupant: Occupant,
    ) -> Result<Released, BookingError> {
        let bus = self.get(bus_id).ok_or_else(|| {
            inconsistency(format!("bus {bus_id} missing while {occupant:?} still references it"))
        })?;

        let retired = {
            let mut map = bus.lock();
            let idx = seat_index(&map, seat).ok_or_else(|| {
                inconsistency(format!("seat {seat} does not exist on bus {bus_id}"))
            })?;

            match (map.seats[idx], occupant) {
                (SeatState::Booked { reservation_id }, Occupant::Reservation(expected))
                    if reservation_id == expected =>
                {
                    map.booked -= 1;
                    self.counters.booked_seats.fetch_sub(1, Ordering::SeqCst);
                    if map.state == BusState::Active {
                        self.counters.active_booked.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                (SeatState::Held { hold_id, .. }, Occupant::Hold(expected)) if hold_id == expected => {
                    map.held -= 1;
                }
                (found, _) => {
                    return Err(inconsistency(format!(
                        "bus {bus_id} seat {seat} holds {found:?}, expected {occupant:?}"
                    )));
                }
            }

            map.seats[idx] = SeatState::Free;
            map.free.insert(idx);

            if map.state == BusState::Draining && map.is_empty() {
                self.retire_locked(&bus, &mut map);
                true
            } else {
                false
            }
        };

        if retired {
            self.remove(bus_id);
        }

        Ok(Released {
            retired,
            resulting_occupancy: self.occupancy(),
        })
    }

    // HELD -> BOOKED for the same seat, without the seat ever becoming FREE.
    // A bus that stopped taking bookings since the hold was placed gets the seat
    // back instead, and the caller sees NoCapacity.
    pub(crate) fn promote_hold(
        &self,
        bus_id: BusId,
        seat: SeatId,
        hold: HoldId,
        reservation_id: ReservationId,
    ) -> Result<f64, BookingError> {
        let bus = self
            .get(bus_id)
            .ok_or_else(|| inconsistency(format!("bus {bus_id} missing while hold {hold} references it")))?;

        let retired = {
            let mut map = bus.lock();
            let idx = seat_index(&map, seat).ok_or_else(|| {
                inconsistency(format!("seat {seat} does not exist on bus {bus_id}"))
            })?;

            match map.seats[idx] {
                SeatState::Held { hold_id, .. } if hold_id == hold => {}
                found => {
                    return Err(inconsistency(format!(
                        "bus {bus_id} seat {seat} holds {found:?}, expected hold {hold}"
                    )));
                }
            }

            map.held -= 1;
            if map.state == BusState::Active {
                map.seats[idx] = SeatState::Booked { reservation_id };
                map.booked += 1;
                self.counters.booked_seats.fetch_add(1, Ordering::SeqCst);
                self.counters.active_booked.fetch_add(1, Ordering::SeqCst);
                None
            } else {
                map.seats[idx] = SeatState::Free;
                map.free.insert(idx);
                let retired = map.is_empty();
                if retired {
                    self.retire_locked(&bus, &mut map);
                }
                Some(retired)
            }
        };

        match retired {
            None => Ok(self.occupancy()),
            Some(retired) => {
                if retired {
                    self.remove(bus_id);
                }
                debug!(bus_id, seat, %hold, "hold dropped, bus no longer active");
                Err(BookingError::NoCapacity)
            }
        }
    }

    fn retire_locked(&self, bus: &Bus, map: &mut SeatMap) {
        map.state = BusState::Retired;
        self.counters
            .total_seats
            .fetch_sub(bus.capacity, Ordering::SeqCst);
        info!(bus_id = bus.id, "bus retired");
    }

    fn remove(&self, bus_id: BusId) {
        self.buses.write().remove(&bus_id);
        debug!(bus_id, "bus removed from registry");
    }

    pub fn get(&self, bus_id: BusId) -> Option<Arc<Bus>> {
        self.buses.read().get(&bus_id).cloned()
    }

    // Snapshot of live buses in deployment order
    pub fn buses(&self) -> Vec<Arc<Bus>> {
        self.buses.read().values().cloned().collect()
    }

    pub fn bus_status(&self, bus_id: BusId) -> Option<BusStatus> {
        self.get(bus_id).map(|bus| bus.status())
    }

    pub fn fleet_status(&self) -> Vec<BusStatus> {
        self.buses().iter().map(|bus| bus.status()).collect()
    }

    pub fn fleet_size(&self) -> usize {
        self.buses.read().len()
    }

    pub fn active_buses(&self) -> usize {
        self.counters.active_buses.load(Ordering::SeqCst)
    }

    pub fn total_seats(&self) -> usize {
        self.counters.total_seats.load(Ordering::SeqCst)
    }

    pub fn booked_seats(&self) -> usize {
        self.counters.booked_seats.load(Ordering::SeqCst)
    }

    // booked / total over ACTIVE buses, 0 when there are none
    pub fn occupancy(&self) -> f64 {
        self.counters.occupancy()
    }

    // Recounts every seat map against the incremental counters.
    // Only meaningful at a quiescent point.
    pub fn verify_counters(&self) -> Result<(), BookingError> {
        let buses = self.buses();
        let guards: Vec<_> = buses.iter().map(|bus| (bus, bus.lock())).collect();

        let mut booked = 0;
        let mut total = 0;
        let mut active_buses = 0;
        let mut active_seats = 0;
        let mut active_booked = 0;

        for (bus, map) in &guards {
            let counted_booked = map
                .seats
                .iter()
                .filter(|s| matches!(s, SeatState::Booked { .. }))
                .count();
            let counted_held = map
                .seats
                .iter()
                .filter(|s| matches!(s, SeatState::Held { .. }))
                .count();
            let counted_free = map.seats.iter().filter(|s| **s == SeatState::Free).count();

            if counted_booked != map.booked || counted_held != map.held || counted_free != map.free.len() {
                return Err(inconsistency(format!(
                    "bus {} seat map tallies drifted (booked {}/{}, held {}/{}, free {}/{})",
                    bus.id,
                    counted_booked,
                    map.booked,
                    counted_held,
                    map.held,
                    counted_free,
                    map.free.len()
                )));
            }

            booked += counted_booked;
            total += bus.capacity;
            if map.state == BusState::Active {
                active_buses += 1;
                active_seats += bus.capacity;
                active_booked += counted_booked;
            }
        }

        let c = &self.counters;
        let expected = (
            booked,
            total,
            active_buses,
            active_seats,
            active_booked,
        );
        let actual = (
            c.booked_seats.load(Ordering::SeqCst),
            c.total_seats.load(Ordering::SeqCst),
            c.active_buses.load(Ordering::SeqCst),
            c.active_seats.load(Ordering::SeqCst),
            c.active_booked.load(Ordering::SeqCst),
        );

        if expected != actual {
            return Err(inconsistency(format!(
                "fleet counters {actual:?} do not match seat maps {expected:?}"
            )));
        }

        Ok(())
    }

    // Every (bus, seat, reservation) currently BOOKED, for cross-checking the reservation index
    pub(crate) fn booked_seat_refs(&self) -> Vec<(BusId, SeatId, ReservationId)> {
        let mut refs = Vec::new();
        for bus in self.buses() {
            let map = bus.lock();
            for (idx, state) in map.seats.iter().enumerate() {
                if let SeatState::Booked { reservation_id } = state {
                    refs.push((bus.id, (idx + 1) as SeatId, *reservation_id));
                }
            }
        }
        refs
    }
}

fn seat_index(map: &SeatMap, seat: SeatId) -> Option<usize> {
    let idx = (seat as usize).checked_sub(1)?;
    (idx < map.seats.len()).then_some(idx)
}

fn inconsistency(detail: String) -> BookingError {
    error!(%detail, "seat state invariant violated");
    BookingError::InternalInconsistency(detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn book(registry: &FleetRegistry, n: u64) -> (BusId, SeatId) {
        registry
            .claim_seat(None, None, Claim::Book(ReservationId(n)))
            .unwrap()
    }

    #[test]
    fn test_claims_fill_lowest_bus_and_seat_first() {
        let registry = FleetRegistry::with_fleet(3, 2);

        let claimed: Vec<_> = (0..4).map(|n| book(&registry, n)).collect();
        assert_eq!(claimed, vec![(1, 1), (1, 2), (1, 3), (2, 1)]);
        assert_eq!(registry.booked_seats(), 4);
        assert!((registry.occupancy() - 4.0 / 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_preferred_seat_then_fallback() {
        let registry = FleetRegistry::with_fleet(4, 2);

        let first = registry.claim_seat(Some(2), Some(3), Claim::Book(ReservationId(1)));
        assert_eq!(first, Some((2, 3)));

        // Taken seat falls back to the lowest free seat on the preferred bus
        let second = registry.claim_seat(Some(2), Some(3), Claim::Book(ReservationId(2)));
        assert_eq!(second, Some((2, 1)));

        // Unknown bus falls back to the global rule
        let third = registry.claim_seat(Some(99), None, Claim::Book(ReservationId(3)));
        assert_eq!(third, Some((1, 1)));
    }

    #[test]
    fn test_full_fleet_has_no_capacity() {
        let registry = FleetRegistry::with_fleet(2, 1);
        book(&registry, 1);
        book(&registry, 2);

        assert_eq!(registry.claim_seat(None, None, Claim::Book(ReservationId(3))), None);
        assert_eq!(registry.occupancy(), 1.0);
    }

    #[test]
    fn test_release_checks_occupant() {
        let registry = FleetRegistry::with_fleet(2, 1);
        let (bus, seat) = book(&registry, 7);

        let wrong = registry.release_seat(bus, seat, Occupant::Reservation(ReservationId(8)));
        assert!(matches!(wrong, Err(BookingError::InternalInconsistency(_))));

        let released = registry
            .release_seat(bus, seat, Occupant::Reservation(ReservationId(7)))
            .unwrap();
        assert!(!released.retired);
        assert_eq!(registry.booked_seats(), 0);

        // A second release finds a FREE seat
        assert!(registry
            .release_seat(bus, seat, Occupant::Reservation(ReservationId(7)))
            .is_err());
        registry.verify_counters().unwrap();
    }

    #[test]
    fn test_drain_picks_newest_active_bus() {
        let registry = FleetRegistry::with_fleet(2, 3);
        book(&registry, 1);
        registry.claim_seat(Some(3), None, Claim::Book(ReservationId(2)));

        let outcome = registry.drain_newest().unwrap();
        assert_eq!(outcome, DrainOutcome { bus_id: 3, retired: false });
        assert_eq!(registry.bus_status(3).unwrap().state, BusState::Draining);
        assert_eq!(registry.active_buses(), 2);

        // Draining buses never take new bookings
        assert_eq!(
            registry.claim_seat(Some(3), None, Claim::Book(ReservationId(3))),
            Some((1, 2))
        );

        // Next drain skips bus 3 and retires the empty bus 2 immediately
        let outcome = registry.drain_newest().unwrap();
        assert_eq!(outcome, DrainOutcome { bus_id: 2, retired: true });
        assert!(registry.get(2).is_none());
        registry.verify_counters().unwrap();
    }

    #[test]
    fn test_draining_bus_retires_after_last_release() {
        let registry = FleetRegistry::with_fleet(2, 2);
        let a = registry
            .claim_seat(Some(2), None, Claim::Book(ReservationId(1)))
            .unwrap();
        let b = registry
            .claim_seat(Some(2), None, Claim::Book(ReservationId(2)))
            .unwrap();

        registry.drain_newest().unwrap();
        assert_eq!(registry.total_seats(), 4);

        let first = registry
            .release_seat(a.0, a.1, Occupant::Reservation(ReservationId(1)))
            .unwrap();
        assert!(!first.retired);
        assert_eq!(registry.bus_status(2).unwrap().state, BusState::Draining);

        let last = registry
            .release_seat(b.0, b.1, Occupant::Reservation(ReservationId(2)))
            .unwrap();
        assert!(last.retired);
        assert!(registry.bus_status(2).is_none());
        assert_eq!(registry.total_seats(), 2);
        assert_eq!(registry.fleet_size(), 1);
        registry.verify_counters().unwrap();
    }

    #[test]
    fn test_holds_do_not_count_as_booked() {
        let registry = FleetRegistry::with_fleet(2, 1);
        let claim = Claim::Hold {
            hold_id: HoldId(1),
            expires_at: Utc::now(),
        };
        let (bus, seat) = registry.claim_seat(None, None, claim).unwrap();

        let status = registry.bus_status(bus).unwrap();
        assert_eq!((status.held_seats, status.booked_seats, status.free_seats), (1, 0, 1));
        assert_eq!(registry.occupancy(), 0.0);

        registry
            .promote_hold(bus, seat, HoldId(1), ReservationId(10))
            .unwrap();
        assert_eq!(registry.booked_seats(), 1);
        assert_eq!(registry.occupancy(), 0.5);
        registry.verify_counters().unwrap();
    }

    #[test]
    fn test_draining_bus_with_only_a_hold_waits_for_release() {
        let registry = FleetRegistry::with_fleet(2, 2);
        let claim = Claim::Hold {
            hold_id: HoldId(1),
            expires_at: Utc::now(),
        };
        let (bus, seat) = registry.claim_seat(Some(2), None, claim).unwrap();
        assert_eq!(bus, 2);

        let outcome = registry.drain_newest().unwrap();
        assert_eq!(outcome, DrainOutcome { bus_id: 2, retired: false });
        assert_eq!(registry.bus_status(2).unwrap().state, BusState::Draining);
        registry.verify_counters().unwrap();

        let released = registry.release_seat(bus, seat, Occupant::Hold(HoldId(1))).unwrap();
        assert!(released.retired);
        assert!(registry.get(2).is_none());
        assert_eq!(registry.total_seats(), 2);
        registry.verify_counters().unwrap();
    }

    #[test]
    fn test_hold_on_draining_bus_is_not_promoted() {
        let registry = FleetRegistry::with_fleet(2, 2);
        let claim = Claim::Hold {
            hold_id: HoldId(1),
            expires_at: Utc::now(),
        };
        let (bus, seat) = registry.claim_seat(Some(2), None, claim).unwrap();
        registry.drain_newest().unwrap();

        assert_eq!(
            registry.promote_hold(bus, seat, HoldId(1), ReservationId(5)),
            Err(BookingError::NoCapacity)
        );
        assert_eq!(registry.booked_seats(), 0);
        assert!(registry.get(2).is_none());
        registry.verify_counters().unwrap();
    }

    #[test]
    fn test_concurrent_claims_never_share_a_seat() {
        let registry = Arc::new(FleetRegistry::with_fleet(25, 4));
        let mut handles = vec![];

        for t in 0..8u64 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                (0..20)
                    .filter_map(|i| {
                        registry.claim_seat(None, None, Claim::Book(ReservationId(t * 100 + i)))
                    })
                    .collect::<Vec<_>>()
            }));
        }

        let mut seats: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let claimed = seats.len();
        seats.sort();
        seats.dedup();

        assert_eq!(claimed, 100);
        assert_eq!(seats.len(), 100, "a seat was handed out twice");
        assert_eq!(registry.booked_seats(), 100);
        registry.verify_counters().unwrap();
    }
}
