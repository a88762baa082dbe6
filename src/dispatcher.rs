// Request dispatcher: a bounded queue in front of a fixed worker pool.
//
// Submission never blocks. When the queue already holds `capacity` requests the
// caller gets `BookingError::Overloaded` straight away and an overload event is
// emitted. Workers pull from the shared receiver in arrival order.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::SystemConfig,
    events::{Event, EventSink, OverloadEvent},
    fleet::ReservationId,
    reservation::{Ack, BookingError, BookingRequest, ReservationEngine, SeatHandle},
    sampler::QueueProbe,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Book(BookingRequest),
    Cancel(ReservationId),
    // Honoured only for the passenger who holds the reservation
    CancelFor {
        reservation_id: ReservationId,
        passenger: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Booked(SeatHandle),
    Cancelled(Ack),
}

// Whatever actually serves a request once a worker has picked it up
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Response, BookingError>;
}

#[async_trait]
impl RequestHandler for ReservationEngine {
    async fn handle(&self, request: Request) -> Result<Response, BookingError> {
        match request {
            Request::Book(request) => self.book(&request).map(Response::Booked),
            Request::Cancel(reservation_id) => self.cancel(reservation_id).map(Response::Cancelled),
            Request::CancelFor {
                reservation_id,
                passenger,
            } => self
                .cancel_for(reservation_id, &passenger)
                .map(Response::Cancelled),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct DispatcherStats {
    pub submitted: usize,
    pub completed: usize,
    pub overloaded: usize,
    pub in_flight: usize,
    pub queue_depth: usize,
}

struct Job {
    request: Request,
    reply: oneshot::Sender<Result<Response, BookingError>>,
}

struct Shared<H> {
    handler: Arc<H>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Job>>,
    in_flight: AtomicUsize,
    completed: AtomicUsize,
}

pub struct Dispatcher<H: RequestHandler> {
    // None once shutdown has started
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    shared: Arc<Shared<H>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
    submitted: AtomicUsize,
    overloaded: AtomicUsize,
    sink: Arc<dyn EventSink>,
}

impl<H: RequestHandler> Dispatcher<H> {
    // Spawns `workers` tasks on the current tokio runtime
    pub fn new(handler: Arc<H>, workers: usize, capacity: usize, sink: Arc<dyn EventSink>) -> Self {
        let workers = workers.max(1);
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);

        let shared = Arc::new(Shared {
            handler,
            receiver: tokio::sync::Mutex::new(receiver),
            in_flight: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        });

        let handles = (0..workers)
            .map(|worker_id| tokio::spawn(run_worker(worker_id, shared.clone())))
            .collect();

        info!(workers, capacity, "dispatcher started");

        Self {
            sender: Mutex::new(Some(sender)),
            shared,
            workers: Mutex::new(handles),
            capacity,
            submitted: AtomicUsize::new(0),
            overloaded: AtomicUsize::new(0),
            sink,
        }
    }

    pub fn from_config(config: &SystemConfig, handler: Arc<H>, sink: Arc<dyn EventSink>) -> Self {
        Self::new(handler, config.worker_pool_size, config.queue_capacity, sink)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Requests accepted but not yet picked up by a worker
    pub fn queue_depth(&self) -> usize {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.max_capacity() - sender.capacity(),
            None => 0,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            submitted: self.submitted.load(Ordering::SeqCst),
            completed: self.shared.completed.load(Ordering::SeqCst),
            overloaded: self.overloaded.load(Ordering::SeqCst),
            in_flight: self.in_flight(),
            queue_depth: self.queue_depth(),
        }
    }

    pub async fn submit(&self, request: Request) -> Result<Response, BookingError> {
        let sender = self.sender.lock().clone().ok_or(BookingError::ShuttingDown)?;
        let (reply, response) = oneshot::channel();

        match sender.try_send(Job { request, reply }) {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::SeqCst);
            }
            Err(TrySendError::Full(_)) => {
                self.overloaded.fetch_add(1, Ordering::SeqCst);
                warn!(capacity = self.capacity, "request rejected, queue full");
                self.sink.emit(Event::Overload(OverloadEvent {
                    timestamp: Utc::now(),
                    queue_depth: self.capacity,
                    queue_capacity: self.capacity,
                }));
                return Err(BookingError::Overloaded {
                    capacity: self.capacity,
                });
            }
            Err(TrySendError::Closed(_)) => return Err(BookingError::ShuttingDown),
        }
        // Our clone must not keep the channel open past shutdown
        drop(sender);

        response.await.map_err(|_| {
            BookingError::InternalInconsistency("worker dropped a request without replying".to_string())
        })?
    }

    pub async fn submit_booking(&self, request: BookingRequest) -> Result<SeatHandle, BookingError> {
        match self.submit(Request::Book(request)).await? {
            Response::Booked(handle) => Ok(handle),
            other => Err(unexpected(other)),
        }
    }

    pub async fn submit_cancel(&self, reservation_id: ReservationId) -> Result<Ack, BookingError> {
        match self.submit(Request::Cancel(reservation_id)).await? {
            Response::Cancelled(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    pub async fn submit_cancel_for(
        &self,
        reservation_id: ReservationId,
        passenger: impl Into<String>,
    ) -> Result<Ack, BookingError> {
        let request = Request::CancelFor {
            reservation_id,
            passenger: passenger.into(),
        };
        match self.submit(request).await? {
            Response::Cancelled(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    // Stops accepting work, lets workers finish what is already queued, then waits for them
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock());
        info!(workers = workers.len(), "dispatcher draining");
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "dispatcher worker ended abnormally");
            }
        }
        info!("dispatcher stopped");
    }
}

impl<H: RequestHandler> QueueProbe for Dispatcher<H> {
    fn queue_depth(&self) -> usize {
        Dispatcher::queue_depth(self)
    }
}

impl<H: RequestHandler> Drop for Dispatcher<H> {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().iter() {
            worker.abort();
        }
    }
}

fn unexpected(response: Response) -> BookingError {
    BookingError::InternalInconsistency(format!("mismatched response {response:?}"))
}

async fn run_worker<H: RequestHandler>(worker_id: usize, shared: Arc<Shared<H>>) {
    loop {
        // Only the worker waiting on recv holds the lock; it is released before handling
        let job = shared.receiver.lock().await.recv().await;
        let Some(Job { request, reply }) = job else {
            break;
        };

        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = shared.handler.handle(request).await;
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        shared.completed.fetch_add(1, Ordering::SeqCst);

        // The caller may have given up waiting
        if reply.send(result).is_err() {
            debug!(worker_id, "reply receiver dropped");
        }
    }
    debug!(worker_id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MemorySink, NullSink};
    use crate::fleet::FleetRegistry;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio_test::{assert_err, assert_ok};

    // Holds every request until permits are added
    struct Gate {
        permits: Semaphore,
        served: AtomicUsize,
    }

    impl Gate {
        fn closed() -> Arc<Self> {
            Arc::new(Self {
                permits: Semaphore::new(0),
                served: AtomicUsize::new(0),
            })
        }

        fn open(&self) {
            self.permits.add_permits(1_000);
        }
    }

    #[async_trait]
    impl RequestHandler for Gate {
        async fn handle(&self, request: Request) -> Result<Response, BookingError> {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| BookingError::InternalInconsistency(e.to_string()))?;
            let n = self.served.fetch_add(1, Ordering::SeqCst) as u64 + 1;

            Ok(match request {
                Request::Book(_) => Response::Booked(SeatHandle {
                    reservation_id: ReservationId(n),
                    bus_id: 1,
                    seat_id: n as u16,
                }),
                Request::Cancel(reservation_id) | Request::CancelFor { reservation_id, .. } => {
                    Response::Cancelled(Ack {
                        reservation_id,
                        bus_retired: false,
                    })
                }
            })
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    fn request(n: usize) -> BookingRequest {
        BookingRequest::new("r", format!("p{n}"))
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        const WORKERS: usize = 2;
        const QUEUE: usize = 3;

        let gate = Gate::closed();
        let sink = Arc::new(MemorySink::default());
        let dispatcher = Arc::new(Dispatcher::new(gate.clone(), WORKERS, QUEUE, sink.clone()));

        let mut pending = Vec::new();
        for n in 0..WORKERS {
            let d = dispatcher.clone();
            pending.push(tokio::spawn(async move { d.submit_booking(request(n)).await }));
        }
        wait_until(|| dispatcher.in_flight() == WORKERS).await;

        for n in 0..QUEUE {
            let d = dispatcher.clone();
            pending.push(tokio::spawn(async move { d.submit_booking(request(n)).await }));
        }
        wait_until(|| dispatcher.queue_depth() == QUEUE).await;

        let rejected = dispatcher.submit_booking(request(99)).await;
        assert_eq!(rejected, Err(BookingError::Overloaded { capacity: QUEUE }));
        assert_eq!(dispatcher.stats().overloaded, 1);
        assert!(matches!(sink.events()[..], [Event::Overload(_)]));

        gate.open();
        for handle in pending {
            assert_ok!(handle.await.unwrap());
        }

        let stats = dispatcher.stats();
        assert_eq!(stats.submitted, WORKERS + QUEUE);
        assert_eq!(stats.completed, WORKERS + QUEUE);
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue_then_refuses() {
        let gate = Gate::closed();
        let dispatcher = Arc::new(Dispatcher::new(gate.clone(), 1, 4, Arc::new(NullSink)));

        let mut pending = Vec::new();
        for n in 0..3 {
            let d = dispatcher.clone();
            pending.push(tokio::spawn(async move { d.submit_booking(request(n)).await }));
        }
        wait_until(|| dispatcher.in_flight() == 1 && dispatcher.queue_depth() == 2).await;

        let stopping = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.shutdown().await })
        };
        wait_until(|| dispatcher.is_shutting_down()).await;

        assert_eq!(
            dispatcher.submit_cancel(ReservationId(1)).await,
            Err(BookingError::ShuttingDown)
        );

        gate.open();
        stopping.await.unwrap();
        for handle in pending {
            assert_ok!(handle.await.unwrap());
        }
        assert_eq!(gate.served.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_engine_behind_dispatcher() {
        let registry = Arc::new(FleetRegistry::with_fleet(10, 2));
        let engine = Arc::new(ReservationEngine::new(
            "r",
            registry.clone(),
            Duration::from_secs(60),
            Arc::new(NullSink),
        ));
        let dispatcher = Arc::new(Dispatcher::new(engine.clone(), 4, 64, Arc::new(NullSink)));

        let handles: Vec<_> = (0..15)
            .map(|n| {
                let d = dispatcher.clone();
                tokio::spawn(async move { d.submit_booking(request(n)).await })
            })
            .collect();

        let mut booked = Vec::new();
        for handle in join_all(handles).await {
            booked.push(assert_ok!(handle.unwrap()));
        }
        assert_eq!(registry.booked_seats(), 15);
        assert_eq!(registry.occupancy(), 0.75);

        let ack = assert_ok!(dispatcher.submit_cancel(booked[0].reservation_id).await);
        assert!(!ack.bus_retired);
        assert_err!(dispatcher.submit_cancel(booked[0].reservation_id).await);

        let theirs = booked[1].reservation_id;
        let owner = engine.reservation(theirs).unwrap().passenger;
        assert_eq!(
            dispatcher.submit_cancel_for(theirs, "someone-else").await,
            Err(BookingError::NotFound(theirs.to_string()))
        );
        assert_eq!(registry.booked_seats(), 14);
        assert_ok!(dispatcher.submit_cancel_for(theirs, owner).await);
        assert_eq!(registry.booked_seats(), 13);

        assert_ok!(engine.verify_invariants());
        dispatcher.shutdown().await;
    }
}
