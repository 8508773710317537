//! The installer's event log and its subscribers.
//!
//! Every event is appended once to a single log, which fixes one global
//! order. Subscribers do not get their own queues: each [`Subscription`]
//! keeps a cursor into the shared log and reads forward at its own pace, so
//! emitting never waits on a subscriber and a stalled subscriber holds no
//! lock that anyone else needs.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use stratus_schema::{Event, EventId};
use thiserror::Error;

/// Append-only, in-memory event log. Ids start at 1 and equal the event's
/// position in the log plus one.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Arc<Event>>>,
    arrived: Condvar,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Event>>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `event`, assigning its id. Waiting subscribers are woken after
    /// the log lock is released.
    pub fn emit(&self, mut event: Event) -> EventId {
        let id = {
            let mut events = self.lock();
            let id = events.len() as EventId + 1;
            event.id = id;
            events.push(Arc::new(event));
            id
        };
        self.arrived.notify_all();
        id
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_id(&self) -> Option<EventId> {
        self.lock().last().map(|e| e.id)
    }

    pub fn snapshot(&self) -> Vec<Arc<Event>> {
        self.lock().clone()
    }

    /// Wake every waiting reader so it can re-check its closed flag.
    fn wake_all(&self) {
        drop(self.lock());
        self.arrived.notify_all();
    }

    /// The event at `cursor`, waiting for it until `deadline` (forever when
    /// `None`). Gives up as soon as `closed` is set.
    fn next(
        &self,
        cursor: usize,
        deadline: Option<Instant>,
        closed: &AtomicBool,
    ) -> Result<Arc<Event>, RecvTimeoutError> {
        let mut events = self.lock();
        loop {
            if closed.load(Ordering::SeqCst) {
                return Err(RecvTimeoutError::Closed);
            }
            if let Some(event) = events.get(cursor) {
                return Ok(Arc::clone(event));
            }
            events = match deadline {
                None => self
                    .arrived
                    .wait(events)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RecvTimeoutError::Timeout);
                    }
                    self.arrived
                        .wait_timeout(events, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    #[error("no event available")]
    Empty,
    #[error("subscription closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvTimeoutError {
    #[error("timed out waiting for an event")]
    Timeout,
    #[error("subscription closed")]
    Closed,
}

/// One consumer's view of the event log.
///
/// Delivers every event emitted after the subscription point, in log
/// order, exactly once. Closing is idempotent; a closed subscription
/// delivers nothing further. Dropping it closes it.
pub struct Subscription {
    id: SubscriptionId,
    log: Arc<EventLog>,
    closed: Arc<AtomicBool>,
    cursor: usize,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Block until the next event, or `None` once closed.
    pub fn recv(&mut self) -> Option<Arc<Event>> {
        let event = self.log.next(self.cursor, None, &self.closed).ok()?;
        self.cursor += 1;
        Some(event)
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Arc<Event>, RecvTimeoutError> {
        let event = self
            .log
            .next(self.cursor, Some(Instant::now() + timeout), &self.closed)?;
        self.cursor += 1;
        Ok(event)
    }

    pub fn try_recv(&mut self) -> Result<Arc<Event>, TryRecvError> {
        match self.log.next(self.cursor, Some(Instant::now()), &self.closed) {
            Ok(event) => {
                self.cursor += 1;
                Ok(event)
            }
            Err(RecvTimeoutError::Timeout) => Err(TryRecvError::Empty),
            Err(RecvTimeoutError::Closed) => Err(TryRecvError::Closed),
        }
    }

    /// Events emitted but not yet received.
    pub fn pending(&self) -> usize {
        self.log.len().saturating_sub(self.cursor)
    }

    pub fn close(&self) {
        close(&self.closed, &self.log);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("cursor", &self.cursor)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Iterator for Subscription {
    type Item = Arc<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

fn close(flag: &AtomicBool, log: &EventLog) {
    if !flag.swap(true, Ordering::SeqCst) {
        log.wake_all();
    }
}

/// The live subscriptions of one installer, so they can be closed by id.
#[derive(Debug)]
pub struct SubscriptionSet {
    log: Arc<EventLog>,
    live: Mutex<HashMap<SubscriptionId, Arc<AtomicBool>>>,
    next_id: AtomicU64,
}

impl SubscriptionSet {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            log,
            live: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn live(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Arc<AtomicBool>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> Subscription {
        let cursor = self.log.len();
        self.attach(cursor)
    }

    /// Subscribe starting right after event `since`, replaying what was
    /// emitted in between. `None` replays the whole log.
    pub fn subscribe_since(&self, since: Option<EventId>) -> Subscription {
        let len = self.log.len();
        let cursor = since.map_or(0, |id| usize::try_from(id).unwrap_or(usize::MAX).min(len));
        self.attach(cursor)
    }

    fn attach(&self, cursor: usize) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let closed = Arc::new(AtomicBool::new(false));
        {
            let mut live = self.live();
            live.retain(|_, flag| !flag.load(Ordering::SeqCst));
            live.insert(id, Arc::clone(&closed));
        }
        Subscription {
            id,
            log: Arc::clone(&self.log),
            closed,
            cursor,
        }
    }

    /// Close a subscription. Returns `false` if it was unknown or already
    /// closed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let flag = self.live().remove(&id);
        match flag {
            Some(flag) if !flag.load(Ordering::SeqCst) => {
                close(&flag, &self.log);
                true
            }
            _ => false,
        }
    }

    pub fn close_all(&self) {
        let flags: Vec<Arc<AtomicBool>> = self.live().drain().map(|(_, flag)| flag).collect();
        for flag in flags {
            close(&flag, &self.log);
        }
    }

    /// Number of subscriptions not yet closed.
    pub fn len(&self) -> usize {
        self.live()
            .values()
            .filter(|flag| !flag.load(Ordering::SeqCst))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
