//! Event queue with deterministic ordering, and the simulation clock.

use archsim_core::{Event, EventKind, EventPayload, EventPriority};
use archsim_types::{ComponentId, EventId, SimTime};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::SchedulingError;

/// Key for ordering events in the queue.
///
/// Events are ordered by:
/// 1. Time (earlier first)
/// 2. Priority (fault control before propagation before timers before traffic)
/// 3. Sequence number (FIFO for same time/priority)
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EventKey {
    /// When this event should be processed.
    pub time: SimTime,
    /// Priority for ordering at same time.
    pub priority: EventPriority,
    /// Insertion sequence for deterministic FIFO ordering.
    pub sequence: u64,
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Order by time first
        match self.time.cmp(&other.time) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Then by priority
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Finally by sequence (FIFO)
        self.sequence.cmp(&other.sequence)
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending events plus the current simulated time.
///
/// The clock only moves when an event is popped (or through
/// [`advance_to`](Self::advance_to)), and never backward.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: BTreeMap<EventKey, Event>,
    sequence: u64,
    now: SimTime,
    next_event_id: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulated time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Allocate the id for an event about to be scheduled.
    pub fn next_id(&mut self) -> EventId {
        self.next_event_id += 1;
        EventId(self.next_event_id)
    }

    /// Insert an event. Scheduling before the current time is an error.
    pub fn schedule(&mut self, event: Event) -> Result<EventKey, SchedulingError> {
        if event.time < self.now {
            return Err(SchedulingError::EventInPast {
                kind: event.kind,
                at: event.time,
                now: self.now,
            });
        }
        self.sequence += 1;
        let key = EventKey {
            time: event.time,
            priority: event.priority,
            sequence: self.sequence,
        };
        self.events.insert(key, event);
        Ok(key)
    }

    /// Time of the next event without removing it.
    pub fn peek_time(&self) -> Option<SimTime> {
        self.events.first_key_value().map(|(key, _)| key.time)
    }

    /// Remove the next event and move the clock to its time.
    pub fn pop_next(&mut self) -> Option<Event> {
        let (key, event) = self.events.pop_first()?;
        // Keys are never earlier than `now` (checked in `schedule`).
        self.now = self.now.max(key.time);
        Some(event)
    }

    /// Move the clock forward without draining events.
    pub fn advance_to(&mut self, time: SimTime) -> Result<(), SchedulingError> {
        if time < self.now {
            return Err(SchedulingError::ClockRegression {
                now: self.now,
                to: time,
            });
        }
        self.now = time;
        Ok(())
    }

    /// Drop a scheduled event. Returns it if it was still pending.
    pub fn cancel(&mut self, key: &EventKey) -> Option<Event> {
        self.events.remove(key)
    }
}

/// An event an engine wants scheduled. The kernel assigns its id and
/// causal parent.
#[derive(Debug, Clone, PartialEq)]
pub struct Followup {
    pub at: SimTime,
    pub kind: EventKind,
    pub target: Option<ComponentId>,
    pub payload: EventPayload,
}

impl Followup {
    pub fn new(at: SimTime, kind: EventKind, payload: EventPayload) -> Self {
        Self {
            at,
            kind,
            target: None,
            payload,
        }
    }

    pub fn on(mut self, target: ComponentId) -> Self {
        self.target = Some(target);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(queue: &mut EventQueue, millis: u64, kind: EventKind) -> Event {
        let id = queue.next_id();
        Event::new(id, SimTime::from_millis(millis), kind, EventPayload::None)
    }

    #[test]
    fn test_event_key_ordering() {
        let earlier = EventKey {
            time: SimTime::from_millis(1),
            priority: EventPriority::Request,
            sequence: 2,
        };
        let later = EventKey {
            time: SimTime::from_millis(2),
            priority: EventPriority::Request,
            sequence: 1,
        };
        assert!(earlier < later);
    }

    #[test]
    fn test_priority_ordering_at_same_time() {
        let fault = EventKey {
            time: SimTime::from_millis(1),
            priority: EventPriority::FaultControl,
            sequence: 2, // Higher sequence, but should still be first
        };
        let request = EventKey {
            time: SimTime::from_millis(1),
            priority: EventPriority::Request,
            sequence: 1,
        };
        assert!(fault < request, "Fault control should process before traffic");
    }

    #[test]
    fn test_fifo_within_time_and_priority() {
        let mut queue = EventQueue::new();
        let a = event(&mut queue, 5, EventKind::CacheHit);
        let b = event(&mut queue, 5, EventKind::CacheMiss);
        queue.schedule(a).unwrap();
        queue.schedule(b).unwrap();

        assert_eq!(queue.pop_next().unwrap().kind, EventKind::CacheHit);
        assert_eq!(queue.pop_next().unwrap().kind, EventKind::CacheMiss);
        assert!(queue.pop_next().is_none());
    }

    #[test]
    fn test_pop_advances_clock() {
        let mut queue = EventQueue::new();
        let arrival = event(&mut queue, 10, EventKind::RequestArrival);
        let fault = event(&mut queue, 10, EventKind::FaultActivate);
        queue.schedule(arrival).unwrap();
        queue.schedule(fault).unwrap();

        assert_eq!(queue.peek_time(), Some(SimTime::from_millis(10)));
        let first = queue.pop_next().unwrap();
        assert_eq!(first.kind, EventKind::FaultActivate);
        assert_eq!(queue.now(), SimTime::from_millis(10));
    }

    #[test]
    fn test_schedule_in_past_is_rejected() {
        let mut queue = EventQueue::new();
        queue.advance_to(SimTime::from_millis(20)).unwrap();
        let late = event(&mut queue, 5, EventKind::RequestArrival);
        let err = queue.schedule(late).unwrap_err();
        assert!(matches!(err, SchedulingError::EventInPast { .. }));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clock_never_moves_backward() {
        let mut queue = EventQueue::new();
        queue.advance_to(SimTime::from_millis(20)).unwrap();
        assert_eq!(
            queue.advance_to(SimTime::from_millis(10)),
            Err(SchedulingError::ClockRegression {
                now: SimTime::from_millis(20),
                to: SimTime::from_millis(10),
            })
        );
    }

    #[test]
    fn test_cancel_removes_pending_event() {
        let mut queue = EventQueue::new();
        let e = event(&mut queue, 3, EventKind::RequestArrival);
        let key = queue.schedule(e).unwrap();
        assert!(queue.cancel(&key).is_some());
        assert!(queue.cancel(&key).is_none());
        assert!(queue.is_empty());
    }
}
