//! The event model shared by consumers, connections and producers.
//!
//! Every component in this crate carries an [`EventHub`]: a fixed table of
//! *one-time* events (each backed by an [`EventCell`] that resolves at most
//! once) and *many-time* events (plain subscriber lists with no retained
//! state). The hub is what lets a producer observe every request flowing
//! through every connection it created, and what lets an upgrade move an
//! unresolved `post_request` completion from one consumer to its replacement
//! without ever firing it twice.


use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use derive_more::{Display, From};
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// The set of event names used across the crate.
///
/// Which names a given component declares, and whether a name is one-time or
/// many-time for it, is decided by the component when it builds its
/// [`EventHub`]. The same name can be one-time on one component and many-time
/// on another: `pre_request` is a one-time event on a consumer but a
/// many-time stream on the connection and producer observing it.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Event {
    /// A transport was bound to a connection.
    #[display("connection_made")]
    ConnectionMade,
    /// A connection's transport was closed.
    #[display("connection_lost")]
    ConnectionLost,
    /// A request started on a consumer.
    #[display("pre_request")]
    PreRequest,
    /// A consumer finished consuming data.
    #[display("finish")]
    Finish,
    /// A request is done. Usually coincides with `finish`, except across
    /// upgrades.
    #[display("post_request")]
    PostRequest,
    /// Data arrived but has not been parsed yet.
    #[display("data_received")]
    DataReceived,
    /// Data has been handed to the consumer's parser.
    #[display("data_processed")]
    DataProcessed,
    /// A server is ready to accept connections.
    #[display("start")]
    Start,
    /// A server stopped accepting connections.
    #[display("stop")]
    Stop,
}

/// The payload carried by a fired event.
#[derive(Clone, Debug, Default, From)]
pub enum EventData {
    /// No payload.
    #[default]
    #[from(ignore)]
    Null,
    /// Raw bytes: an inbound buffer or a request payload.
    Bytes(Bytes),
    /// A failure outcome, e.g. the error a consumer retired with.
    Failure(Error),
}

impl EventData {
    /// Wraps an optional buffer, mapping `None` to [`EventData::Null`].
    pub fn bytes(data: Option<Bytes>) -> Self {
        data.map_or(EventData::Null, EventData::Bytes)
    }

    /// The byte payload, if any.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            EventData::Bytes(data) => Some(data),
            _ => None,
        }
    }

    /// The failure payload, if any.
    pub fn as_failure(&self) -> Option<&Error> {
        match self {
            EventData::Failure(error) => Some(error),
            _ => None,
        }
    }

    /// Whether this payload is empty.
    pub fn is_null(&self) -> bool {
        matches!(self, EventData::Null)
    }
}

/// A callback registered for an event.
///
/// Subscriber failures are logged and swallowed; they never abort the
/// fan-out to the remaining subscribers.
pub type Subscriber = Arc<dyn Fn(&EventData) -> Result<()> + Send + Sync>;

/// A one-time completion cell.
///
/// The cell resolves at most once; late subscribers are invoked immediately
/// with the stored outcome. Cells are first-class: cloning one yields another
/// handle to the same completion, which is how [`Connection::upgrade`]
/// re-homes an unresolved `post_request` from one consumer onto its
/// replacement without copying subscriber lists.
///
/// [`Connection::upgrade`]: crate::connection::Connection::upgrade
#[derive(Clone, Default)]
pub struct EventCell {
    inner: Arc<Mutex<CellState>>,
}

enum CellState {
    Pending {
        subscribers: Vec<Subscriber>,
        waiters: Vec<oneshot::Sender<EventData>>,
    },
    Done(EventData),
}

impl Default for CellState {
    fn default() -> Self {
        CellState::Pending {
            subscribers: Vec::new(),
            waiters: Vec::new(),
        }
    }
}

impl EventCell {
    /// Creates a fresh, pending cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the cell with `data`.
    ///
    /// Returns whether the fire took effect: `true` on the first call,
    /// `false` once the cell is already resolved. Callers use the return
    /// value to guard exactly-once side effects.
    pub fn fire(&self, data: EventData) -> bool {
        let state = {
            let mut state = self.inner.lock().unwrap();
            match &*state {
                CellState::Done(_) => return false,
                CellState::Pending { .. } => std::mem::replace(&mut *state, CellState::Done(data.clone())),
            }
        };
        if let CellState::Pending { subscribers, waiters } = state {
            notify_all(&subscribers, &data);
            for waiter in waiters {
                let _ = waiter.send(data.clone());
            }
        }
        true
    }

    /// Attaches a completion callback.
    ///
    /// If the cell is already resolved the callback is invoked immediately
    /// with the stored outcome.
    pub fn bind(&self, subscriber: Subscriber) {
        let done = {
            let mut state = self.inner.lock().unwrap();
            match &mut *state {
                CellState::Pending { subscribers, .. } => {
                    subscribers.push(subscriber.clone());
                    None
                }
                CellState::Done(data) => Some(data.clone()),
            }
        };
        if let Some(data) = done {
            notify_all(std::slice::from_ref(&subscriber), &data);
        }
    }

    /// Whether the cell has resolved.
    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.lock().unwrap(), CellState::Done(_))
    }

    /// The stored outcome, if the cell has resolved.
    pub fn result(&self) -> Option<EventData> {
        match &*self.inner.lock().unwrap() {
            CellState::Done(data) => Some(data.clone()),
            CellState::Pending { .. } => None,
        }
    }

    /// Waits for the cell to resolve and returns the outcome.
    ///
    /// Resolves immediately if the cell is already done. If every handle to a
    /// pending cell is dropped the wait yields [`EventData::Null`].
    pub async fn wait(&self) -> EventData {
        let receiver = {
            let mut state = self.inner.lock().unwrap();
            match &mut *state {
                CellState::Done(data) => return data.clone(),
                CellState::Pending { waiters, .. } => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    receiver
                }
            }
        };
        receiver.await.unwrap_or_default()
    }
}

impl fmt::Debug for EventCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("EventCell");
        match &*self.inner.lock().unwrap() {
            CellState::Done(data) => debug.field("result", data).finish(),
            CellState::Pending { subscribers, .. } => {
                debug.field("subscribers", &subscribers.len()).finish()
            }
        }
    }
}

/// Invokes each subscriber, logging and swallowing failures so one bad
/// subscriber cannot abort the fan-out.
fn notify_all(subscribers: &[Subscriber], data: &EventData) {
    for subscriber in subscribers {
        if let Err(error) = subscriber(data) {
            tracing::warn!(error = %error, "event subscriber failed");
        }
    }
}

enum Slot {
    Once(EventCell),
    Stream(Vec<Subscriber>),
}

/// A table of one-time and many-time events for a single component.
///
/// The event names a component responds to are fixed at construction; firing
/// or binding an undeclared name is a logged no-op.
pub struct EventHub {
    slots: Mutex<HashMap<Event, Slot>>,
}

impl EventHub {
    /// Creates a hub with the given one-time and many-time event names.
    pub fn new(one_time: &[Event], many_times: &[Event]) -> Self {
        let mut slots = HashMap::with_capacity(one_time.len() + many_times.len());
        for &event in one_time {
            slots.insert(event, Slot::Once(EventCell::new()));
        }
        for &event in many_times {
            slots.insert(event, Slot::Stream(Vec::new()));
        }
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Registers `subscriber` for a many-time event, or attaches a completion
    /// callback to a one-time event (invoked immediately if the event has
    /// already resolved).
    pub fn bind(&self, event: Event, subscriber: Subscriber) {
        let cell = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get_mut(&event) {
                Some(Slot::Stream(subscribers)) => {
                    subscribers.push(subscriber);
                    return;
                }
                Some(Slot::Once(cell)) => cell.clone(),
                None => {
                    tracing::warn!(%event, "bind on undeclared event");
                    return;
                }
            }
        };
        cell.bind(subscriber);
    }

    /// Fires `event` with `data`.
    ///
    /// For a one-time event, resolves its cell and returns whether the fire
    /// took effect. For a many-time event, invokes each subscriber in
    /// subscription order and returns `true`.
    pub fn fire(&self, event: Event, data: EventData) -> bool {
        enum Target {
            Once(EventCell),
            Stream(Vec<Subscriber>),
        }
        let target = {
            let slots = self.slots.lock().unwrap();
            match slots.get(&event) {
                Some(Slot::Once(cell)) => Target::Once(cell.clone()),
                Some(Slot::Stream(subscribers)) => Target::Stream(subscribers.clone()),
                None => {
                    tracing::warn!(%event, "fire on undeclared event");
                    return false;
                }
            }
        };
        match target {
            Target::Once(cell) => cell.fire(data),
            Target::Stream(subscribers) => {
                notify_all(&subscribers, &data);
                true
            }
        }
    }

    /// The completion cell of a one-time event.
    pub fn cell(&self, event: Event) -> Option<EventCell> {
        match self.slots.lock().unwrap().get(&event) {
            Some(Slot::Once(cell)) => Some(cell.clone()),
            _ => None,
        }
    }

    /// Whether a one-time event has resolved.
    pub fn is_done(&self, event: Event) -> bool {
        self.cell(event).is_some_and(|cell| cell.is_done())
    }

    /// Detaches the completion cell of a one-time event, installing a fresh
    /// pending cell in its place, and returns the detached cell.
    ///
    /// Subscribers already attached to the detached cell ride along with it.
    pub fn pop_cell(&self, event: Event) -> Option<EventCell> {
        match self.slots.lock().unwrap().get_mut(&event) {
            Some(Slot::Once(cell)) => Some(std::mem::take(cell)),
            _ => None,
        }
    }

    /// Replaces the completion cell of a one-time event with `cell`.
    ///
    /// The counterpart of [`pop_cell`](EventHub::pop_cell): resolving the
    /// event on this hub now resolves the adopted cell, so observers that
    /// subscribed through the cell's previous home are notified.
    pub fn adopt_cell(&self, event: Event, cell: EventCell) {
        if let Some(Slot::Once(slot)) = self.slots.lock().unwrap().get_mut(&event) {
            *slot = cell;
        }
    }

    /// For each many-time event of `source` that this hub also declares,
    /// appends all of `source`'s subscribers here, preserving order.
    ///
    /// When the local declaration of a shared name is one-time, the copied
    /// subscribers are attached to its completion cell. This is how
    /// producer-level observers of `pre_request` end up on each consumer's
    /// one-time `pre_request`.
    pub fn copy_many_times_events(&self, source: &EventHub) {
        let copied: Vec<(Event, Vec<Subscriber>)> = {
            let slots = source.slots.lock().unwrap();
            slots
                .iter()
                .filter_map(|(event, slot)| match slot {
                    Slot::Stream(subscribers) => Some((*event, subscribers.clone())),
                    Slot::Once(_) => None,
                })
                .collect()
        };
        for (event, subscribers) in copied {
            let cell = {
                let mut slots = self.slots.lock().unwrap();
                match slots.get_mut(&event) {
                    Some(Slot::Stream(local)) => {
                        local.extend(subscribers);
                        continue;
                    }
                    Some(Slot::Once(cell)) => cell.clone(),
                    None => continue,
                }
            };
            for subscriber in subscribers {
                cell.bind(subscriber);
            }
        }
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock().unwrap();
        let mut events: Vec<&Event> = slots.keys().collect();
        events.sort_by_key(|event| format!("{event}"));
        f.debug_struct("EventHub").field("events", &events).finish()
    }
}
