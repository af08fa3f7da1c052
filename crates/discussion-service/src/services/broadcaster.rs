//! Real-time fan-out of discussion events.
//!
//! Every open stream gets a roster snapshot first, then a live feed of
//! message, presence and typing events plus a keepalive on a fixed interval.
//! The feed comes from one of two strategies chosen at construction:
//!
//! - **Push**: one `tokio::sync::broadcast` channel per discussion; every
//!   [`RealtimeBroadcaster::publish`] reaches every subscriber of that
//!   discussion.
//! - **Poll**: each stream re-reads the store on a short interval and
//!   synthesizes `message_received`, `participant_joined` and
//!   `participant_left` from what changed. Published events the store
//!   cannot show (edits, deletions, reactions, typing, stream departures)
//!   go to a short per-discussion backlog that every poll drains.
//!
//! Delivery is best effort and at least once; consumers dedupe on ids.
//!
//! When a stream ends (client gone or shutdown) a `participant_left` event
//! for its caller is published exactly once. That is presence only: the
//! caller's seat stays reserved until an explicit leave.

use crate::auth::CallerIdentity;
use crate::config::{Config, StreamDelivery};
use crate::errors::DsError;
use crate::models::api::MessageView;
use crate::models::{ParticipantKind, ReactionCount, RosterEntry};
use crate::observability::metrics;
use crate::repositories::Store;
use chrono::Utc;
use common::types::{DiscussionId, MessageId};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Buffered events per open stream before the writer waits on the client.
const STREAM_BUFFER: usize = 64;

/// Most messages a single poll tick forwards.
const POLL_BATCH: i64 = 100;

/// `seq` values are allocated before commit, so a poll re-reads this many
/// positions behind its cursor to catch late commits.
const POLL_OVERLAP: i64 = 32;

/// A participant as shown in presence and typing events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub id: Uuid,
    pub kind: ParticipantKind,
    pub display_name: String,
}

impl From<&CallerIdentity> for Presence {
    fn from(caller: &CallerIdentity) -> Self {
        Self {
            id: caller.id(),
            kind: caller.kind(),
            display_name: caller.display_name().to_string(),
        }
    }
}

impl From<&RosterEntry> for Presence {
    fn from(entry: &RosterEntry) -> Self {
        Self {
            id: entry.id,
            kind: entry.kind,
            display_name: entry.display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Snapshot { participants: Vec<RosterEntry> },
    MessageReceived(MessageView),
    MessageEdited(MessageView),
    MessageDeleted { message_id: MessageId },
    ReactionUpdated {
        message_id: MessageId,
        reactions: Vec<ReactionCount>,
    },
    ParticipantJoined(Presence),
    ParticipantLeft(Presence),
    TypingStarted(Presence),
    TypingStopped(Presence),
    Keepalive,
}

/// An event tagged with the discussion it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscussionEvent {
    pub discussion_id: DiscussionId,
    pub kind: EventKind,
}

impl DiscussionEvent {
    /// Wire event name.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            EventKind::Snapshot { .. } => "snapshot",
            EventKind::MessageReceived(_) => "message_received",
            EventKind::MessageEdited(_) => "message_edited",
            EventKind::MessageDeleted { .. } => "message_deleted",
            EventKind::ReactionUpdated { .. } => "reaction_updated",
            EventKind::ParticipantJoined(_) => "participant_joined",
            EventKind::ParticipantLeft(_) => "participant_left",
            EventKind::TypingStarted(_) => "typing_started",
            EventKind::TypingStopped(_) => "typing_stopped",
            EventKind::Keepalive => "keepalive",
        }
    }

    /// Wire payload. Always carries `discussionId`.
    pub fn data(&self) -> serde_json::Value {
        let discussion_id = self.discussion_id;
        match &self.kind {
            EventKind::Snapshot { participants } => {
                json!({ "discussionId": discussion_id, "participants": participants })
            }
            EventKind::MessageReceived(message) | EventKind::MessageEdited(message) => {
                json!({ "discussionId": discussion_id, "message": message })
            }
            EventKind::MessageDeleted { message_id } => {
                json!({ "discussionId": discussion_id, "messageId": message_id })
            }
            EventKind::ReactionUpdated {
                message_id,
                reactions,
            } => json!({
                "discussionId": discussion_id,
                "messageId": message_id,
                "reactions": reactions,
            }),
            EventKind::ParticipantJoined(p)
            | EventKind::ParticipantLeft(p)
            | EventKind::TypingStarted(p)
            | EventKind::TypingStopped(p) => {
                json!({ "discussionId": discussion_id, "participant": p })
            }
            EventKind::Keepalive => {
                json!({ "discussionId": discussion_id, "timestamp": Utc::now() })
            }
        }
    }
}

/// An event as delivered on one stream.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub id: u64,
    pub event: DiscussionEvent,
}

pub type EventStream = ReceiverStream<StreamEvent>;

#[derive(Debug, Clone, Copy)]
pub struct BroadcasterOptions {
    pub delivery: StreamDelivery,
    pub keepalive: Duration,
    pub poll_interval: Duration,
    pub channel_capacity: usize,
}

impl BroadcasterOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            delivery: config.stream_delivery,
            keepalive: config.keepalive_interval(),
            poll_interval: config.poll_interval(),
            channel_capacity: config.broadcast_channel_capacity,
        }
    }
}

/// Per-discussion broadcast channels.
struct PushHub {
    capacity: usize,
    channels: RwLock<HashMap<DiscussionId, broadcast::Sender<DiscussionEvent>>>,
}

impl PushHub {
    fn subscribe(&self, discussion_id: DiscussionId) -> Result<broadcast::Receiver<DiscussionEvent>, DsError> {
        let mut channels = self.channels.write().map_err(|_| DsError::Internal)?;
        let sender = channels
            .entry(discussion_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.subscribe())
    }

    fn send(&self, event: DiscussionEvent) {
        if let Ok(channels) = self.channels.read() {
            if let Some(sender) = channels.get(&event.discussion_id) {
                // Err only means nobody is listening right now
                let _ = sender.send(event);
            }
        }
    }

    /// Drop the channel once its last subscriber is gone.
    fn release(&self, discussion_id: DiscussionId) {
        if let Ok(mut channels) = self.channels.write() {
            if channels
                .get(&discussion_id)
                .is_some_and(|sender| sender.receiver_count() == 0)
            {
                channels.remove(&discussion_id);
            }
        }
    }
}

/// Recent published events for poll delivery, kept per discussion while it
/// has open streams.
struct EventLog {
    capacity: usize,
    state: Mutex<EventLogState>,
}

#[derive(Default)]
struct EventLogState {
    next_position: u64,
    discussions: HashMap<DiscussionId, Backlog>,
}

#[derive(Default)]
struct Backlog {
    listeners: usize,
    events: VecDeque<(u64, EventKind)>,
    /// Position of the newest event pushed out by the capacity bound.
    dropped: Option<u64>,
}

/// What a poll read from the backlog.
struct Drained {
    events: Vec<EventKind>,
    position: u64,
    lagged: bool,
}

impl EventLog {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(EventLogState::default()),
        }
    }

    /// Register a listener; returns the position it reads from.
    fn subscribe(&self, discussion_id: DiscussionId) -> Result<u64, DsError> {
        let mut guard = self.state.lock().map_err(|_| DsError::Internal)?;
        let state = &mut *guard;
        state.discussions.entry(discussion_id).or_default().listeners += 1;
        Ok(state.next_position)
    }

    fn append(&self, discussion_id: DiscussionId, kind: EventKind) {
        let Ok(mut guard) = self.state.lock() else {
            return;
        };
        let state = &mut *guard;
        // Nobody polling this discussion
        let Some(backlog) = state.discussions.get_mut(&discussion_id) else {
            return;
        };
        backlog.events.push_back((state.next_position, kind));
        while backlog.events.len() > self.capacity {
            if let Some((position, _)) = backlog.events.pop_front() {
                backlog.dropped = Some(position);
            }
        }
        state.next_position += 1;
    }

    /// Events at or after `position`.
    fn since(&self, discussion_id: DiscussionId, position: u64) -> Drained {
        let Ok(state) = self.state.lock() else {
            return Drained {
                events: Vec::new(),
                position,
                lagged: false,
            };
        };
        let Some(backlog) = state.discussions.get(&discussion_id) else {
            return Drained {
                events: Vec::new(),
                position: state.next_position,
                lagged: false,
            };
        };
        Drained {
            events: backlog
                .events
                .iter()
                .filter(|(p, _)| *p >= position)
                .map(|(_, kind)| kind.clone())
                .collect(),
            position: state.next_position,
            lagged: backlog.dropped.is_some_and(|dropped| dropped >= position),
        }
    }

    /// Forget the discussion once its last listener is gone.
    fn release(&self, discussion_id: DiscussionId) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(backlog) = state.discussions.get_mut(&discussion_id) {
                backlog.listeners = backlog.listeners.saturating_sub(1);
                if backlog.listeners == 0 {
                    state.discussions.remove(&discussion_id);
                }
            }
        }
    }
}

enum Delivery {
    Push(PushHub),
    Poll { interval: Duration, log: EventLog },
}

/// Where a stream's live events come from.
enum Feed {
    Push(broadcast::Receiver<DiscussionEvent>),
    Poll(PollCursor),
}

struct PollCursor {
    ticker: Interval,
    /// Highest `seq` forwarded so far.
    last_seq: i64,
    /// `seq` at open; older messages are history, never forwarded.
    floor_seq: i64,
    /// Messages forwarded inside the re-read window.
    delivered: HashMap<MessageId, i64>,
    log_position: u64,
    roster: HashMap<Uuid, Presence>,
}

impl Feed {
    /// Next batch of events for `discussion_id`; `None` once the feed is gone.
    async fn next(
        &mut self,
        discussion_id: DiscussionId,
        store: &dyn Store,
        log: Option<&EventLog>,
    ) -> Option<Vec<EventKind>> {
        match self {
            Feed::Push(receiver) => loop {
                match receiver.recv().await {
                    Ok(event) if event.discussion_id == discussion_id => {
                        return Some(vec![event.kind]);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            target: "ds.services.broadcaster",
                            discussion_id = %discussion_id,
                            skipped,
                            "Stream lagged, events dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Feed::Poll(cursor) => {
                cursor.ticker.tick().await;
                Some(cursor.poll(discussion_id, store, log).await)
            }
        }
    }
}

impl PollCursor {
    async fn poll(
        &mut self,
        discussion_id: DiscussionId,
        store: &dyn Store,
        log: Option<&EventLog>,
    ) -> Vec<EventKind> {
        // Read everything before touching cursor state so a cancelled poll
        // is simply repeated on the next tick
        let from = (self.last_seq - POLL_OVERLAP).max(self.floor_seq);
        let messages = store.messages_after(discussion_id, from, POLL_BATCH).await;
        let roster = store.roster(discussion_id).await;
        let (messages, roster) = match (messages, roster) {
            (Ok(messages), Ok(roster)) => (messages, roster),
            (Err(e), _) | (_, Err(e)) => {
                warn!(
                    target: "ds.services.broadcaster",
                    discussion_id = %discussion_id,
                    error = %e,
                    "Poll failed, retrying next tick"
                );
                return Vec::new();
            }
        };

        let logged = match log {
            Some(log) => {
                let drained = log.since(discussion_id, self.log_position);
                if drained.lagged {
                    warn!(
                        target: "ds.services.broadcaster",
                        discussion_id = %discussion_id,
                        "Poll backlog overflowed, events dropped"
                    );
                }
                self.log_position = drained.position;
                drained.events
            }
            None => Vec::new(),
        };

        let mut events = Vec::new();

        let current: HashMap<Uuid, Presence> = roster
            .iter()
            .map(|entry| (entry.id, Presence::from(entry)))
            .collect();
        for (id, presence) in &current {
            if !self.roster.contains_key(id) {
                events.push(EventKind::ParticipantJoined(presence.clone()));
            }
        }

        for message in &messages {
            self.last_seq = self.last_seq.max(message.seq);
            if self.delivered.insert(message.id, message.seq).is_none() {
                events.push(EventKind::MessageReceived(MessageView::from(message)));
            }
        }
        let window_start = self.last_seq - POLL_OVERLAP;
        self.delivered.retain(|_, seq| *seq > window_start);

        let announced: HashSet<Uuid> = logged
            .iter()
            .filter_map(|kind| match kind {
                EventKind::ParticipantLeft(presence) => Some(presence.id),
                _ => None,
            })
            .collect();
        events.extend(logged);
        for (id, presence) in &self.roster {
            if !current.contains_key(id) && !announced.contains(id) {
                events.push(EventKind::ParticipantLeft(presence.clone()));
            }
        }
        self.roster = current;

        events
    }
}

/// Fans out events to every open stream of a discussion.
pub struct RealtimeBroadcaster {
    store: Arc<dyn Store>,
    delivery: Delivery,
    keepalive: Duration,
    next_event_id: AtomicU64,
    open_streams: AtomicUsize,
    shutdown: CancellationToken,
}

impl RealtimeBroadcaster {
    /// Streams end when `shutdown` is cancelled.
    pub fn new(store: Arc<dyn Store>, options: BroadcasterOptions, shutdown: CancellationToken) -> Self {
        let delivery = match options.delivery {
            StreamDelivery::Push => Delivery::Push(PushHub {
                capacity: options.channel_capacity,
                channels: RwLock::new(HashMap::new()),
            }),
            StreamDelivery::Poll => Delivery::Poll {
                interval: options.poll_interval,
                log: EventLog::new(options.channel_capacity),
            },
        };

        Self {
            store,
            delivery,
            keepalive: options.keepalive,
            next_event_id: AtomicU64::new(1),
            open_streams: AtomicUsize::new(0),
            shutdown,
        }
    }

    pub fn delivery(&self) -> StreamDelivery {
        match self.delivery {
            Delivery::Push(_) => StreamDelivery::Push,
            Delivery::Poll { .. } => StreamDelivery::Poll,
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive
    }

    pub fn open_stream_count(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// Publish an event to every stream of `discussion_id`.
    pub fn publish(&self, discussion_id: DiscussionId, kind: EventKind) {
        let event = DiscussionEvent {
            discussion_id,
            kind,
        };
        match &self.delivery {
            Delivery::Push(hub) => hub.send(event),
            // Messages and joins are read back from the store
            Delivery::Poll { .. }
                if matches!(
                    event.kind,
                    EventKind::MessageReceived(_)
                        | EventKind::ParticipantJoined(_)
                        | EventKind::Snapshot { .. }
                        | EventKind::Keepalive
                ) =>
            {
                debug!(
                    target: "ds.services.broadcaster",
                    event = event.name(),
                    "Poll delivery, event left to the next poll"
                );
            }
            Delivery::Poll { log, .. } => log.append(event.discussion_id, event.kind),
        }
    }

    fn poll_log(&self) -> Option<&EventLog> {
        match &self.delivery {
            Delivery::Push(_) => None,
            Delivery::Poll { log, .. } => Some(log),
        }
    }

    /// Open a stream for `caller`. The first item is the roster snapshot.
    ///
    /// # Errors
    ///
    /// Store failures while reading the snapshot.
    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    pub async fn open_stream(
        self: &Arc<Self>,
        discussion_id: DiscussionId,
        caller: &CallerIdentity,
    ) -> Result<EventStream, DsError> {
        // Subscribe before reading the roster so nothing falls in between
        let feed = match &self.delivery {
            Delivery::Push(hub) => Feed::Push(hub.subscribe(discussion_id)?),
            Delivery::Poll { interval, log } => {
                let last_seq = self.store.latest_seq(discussion_id).await?;
                Feed::Poll(PollCursor {
                    ticker: ticker(*interval),
                    last_seq,
                    floor_seq: last_seq,
                    delivered: HashMap::new(),
                    log_position: log.subscribe(discussion_id)?,
                    roster: HashMap::new(),
                })
            }
        };

        let participants = match self.store.roster(discussion_id).await {
            Ok(participants) => participants,
            Err(e) => {
                self.release(discussion_id, feed);
                return Err(e);
            }
        };

        let feed = match feed {
            Feed::Poll(mut cursor) => {
                cursor.roster = participants
                    .iter()
                    .map(|entry| (entry.id, Presence::from(entry)))
                    .collect();
                Feed::Poll(cursor)
            }
            push => push,
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let snapshot = StreamEvent {
            id: self.next_id(),
            event: DiscussionEvent {
                discussion_id,
                kind: EventKind::Snapshot { participants },
            },
        };
        metrics::record_stream_event("snapshot");
        // Fresh channel with spare capacity; cannot fail
        let _ = tx.try_send(snapshot);

        self.open_streams.fetch_add(1, Ordering::SeqCst);
        metrics::stream_opened();
        debug!(target: "ds.services.broadcaster", "Stream opened");

        let broadcaster = Arc::clone(self);
        let presence = Presence::from(caller);
        tokio::spawn(async move {
            broadcaster.pump(discussion_id, presence, tx, feed).await;
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn pump(
        self: Arc<Self>,
        discussion_id: DiscussionId,
        presence: Presence,
        tx: mpsc::Sender<StreamEvent>,
        mut feed: Feed,
    ) {
        let mut keepalive = ticker(self.keepalive);

        'stream: loop {
            let batch = tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tx.closed() => break,
                _ = keepalive.tick() => vec![EventKind::Keepalive],
                next = feed.next(discussion_id, self.store.as_ref(), self.poll_log()) => match next {
                    Some(batch) => batch,
                    None => break,
                },
            };

            for kind in batch {
                if !self.forward(&tx, discussion_id, kind).await {
                    break 'stream;
                }
            }
        }

        self.release(discussion_id, feed);
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
        metrics::stream_closed();
        debug!(
            target: "ds.services.broadcaster",
            discussion_id = %discussion_id,
            "Stream closed"
        );

        self.publish(discussion_id, EventKind::ParticipantLeft(presence));
    }

    /// Returns `false` once the client is gone.
    async fn forward(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        discussion_id: DiscussionId,
        kind: EventKind,
    ) -> bool {
        let event = DiscussionEvent {
            discussion_id,
            kind,
        };
        metrics::record_stream_event(event.name());
        tx.send(StreamEvent {
            id: self.next_id(),
            event,
        })
        .await
        .is_ok()
    }

    fn release(&self, discussion_id: DiscussionId, feed: Feed) {
        drop(feed);
        match &self.delivery {
            Delivery::Push(hub) => hub.release(discussion_id),
            Delivery::Poll { log, .. } => log.release(discussion_id),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_event_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// Interval whose first tick is one period away.
fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{Discussion, MemberRole, NewMessage, Sender};
    use crate::repositories::{
        AccountRepository, DiscussionRepository, MemoryStore, MessageRepository,
        ParticipantRepository,
    };
    use common::types::{AccountId, ParticipantId};
    use tokio_stream::StreamExt;

    const KEEPALIVE: Duration = Duration::from_secs(5);

    async fn setup(delivery: StreamDelivery) -> (Arc<MemoryStore>, Arc<RealtimeBroadcaster>, Discussion, CancellationToken) {
        let store = Arc::new(MemoryStore::new());
        let owner = store
            .create_account("owner@example.com", "Owner", "hash")
            .await
            .unwrap();
        let discussion = Discussion::new("Weather", owner.id, None);
        store.insert_discussion(&discussion, "Owner").await.unwrap();

        let shutdown = CancellationToken::new();
        let broadcaster = Arc::new(RealtimeBroadcaster::new(
            store.clone(),
            BroadcasterOptions {
                delivery,
                keepalive: KEEPALIVE,
                poll_interval: Duration::from_secs(3),
                channel_capacity: 16,
            },
            shutdown.clone(),
        ));
        (store, broadcaster, discussion, shutdown)
    }

    fn guest(name: &str) -> CallerIdentity {
        CallerIdentity::Anonymous {
            participant_id: ParticipantId::new(),
            display_name: name.to_string(),
        }
    }

    fn owner(discussion: &Discussion) -> CallerIdentity {
        CallerIdentity::Account {
            account_id: discussion.owner_id,
            role: MemberRole::Owner,
            display_name: "Owner".to_string(),
        }
    }

    async fn next_named(stream: &mut EventStream, name: &str) -> Option<StreamEvent> {
        loop {
            let item = tokio::time::timeout(Duration::from_secs(30), stream.next())
                .await
                .ok()??;
            if item.event.name() == name {
                return Some(item);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_first_then_published_events() {
        let (_store, broadcaster, discussion, _shutdown) = setup(StreamDelivery::Push).await;
        let mut stream = broadcaster
            .open_stream(discussion.id, &guest("Bob"))
            .await
            .unwrap();

        let first = stream.next().await.unwrap();
        match &first.event.kind {
            EventKind::Snapshot { participants } => assert_eq!(participants.len(), 1),
            other => unreachable!("expected snapshot, got {other:?}"),
        }

        broadcaster.publish(
            discussion.id,
            EventKind::TypingStarted(Presence::from(&owner(&discussion))),
        );
        let typing = next_named(&mut stream, "typing_started").await.unwrap();
        assert!(typing.id > first.id);
        assert_eq!(typing.event.discussion_id, discussion.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_do_not_cross_discussions() {
        let (_store, broadcaster, discussion, _shutdown) = setup(StreamDelivery::Push).await;
        let mut stream = broadcaster
            .open_stream(discussion.id, &guest("Bob"))
            .await
            .unwrap();
        stream.next().await.unwrap();

        broadcaster.publish(
            DiscussionId::new(),
            EventKind::MessageDeleted {
                message_id: MessageId::new(),
            },
        );

        // Only the keepalive arrives
        let next = tokio::time::timeout(KEEPALIVE * 2, stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.event.name(), "keepalive");
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_on_idle_stream() {
        let (_store, broadcaster, discussion, _shutdown) = setup(StreamDelivery::Push).await;
        let mut stream = broadcaster
            .open_stream(discussion.id, &guest("Bob"))
            .await
            .unwrap();
        stream.next().await.unwrap();

        let start = Instant::now();
        let keepalive = stream.next().await.unwrap();
        assert_eq!(keepalive.event.name(), "keepalive");
        assert!(start.elapsed() <= KEEPALIVE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_stream_announces_departure_once() {
        let (_store, broadcaster, discussion, _shutdown) = setup(StreamDelivery::Push).await;
        let mut observer = broadcaster
            .open_stream(discussion.id, &owner(&discussion))
            .await
            .unwrap();
        observer.next().await.unwrap();

        let bob = guest("Bob");
        let leaver = broadcaster.open_stream(discussion.id, &bob).await.unwrap();
        assert_eq!(broadcaster.open_stream_count(), 2);
        drop(leaver);

        let left = next_named(&mut observer, "participant_left").await.unwrap();
        assert_eq!(left.event.kind, EventKind::ParticipantLeft(Presence::from(&bob)));

        // Several keepalive periods pass without a second departure
        let mut seen = Vec::new();
        for _ in 0..3 {
            let item = observer.next().await.unwrap();
            seen.push(item.event.name());
        }
        assert!(seen.iter().all(|name| *name == "keepalive"));
        assert_eq!(broadcaster.open_stream_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_streams() {
        let (_store, broadcaster, discussion, shutdown) = setup(StreamDelivery::Push).await;
        let mut stream = broadcaster
            .open_stream(discussion.id, &guest("Bob"))
            .await
            .unwrap();
        stream.next().await.unwrap();

        shutdown.cancel();
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    async fn post(store: &MemoryStore, discussion: &Discussion, content: &str) -> crate::models::Message {
        store
            .insert_message(&NewMessage {
                id: MessageId::new(),
                discussion_id: discussion.id,
                sender: Sender::Account {
                    account_id: discussion.owner_id,
                    display_name: "Owner".to_string(),
                    role: MemberRole::Owner,
                },
                content: content.to_string(),
                parent_id: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_closing_stream_announces_departure_once() {
        let (_store, broadcaster, discussion, _shutdown) = setup(StreamDelivery::Poll).await;
        let mut observer = broadcaster
            .open_stream(discussion.id, &owner(&discussion))
            .await
            .unwrap();
        observer.next().await.unwrap();

        let bob = guest("Bob");
        let leaver = broadcaster.open_stream(discussion.id, &bob).await.unwrap();
        assert_eq!(broadcaster.open_stream_count(), 2);
        drop(leaver);

        let left = next_named(&mut observer, "participant_left").await.unwrap();
        assert_eq!(left.event.kind, EventKind::ParticipantLeft(Presence::from(&bob)));

        let mut seen = Vec::new();
        for _ in 0..3 {
            let item = observer.next().await.unwrap();
            seen.push(item.event.name());
        }
        assert!(seen.iter().all(|name| *name == "keepalive"));
        assert_eq!(broadcaster.open_stream_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_relays_published_events() {
        let (_store, broadcaster, discussion, _shutdown) = setup(StreamDelivery::Poll).await;
        let mut stream = broadcaster
            .open_stream(discussion.id, &guest("Bob"))
            .await
            .unwrap();
        stream.next().await.unwrap();

        let deleted = MessageId::new();
        broadcaster.publish(
            discussion.id,
            EventKind::TypingStarted(Presence::from(&owner(&discussion))),
        );
        broadcaster.publish(discussion.id, EventKind::MessageDeleted { message_id: deleted });

        let typing = next_named(&mut stream, "typing_started").await.unwrap();
        let removal = next_named(&mut stream, "message_deleted").await.unwrap();
        assert!(removal.id > typing.id);
        assert_eq!(
            removal.event.kind,
            EventKind::MessageDeleted { message_id: deleted }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_publish_without_streams_keeps_nothing() {
        let (_store, broadcaster, discussion, _shutdown) = setup(StreamDelivery::Poll).await;
        broadcaster.publish(
            discussion.id,
            EventKind::TypingStarted(Presence::from(&owner(&discussion))),
        );
        let log = broadcaster.poll_log().unwrap();
        assert!(log.since(discussion.id, 0).events.is_empty());

        let position = log.subscribe(discussion.id).unwrap();
        broadcaster.publish(
            discussion.id,
            EventKind::TypingStopped(Presence::from(&owner(&discussion))),
        );
        assert_eq!(log.since(discussion.id, position).events.len(), 1);
        log.release(discussion.id);
        assert!(log.since(discussion.id, position).events.is_empty());
    }

    #[test]
    fn test_poll_backlog_reports_overflow() {
        let discussion_id = DiscussionId::new();
        let log = EventLog::new(2);
        let position = log.subscribe(discussion_id).unwrap();
        for _ in 0..3 {
            log.append(discussion_id, EventKind::MessageDeleted { message_id: MessageId::new() });
        }

        let drained = log.since(discussion_id, position);
        assert!(drained.lagged);
        assert_eq!(drained.events.len(), 2);
        assert!(!log.since(discussion_id, drained.position).lagged);
    }

    #[tokio::test]
    async fn test_poll_picks_up_late_commit_behind_cursor() {
        let (store, _broadcaster, discussion, _shutdown) = setup(StreamDelivery::Poll).await;
        let first = post(&store, &discussion, "one").await;
        let late = post(&store, &discussion, "two").await;
        let third = post(&store, &discussion, "three").await;

        // The cursor already saw the neighbours of a message that committed late
        let roster = store.roster(discussion.id).await.unwrap();
        let mut cursor = PollCursor {
            ticker: ticker(Duration::from_secs(3)),
            last_seq: third.seq,
            floor_seq: 0,
            delivered: HashMap::from([(first.id, first.seq), (third.id, third.seq)]),
            log_position: 0,
            roster: roster
                .iter()
                .map(|entry| (entry.id, Presence::from(entry)))
                .collect(),
        };

        let events = cursor.poll(discussion.id, &*store, None).await;
        assert_eq!(events.len(), 1);
        match events.first() {
            Some(EventKind::MessageReceived(view)) => assert_eq!(view.id, late.id),
            other => unreachable!("expected the late message, got {other:?}"),
        }

        // Nothing new on the next pass
        assert!(cursor.poll(discussion.id, &*store, None).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_delivery_picks_up_new_messages() {
        let (store, broadcaster, discussion, _shutdown) = setup(StreamDelivery::Poll).await;
        assert_eq!(broadcaster.delivery(), StreamDelivery::Poll);
        let mut stream = broadcaster
            .open_stream(discussion.id, &guest("Bob"))
            .await
            .unwrap();
        stream.next().await.unwrap();

        let message = store
            .insert_message(&NewMessage {
                id: MessageId::new(),
                discussion_id: discussion.id,
                sender: Sender::Account {
                    account_id: AccountId::new(),
                    display_name: "Owner".to_string(),
                    role: MemberRole::Owner,
                },
                content: "hi".to_string(),
                parent_id: None,
            })
            .await
            .unwrap();

        let received = tokio::time::timeout(KEEPALIVE, next_named(&mut stream, "message_received"))
            .await
            .unwrap()
            .unwrap();
        match received.event.kind {
            EventKind::MessageReceived(view) => assert_eq!(view.id, message.id),
            other => unreachable!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn test_event_payload_carries_discussion_id() {
        let discussion_id = DiscussionId::new();
        let event = DiscussionEvent {
            discussion_id,
            kind: EventKind::Keepalive,
        };
        assert_eq!(event.data()["discussionId"], json!(discussion_id));

        let message_id = MessageId::new();
        let deleted = DiscussionEvent {
            discussion_id,
            kind: EventKind::MessageDeleted { message_id },
        };
        assert_eq!(deleted.name(), "message_deleted");
        assert_eq!(deleted.data()["messageId"], json!(message_id));
    }
}
