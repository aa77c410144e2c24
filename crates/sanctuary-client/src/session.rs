//! Room session: the lifecycle unit a view attaches to.
//!
//! Starting a session acquires the room's live connection first, so events
//! committed while the snapshot is being fetched queue up in the session's
//! bounded channel. The snapshot is then fetched and only afterwards does
//! the merge task start draining the queue. Inserts are idempotent, so an
//! event that the snapshot already covers is harmless.
//!
//! Resyncs run inside the merge task for the same reason: nothing is merged
//! while the snapshot is in flight, and whatever queued up meanwhile is
//! applied on top of it in commit order. A queue that overflowed is a gap,
//! answered with a resync.
//!
//! ```text
//!   Idle -> Fetching -> Live | Degraded | Failed -> Stopped
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sanctuary_backend::{ActorProvider, Backend, Direction, Query};
use sanctuary_realtime::{ChannelSignal, QueueSink};
use sanctuary_shared::constants::{COLUMN_CREATED_AT, PROFILE_EMBED_SELECT};
use sanctuary_shared::{
    ActorId, FetchError, Message, RoomEvent, RoomId, RoomSpec, SendError, Visibility,
};

use crate::error::{ServiceError, StartError};
use crate::merger::RoomLog;
use crate::registry::{RoomRegistry, SharedHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Fetching,
    /// Snapshot loaded and connection open.
    Live,
    /// The log may be missing messages: the snapshot failed, the transport
    /// dropped the subscription, or the event queue overflowed.
    Degraded,
    Failed,
    Stopped,
}

/// Collaborators and tunables a session is started with.
#[derive(Clone)]
pub struct SessionDeps {
    pub backend: Arc<dyn Backend>,
    pub actors: Arc<dyn ActorProvider>,
    pub registry: Arc<RoomRegistry>,
    pub snapshot_limit: usize,
    pub event_buffer: usize,
    pub resync_after_idle: Option<Duration>,
}

/// Requests from the session handle to its merge task.
enum Control {
    Resync(oneshot::Sender<Result<(), FetchError>>),
}

const CONTROL_BUFFER: usize = 4;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between the session handle and its merge task.
struct SessionCore {
    spec: RoomSpec,
    visibility: Visibility,
    backend: Arc<dyn Backend>,
    registry: Arc<RoomRegistry>,
    snapshot_limit: usize,
    log: Mutex<RoomLog>,
    state: Mutex<SessionState>,
    fetch_error: Mutex<Option<FetchError>>,
    /// Cleared by `stop()`; checked before every merge.
    active: AtomicBool,
    revision: watch::Sender<u64>,
}

impl SessionCore {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        let previous = *state;
        if previous != next && previous != SessionState::Stopped {
            info!(room = %self.spec.room_id, from = ?previous, to = ?next, "Session state changed");
            *state = next;
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    async fn fetch_snapshot(&self) -> Result<Vec<Message>, FetchError> {
        fetch_snapshot(
            self.backend.as_ref(),
            &self.spec,
            &self.visibility,
            self.snapshot_limit,
        )
        .await
    }

    fn merge(&self, event: RoomEvent) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }

        let mut log = lock(&self.log);
        let known_author = log
            .get(event.message_id())
            .and_then(|m| m.author_id.clone());
        let id = event.message_id().clone();
        let Some(event) = self.visibility.screen_event(event, known_author.as_ref()) else {
            debug!(room = %self.spec.room_id, id = %id, "Event hidden by visibility");
            return;
        };

        let changed = log.apply(event);
        drop(log);
        if changed {
            self.bump();
        }
    }

    fn on_interrupted(&self) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        warn!(room = %self.spec.room_id, "Live connection lost; updates may be stale");
        if self.state() == SessionState::Live {
            self.set_state(SessionState::Degraded);
        }
        self.bump();
    }

    /// Re-fetch the snapshot and re-baseline the log. Only the merge task
    /// calls this, so no event is merged while the fetch is in flight.
    async fn resync(&self) -> Result<(), FetchError> {
        let snapshot = match self.fetch_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(room = %self.spec.room_id, error = %e, "Resync failed");
                *lock(&self.fetch_error) = Some(e.clone());
                return Err(e);
            }
        };
        let live = self.registry.is_live(&self.spec.room_id).await;
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        lock(&self.log).rebase(snapshot);
        *lock(&self.fetch_error) = None;
        self.set_state(if live { SessionState::Live } else { SessionState::Degraded });
        self.bump();
        info!(room = %self.spec.room_id, "Session resynced");
        Ok(())
    }
}

/// Fetch the most recent `limit` visible messages, oldest first.
pub async fn fetch_snapshot(
    backend: &dyn Backend,
    spec: &RoomSpec,
    visibility: &Visibility,
    limit: usize,
) -> Result<Vec<Message>, FetchError> {
    let mut query = Query::new().select(PROFILE_EMBED_SELECT);
    for (column, value) in &spec.scope {
        query = query.eq(column, value.as_str());
    }
    let query = query
        .visible_to(visibility)
        .order_by(COLUMN_CREATED_AT, Direction::Descending)
        .limit(limit);

    let rows = backend.select(&spec.table, &query).await?;

    let mut messages = Vec::with_capacity(rows.len());
    for row in &rows {
        match spec.message_from_row(row) {
            Ok(message) => messages.push(message),
            Err(e) => warn!(room = %spec.room_id, error = %e, "Skipping malformed row"),
        }
    }
    messages.reverse();
    Ok(messages)
}

/// Insert a new row into `spec`'s room on behalf of the current actor.
///
/// Nothing is merged locally: the canonical insert arrives through the live
/// event path.
pub async fn post(
    backend: &dyn Backend,
    actors: &dyn ActorProvider,
    spec: &RoomSpec,
    body: &str,
    extra: Map<String, Value>,
) -> Result<Message, SendError> {
    let author = actors
        .current_actor()
        .await
        .ok_or(SendError::Unauthenticated)?;
    let body = body.trim();
    if body.is_empty() {
        return Err(SendError::EmptyBody);
    }

    let mut row = spec.new_row(&author, body);
    if let Value::Object(ref mut obj) = row {
        obj.extend(extra);
    }

    let committed = backend.insert(&spec.table, row).await.map_err(|e| {
        warn!(room = %spec.room_id, error = %e, "Send failed");
        SendError::from(e)
    })?;

    spec.message_from_row(&committed)
        .map_err(|e| SendError::Rejected(format!("Unreadable committed row: {e}")))
}

pub struct RoomSession {
    core: Arc<SessionCore>,
    actors: Arc<dyn ActorProvider>,
    handle: AsyncMutex<Option<SharedHandle>>,
    control: mpsc::Sender<Control>,
    merge_task: Mutex<Option<JoinHandle<()>>>,
}

impl RoomSession {
    /// Start a session on `spec`'s room.
    ///
    /// A snapshot failure with an open connection yields a `Degraded`
    /// session. A connection failure is an error whatever the snapshot did.
    pub async fn start(
        deps: SessionDeps,
        spec: RoomSpec,
        visibility: Visibility,
    ) -> Result<Self, StartError> {
        let (revision, _) = watch::channel(0u64);
        let core = Arc::new(SessionCore {
            spec: spec.clone(),
            visibility,
            backend: deps.backend.clone(),
            registry: deps.registry.clone(),
            snapshot_limit: deps.snapshot_limit,
            log: Mutex::new(RoomLog::new()),
            state: Mutex::new(SessionState::Idle),
            fetch_error: Mutex::new(None),
            active: AtomicBool::new(true),
            revision,
        });
        core.set_state(SessionState::Fetching);

        let (event_tx, event_rx) = mpsc::channel::<ChannelSignal>(deps.event_buffer.max(1));
        let sink = QueueSink::new(event_tx);
        let lagged = sink.lag_flag();
        let acquired = deps.registry.acquire(spec.clone(), Arc::new(sink)).await;
        let snapshot = core.fetch_snapshot().await;

        let handle = match (acquired, snapshot) {
            (Ok(handle), Ok(messages)) => {
                *lock(&core.log) = RoomLog::from_snapshot(messages);
                core.set_state(SessionState::Live);
                handle
            }
            (Ok(handle), Err(fetch)) => {
                warn!(room = %spec.room_id, error = %fetch, "Snapshot failed, starting degraded");
                *lock(&core.fetch_error) = Some(fetch);
                core.set_state(SessionState::Degraded);
                handle
            }
            (Err(connection), Ok(_)) => {
                core.set_state(SessionState::Failed);
                return Err(StartError::Connection(connection));
            }
            (Err(connection), Err(fetch)) => {
                core.set_state(SessionState::Failed);
                return Err(StartError::Failed { fetch, connection });
            }
        };
        core.bump();

        let (control, control_rx) = mpsc::channel(CONTROL_BUFFER);
        let merge_task = tokio::spawn(run_merge(
            core.clone(),
            MergeInputs {
                events: event_rx,
                control: control_rx,
                lagged,
                idle: deps.resync_after_idle,
            },
        ));

        Ok(Self {
            core,
            actors: deps.actors,
            handle: AsyncMutex::new(Some(handle)),
            control,
            merge_task: Mutex::new(Some(merge_task)),
        })
    }

    pub fn room_id(&self) -> &RoomId {
        &self.core.spec.room_id
    }

    pub fn spec(&self) -> &RoomSpec {
        &self.core.spec
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// The snapshot error behind a `Degraded` state, if any.
    pub fn fetch_error(&self) -> Option<FetchError> {
        lock(&self.core.fetch_error).clone()
    }

    /// The room's messages in display order, as merged so far.
    pub fn current_messages(&self) -> Vec<Message> {
        lock(&self.core.log).messages().to_vec()
    }

    /// Revision counter bumped after every change to the log or state.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.core.revision.subscribe()
    }

    pub async fn current_actor(&self) -> Option<ActorId> {
        self.actors.current_actor().await
    }

    pub async fn send(&self, body: &str) -> Result<Message, SendError> {
        self.send_with(body, Map::new()).await
    }

    /// Send with additional columns (e.g. `title`, `is_private`).
    pub async fn send_with(&self, body: &str, extra: Map<String, Value>) -> Result<Message, SendError> {
        if self.state() == SessionState::Stopped {
            return Err(SendError::Rejected("session is stopped".to_string()));
        }
        let message = post(
            self.core.backend.as_ref(),
            self.actors.as_ref(),
            &self.core.spec,
            body,
            extra,
        )
        .await?;
        debug!(room = %self.room_id(), id = %message.id, "Message sent");
        Ok(message)
    }

    /// Re-fetch the snapshot. If the transport had dropped the room's
    /// connection it is reopened first, and the session returns to `Live`.
    pub async fn resync(&self) -> Result<(), ServiceError> {
        if self.state() == SessionState::Stopped {
            return Ok(());
        }

        if let Some(handle) = self.handle.lock().await.as_ref() {
            self.core.registry.revive(handle).await?;
        }

        let (reply, result) = oneshot::channel();
        if self.control.send(Control::Resync(reply)).await.is_err() {
            return Ok(());
        }
        match result.await {
            Ok(result) => Ok(result?),
            // The merge task was aborted by stop().
            Err(_) => Ok(()),
        }
    }

    /// Tear down. Idempotent; no event is merged after this returns.
    pub async fn stop(&self) {
        if !self.core.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.core.set_state(SessionState::Stopped);

        if let Some(task) = lock(&self.merge_task).take() {
            task.abort();
        }
        if let Some(handle) = self.handle.lock().await.take() {
            self.core.registry.release(handle).await;
        }
        self.core.bump();
        info!(room = %self.room_id(), "Session stopped");
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        if !self.core.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = lock(&self.merge_task).take() {
            task.abort();
        }

        let handle = self.handle.get_mut().take();
        warn!(room = %self.core.spec.room_id, "Session dropped without stop");
        if let (Some(handle), Ok(runtime)) = (handle, tokio::runtime::Handle::try_current()) {
            let registry = self.core.registry.clone();
            runtime.spawn(async move { registry.release(handle).await });
        }
    }
}

struct MergeInputs {
    events: mpsc::Receiver<ChannelSignal>,
    control: mpsc::Receiver<Control>,
    lagged: Arc<AtomicBool>,
    idle: Option<Duration>,
}

/// Signals queued before a resync starts are covered by its snapshot.
/// Interruptions among them still count.
fn discard_queued(core: &SessionCore, events: &mut mpsc::Receiver<ChannelSignal>) {
    let mut discarded = 0usize;
    while let Ok(signal) = events.try_recv() {
        match signal {
            ChannelSignal::Event(_) => discarded += 1,
            ChannelSignal::Interrupted => core.on_interrupted(),
        }
    }
    if discarded > 0 {
        debug!(room = %core.spec.room_id, discarded, "Dropped events covered by resync");
    }
}

async fn resync_in_task(
    core: &SessionCore,
    events: &mut mpsc::Receiver<ChannelSignal>,
) -> Result<(), FetchError> {
    discard_queued(core, events);
    core.resync().await
}

async fn run_merge(core: Arc<SessionCore>, inputs: MergeInputs) {
    let MergeInputs {
        mut events,
        mut control,
        lagged,
        idle,
    } = inputs;

    loop {
        if lagged.swap(false, Ordering::SeqCst) {
            warn!(room = %core.spec.room_id, "Event queue overflowed, resyncing");
            if core.state() == SessionState::Live {
                core.set_state(SessionState::Degraded);
                core.bump();
            }
            let _ = resync_in_task(&core, &mut events).await;
            continue;
        }

        let idle_timer = async {
            match idle {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            command = control.recv() => match command {
                Some(Control::Resync(reply)) => {
                    let result = resync_in_task(&core, &mut events).await;
                    let _ = reply.send(result);
                }
                None => break,
            },
            next = events.recv() => match next {
                Some(ChannelSignal::Event(event)) => core.merge(event),
                Some(ChannelSignal::Interrupted) => core.on_interrupted(),
                None => break,
            },
            _ = idle_timer => {
                debug!(room = %core.spec.room_id, "Room idle, resyncing");
                let _ = resync_in_task(&core, &mut events).await;
            }
        }

        if !core.active.load(Ordering::SeqCst) {
            break;
        }
    }
    debug!(room = %core.spec.room_id, "Merge task finished");
}
