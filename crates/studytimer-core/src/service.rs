//! Async driver around the engine, the recorder and the tracker.
//!
//! All state lives behind one mutex and every operation runs to completion
//! while holding it, so a tick, a pause and a sync never interleave
//! mid-mutation. Store writes and periodic snapshots leave the lock as
//! values and are applied in order by a single writer task on the blocking
//! pool, off the tick path. Events are broadcast after the lock is released.
//!
//! Must be created inside a Tokio runtime.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::StoreError;
use crate::events::Event;
use crate::persistence::{PendingSnapshot, Snapshots};
use crate::recorder::SessionRecorder;
use crate::store::{RemoteStore, StoreWrite, TrackingMode};
use crate::timer::{TimerEngine, TimerMode, TimerSettings, TimerView, DEFAULT_SAVE_INTERVAL_SECS};
use crate::tracking::{
    LiveSegment, Outbox, Recovery, SegmentSyncer, TopicSegmentTracker, TrackerState, WriteBatch,
    DEFAULT_SYNC_INTERVAL_SECS,
};

const DEFAULT_TICK_MS: u64 = 250;
const SYNC_POLL: StdDuration = StdDuration::from_secs(1);
const EVENT_CAPACITY: usize = 256;

/// Knobs for [`TimerService`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub user_id: String,
    pub save_interval: Duration,
    pub sync_interval: Duration,
    pub tick_interval: StdDuration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            user_id: "local".into(),
            save_interval: Duration::seconds(DEFAULT_SAVE_INTERVAL_SECS),
            sync_interval: Duration::seconds(DEFAULT_SYNC_INTERVAL_SECS),
            tick_interval: StdDuration::from_millis(DEFAULT_TICK_MS),
        }
    }
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user_id: config.tracking.user_id.clone(),
            save_interval: config.persistence.save_interval(),
            sync_interval: config.tracking.sync_interval(),
            ..Self::default()
        }
    }
}

struct Core {
    engine: TimerEngine,
    recorder: SessionRecorder,
    tracker: TopicSegmentTracker,
    syncer: SegmentSyncer,
}

impl Core {
    /// Writes the recorder and the tracker derive from engine events.
    fn route(&mut self, events: &[Event]) -> WriteBatch {
        let mut writes = Vec::new();
        for event in events {
            writes.extend(self.recorder.write_for(event));
            let tracked = self.tracker.on_timer_event(event);
            if tracked.iter().any(|w| matches!(w, StoreWrite::Segment(s) if s.is_open())) {
                self.syncer.restart(event.at());
            }
            writes.extend(tracked);
        }
        WriteBatch::new(writes)
    }
}

enum WriterMsg {
    Batch(WriteBatch),
    Snapshot(PendingSnapshot),
    Flush(oneshot::Sender<()>),
}

struct Shared {
    core: Mutex<Core>,
    clock: SharedClock,
    store: Arc<dyn RemoteStore>,
    events: broadcast::Sender<Event>,
    writer: mpsc::UnboundedSender<WriterMsg>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    tick_interval: StdDuration,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue writes for the writer task. Call while holding the core lock so
    /// the channel order matches the order the core produced them in.
    fn dispatch(&self, batch: WriteBatch) {
        if batch.is_empty() {
            return;
        }
        if self.writer.send(WriterMsg::Batch(batch)).is_err() {
            warn!("store writer is gone, dropping writes");
        }
    }

    fn publish(&self, events: Vec<Event>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    /// One tick of run `run_id`. Returns whether the run goes on.
    fn on_tick(&self, run_id: u64) -> bool {
        let (events, running) = {
            let mut core = self.core();
            if core.engine.run_id() != run_id || !core.engine.is_running() {
                return false;
            }
            let events = core.engine.tick();
            self.dispatch(core.route(&events));
            if let Some(snapshot) = core.engine.periodic_snapshot() {
                let _ = self.writer.send(WriterMsg::Snapshot(snapshot));
            }
            (events, core.engine.is_running())
        };

        self.publish(events);
        running
    }

    fn on_sync(&self) {
        let mut guard = self.core();
        let core = &mut *guard;
        if let Some(batch) = core.syncer.poll(&mut core.tracker, self.clock.now()) {
            self.dispatch(batch);
        }
    }

    fn abort_ticker(&self) {
        let handle = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

async fn run_writer(
    store: Arc<dyn RemoteStore>,
    outbox: Outbox,
    snapshots: Snapshots,
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Batch(batch) => {
                let store = store.clone();
                let outbox = outbox.clone();
                let result =
                    tokio::task::spawn_blocking(move || outbox.commit(store.as_ref(), batch)).await;
                match result {
                    Ok(0) => {}
                    Ok(failed) => debug!(failed, "store batch had failures"),
                    Err(e) => warn!("store write task failed: {e}"),
                }
            }
            WriterMsg::Snapshot(pending) => {
                let snapshots = snapshots.clone();
                let result =
                    tokio::task::spawn_blocking(move || snapshots.save_pending(&pending)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("periodic timer snapshot failed: {e}"),
                    Err(e) => warn!("snapshot task failed: {e}"),
                }
            }
            WriterMsg::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Shared handle to the running timer. Clones drive the same state.
#[derive(Clone)]
pub struct TimerService {
    shared: Arc<Shared>,
}

impl TimerService {
    pub fn new(
        settings: Arc<TimerSettings>,
        clock: SharedClock,
        snapshots: Snapshots,
        store: Arc<dyn RemoteStore>,
        options: ServiceOptions,
    ) -> Self {
        let outbox = Outbox::new();
        let engine = TimerEngine::new(settings, clock.clone(), snapshots.clone())
            .with_save_interval(options.save_interval);
        let core = Core {
            engine,
            recorder: SessionRecorder::new(options.user_id.clone(), clock.clone()),
            tracker: TopicSegmentTracker::new(options.user_id.clone(), clock.clone())
                .with_outbox(outbox.clone()),
            syncer: SegmentSyncer::new(options.sync_interval),
        };

        let (writer, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let writer_task = tokio::spawn(run_writer(store.clone(), outbox, snapshots, rx));

        let shared = Arc::new(Shared {
            core: Mutex::new(core),
            clock,
            store,
            events,
            writer,
            ticker: Mutex::new(None),
            background: Mutex::new(vec![writer_task]),
            tick_interval: options.tick_interval,
        });

        let sync_task = tokio::spawn(sync_loop(Arc::downgrade(&shared)));
        shared
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sync_task);

        Self { shared }
    }

    /// Restore the saved timer (always paused) and recover open tracking.
    pub fn startup(&self) -> Result<Recovery, StoreError> {
        let mut core = self.shared.core();
        let engine = &core.engine;
        let save_interval = engine.save_interval();
        let restored = TimerEngine::restore(
            engine.settings().clone(),
            self.shared.clock.clone(),
            engine.snapshots().clone(),
        )
        .with_save_interval(save_interval);
        core.engine = restored;
        core.tracker.set_work_running(false);
        let recovery = core.tracker.recover(self.shared.store.as_ref())?;
        let now = self.shared.clock.now();
        core.syncer.restart(now);
        info!(view = ?core.engine.view(), ?recovery, "timer service started");
        Ok(recovery)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    pub fn view(&self) -> TimerView {
        self.shared.core().engine.view()
    }

    pub fn mode(&self) -> TimerMode {
        self.shared.core().engine.mode()
    }

    pub fn current_session_index(&self) -> u32 {
        self.shared.core().engine.current_session_index()
    }

    pub fn tracker_state(&self) -> TrackerState {
        self.shared.core().tracker.state()
    }

    pub fn live_segment(&self) -> Option<LiveSegment> {
        self.shared.core().tracker.live_view()
    }

    pub fn outbox(&self) -> Outbox {
        self.shared.core().tracker.outbox().clone()
    }

    // ── Timer control ────────────────────────────────────────────────

    pub fn start(&self) -> bool {
        let (event, run_id) = {
            let mut core = self.shared.core();
            let Some(event) = core.engine.start() else {
                return false;
            };
            self.shared.dispatch(core.route(std::slice::from_ref(&event)));
            (event, core.engine.run_id())
        };
        self.spawn_ticker(run_id);
        self.shared.publish(vec![event]);
        true
    }

    pub fn pause(&self) -> bool {
        self.shared.abort_ticker();
        self.control(|engine| engine.pause())
    }

    pub fn reset(&self) {
        self.shared.abort_ticker();
        self.control(|engine| Some(engine.reset()));
    }

    pub fn change_mode(&self, mode: TimerMode) {
        self.shared.abort_ticker();
        self.control(|engine| Some(engine.change_mode(mode)));
    }

    /// Replace the settings. Deferred while an interval runs.
    pub fn update_settings(&self, settings: TimerSettings) {
        self.control(|engine| Some(engine.update_settings(settings)));
    }

    /// Recompute from the wall clock right now, e.g. when the display
    /// becomes visible again after being backgrounded.
    pub fn refresh(&self) -> TimerView {
        let run_id = self.shared.core().engine.run_id();
        self.shared.on_tick(run_id);
        self.view()
    }

    // ── Tracking control ─────────────────────────────────────────────

    pub fn start_tracking(&self, topic_id: &str, mode: TrackingMode) {
        self.track(|tracker| tracker.start_timer(topic_id, mode));
    }

    pub fn switch_topic(&self, topic_id: &str) {
        self.track(|tracker| tracker.switch_topic(topic_id));
    }

    pub fn pause_tracking(&self) {
        self.track(TopicSegmentTracker::pause_timer);
    }

    pub fn resume_tracking(&self) {
        self.track(TopicSegmentTracker::resume_timer);
    }

    pub fn stop_tracking(&self) {
        self.track(TopicSegmentTracker::stop_timer);
    }

    pub fn topic_total_seconds(&self, topic_id: &str) -> Result<u64, StoreError> {
        self.shared
            .core()
            .tracker
            .topic_total_seconds(self.shared.store.as_ref(), topic_id)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Wait until every write queued so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.shared.writer.send(WriterMsg::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Pause, save synchronously, close the open segment and drain writes.
    pub async fn shutdown(&self) {
        self.shared.abort_ticker();
        let events = {
            let mut core = self.shared.core();
            let events: Vec<Event> = core.engine.pause().into_iter().collect();
            core.engine.save_for_shutdown();
            let mut batch = core.route(&events);
            batch.writes.extend(core.tracker.pause_timer());
            batch.retry_pending = true;
            self.shared.dispatch(batch);
            events
        };
        self.shared.publish(events);
        self.flush().await;

        let tasks = std::mem::take(
            &mut *self
                .shared
                .background
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
        info!("timer service stopped");
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn control<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut TimerEngine) -> Option<Event>,
    {
        let event = {
            let mut core = self.shared.core();
            let Some(event) = f(&mut core.engine) else {
                return false;
            };
            self.shared.dispatch(core.route(std::slice::from_ref(&event)));
            event
        };
        self.shared.publish(vec![event]);
        true
    }

    fn track<F>(&self, f: F)
    where
        F: FnOnce(&mut TopicSegmentTracker) -> Vec<StoreWrite>,
    {
        let mut guard = self.shared.core();
        let core = &mut *guard;
        let writes = f(&mut core.tracker);
        if core.tracker.open_segment().is_some() {
            core.syncer.restart(self.shared.clock.now());
        }
        self.shared.dispatch(WriteBatch::new(writes));
    }

    fn spawn_ticker(&self, run_id: u64) {
        let weak = Arc::downgrade(&self.shared);
        let period = self.shared.tick_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if !shared.on_tick(run_id) {
                    debug!(run_id, "tick task finished");
                    break;
                }
            }
        });

        let previous = self
            .shared
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

async fn sync_loop(shared: Weak<Shared>) {
    let mut interval = tokio::time::interval(SYNC_POLL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.on_sync();
    }
}
