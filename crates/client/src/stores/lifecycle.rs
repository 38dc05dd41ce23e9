//! Session lifecycle tracking: lock flag, completion countdown, archival.
//!
//! The archival deadline is kept as an absolute timestamp. The countdown and
//! the "archival imminent" warning are recomputed from a [`Clock`] on every
//! wake-up, so a process that was suspended catches up as soon as it runs
//! again instead of losing the warning.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tableside_shared::{
    ApiError, EventKind, SessionArchived, SessionCompleted, SessionEvent, SessionStatus,
    TableReleased,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::api_client::ApiClient;
use crate::config::LifecycleOptions;
use crate::ws::{SessionHandle, Subscription};

/// Source of wall-clock time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = add(*now, by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| at.checked_add_signed(by))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn sub(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| at.checked_sub_signed(by))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecyclePhase {
    #[default]
    Active,
    Completed,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CountdownState {
    /// Time left until archival; `None` before completion.
    pub remaining: Option<Duration>,
    pub is_completed: bool,
    pub is_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LifecycleState {
    pub phase: LifecyclePhase,
    pub locked: bool,
    /// Absolute archival deadline, once completed.
    pub deadline: Option<DateTime<Utc>>,
    pub countdown: CountdownState,
    /// The archival-imminent warning is still due.
    pub warning_pending: bool,
    /// Latest server message (completion or archival).
    pub message: Option<String>,
}

/// What the caller should do once the session is archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveAction {
    /// Navigate away automatically.
    Redirect,
    /// Offer a manual "return to home" control.
    ReturnHome,
}

/// Lifecycle transitions worth telling the person at the table about.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleNotice {
    Locked {
        by: Option<String>,
    },
    Unlocked {
        by: Option<String>,
    },
    Completed {
        deadline: DateTime<Utc>,
        message: Option<String>,
    },
    ArchivalImminent {
        remaining: Duration,
    },
    Archived {
        action: ArchiveAction,
        message: Option<String>,
        reason: Option<String>,
    },
    TableReleased(TableReleased),
}

struct Tracker {
    session_id: String,
    clock: Arc<dyn Clock>,
    options: LifecycleOptions,
    state: watch::Sender<LifecycleState>,
    notices: mpsc::UnboundedSender<LifecycleNotice>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Tracker {
    /// Apply `f` to the state and deliver whatever notices it produced.
    fn update(&self, f: impl FnOnce(&mut LifecycleState, &mut Vec<LifecycleNotice>)) {
        let mut notices = Vec::new();
        self.state.send_if_modified(|state| {
            let before = state.clone();
            f(state, &mut notices);
            *state != before
        });
        for notice in notices {
            // The receiver may be gone; the state channel is still updated.
            let _ = self.notices.send(notice);
        }
    }

    fn on_event(self: &Arc<Self>, event: &SessionEvent) {
        match event {
            SessionEvent::SessionLocked(change) => self.set_locked(true, change.actor.clone()),
            SessionEvent::SessionUnlocked(change) => self.set_locked(false, change.actor.clone()),
            SessionEvent::SessionCompleted(completed) => self.on_completed(completed),
            SessionEvent::SessionArchived(archived) => self.on_archived(archived),
            SessionEvent::TableReleased(released) => {
                crate::log_info!(session = self.session_id, "table {} released", released.table_number);
                let _ = self
                    .notices
                    .send(LifecycleNotice::TableReleased(released.clone()));
            }
            SessionEvent::SessionState(state) => {
                self.fold_status(state.session.status, state.session.archive_deadline)
            }
            SessionEvent::SessionUpdate(patch) => {
                if let Some(status) = patch.status {
                    self.fold_status(status, patch.archive_deadline);
                }
            }
            _ => {}
        }
    }

    fn set_locked(&self, locked: bool, by: Option<String>) {
        self.update(|state, notices| {
            // Locking applies to active sessions only.
            if state.phase != LifecyclePhase::Active || state.locked == locked {
                return;
            }
            state.locked = locked;
            notices.push(if locked {
                LifecycleNotice::Locked { by }
            } else {
                LifecycleNotice::Unlocked { by }
            });
        });
    }

    /// Bring a status from a full or partial session payload into the machine.
    fn fold_status(self: &Arc<Self>, status: SessionStatus, deadline: Option<DateTime<Utc>>) {
        match status {
            SessionStatus::Active => self.set_locked(false, None),
            SessionStatus::Locked => self.set_locked(true, None),
            SessionStatus::Completed => {
                let deadline = deadline.unwrap_or_else(|| {
                    add(
                        self.clock.now(),
                        Duration::from_millis(SessionCompleted::default().archive_delay_ms()),
                    )
                });
                self.enter_completed(deadline, None);
            }
            SessionStatus::Archived => self.enter_archived(None, None, None),
            SessionStatus::Unknown => {}
        }
    }

    fn on_completed(self: &Arc<Self>, completed: &SessionCompleted) {
        let delay = Duration::from_millis(completed.archive_delay_ms());
        let deadline = add(self.clock.now(), delay);
        self.enter_completed(deadline, completed.message.clone());
    }

    fn enter_completed(self: &Arc<Self>, deadline: DateTime<Utc>, message: Option<String>) {
        let now = self.clock.now();
        let mut entered = false;
        self.update(|state, notices| {
            if state.phase != LifecyclePhase::Active {
                return;
            }
            let remaining = until(now, deadline);
            state.phase = LifecyclePhase::Completed;
            state.deadline = Some(deadline);
            state.message = message.clone();
            state.countdown = CountdownState {
                remaining: Some(remaining),
                is_completed: true,
                is_archived: false,
            };
            state.warning_pending = remaining > self.options.warning_lead;
            notices.push(LifecycleNotice::Completed { deadline, message });
            entered = true;
        });

        if entered {
            crate::log_info!(session = self.session_id, "session completed, archival at {}", deadline);
            self.start_ticker();
        } else {
            crate::log_debug!(session = self.session_id, "ignoring repeated completion");
        }
    }

    fn on_archived(&self, archived: &SessionArchived) {
        self.enter_archived(
            archived.redirect_suggested,
            archived.message.clone(),
            archived.reason.clone(),
        );
    }

    fn enter_archived(
        &self,
        redirect_suggested: Option<bool>,
        message: Option<String>,
        reason: Option<String>,
    ) {
        let action = if self.options.auto_redirect && redirect_suggested.unwrap_or(true) {
            ArchiveAction::Redirect
        } else {
            ArchiveAction::ReturnHome
        };

        let mut entered = false;
        self.update(|state, notices| {
            if state.phase == LifecyclePhase::Archived {
                return;
            }
            state.phase = LifecyclePhase::Archived;
            state.warning_pending = false;
            state.countdown.remaining = Some(Duration::ZERO);
            state.countdown.is_archived = true;
            if message.is_some() {
                state.message = message.clone();
            }
            notices.push(LifecycleNotice::Archived {
                action,
                message,
                reason,
            });
            entered = true;
        });

        if entered {
            self.stop_ticker();
            crate::log_info!(session = self.session_id, "session archived ({:?})", action);
        } else {
            crate::log_debug!(session = self.session_id, "ignoring duplicate archival");
        }
    }

    /// Recompute the countdown from the clock. Returns how long to sleep
    /// before the next check, or `None` once there is nothing left to track.
    fn tick(&self) -> Option<Duration> {
        let now = self.clock.now();
        let mut next = None;
        let mut fired = None;
        let lead = self.options.warning_lead;
        let tick = self.options.tick;

        self.update(|state, notices| {
            let (LifecyclePhase::Completed, Some(deadline)) = (state.phase, state.deadline) else {
                return;
            };
            let remaining = until(now, deadline);
            let shown = state
                .countdown
                .remaining
                .map_or(remaining, |previous| previous.min(remaining));
            state.countdown.remaining = Some(shown);

            let warn_at = sub(deadline, lead);
            if state.warning_pending && now >= warn_at {
                state.warning_pending = false;
                notices.push(LifecycleNotice::ArchivalImminent { remaining });
                fired = Some(remaining);
            }

            if !remaining.is_zero() {
                next = Some(if state.warning_pending {
                    tick.min(until(now, warn_at))
                } else {
                    tick
                });
            }
        });

        if let Some(remaining) = fired {
            crate::log_info!(
                session = self.session_id,
                "archival in {}s",
                remaining.as_secs()
            );
        }
        next
    }

    fn start_ticker(self: &Arc<Self>) {
        let tracker: Weak<Self> = Arc::downgrade(self);
        let first = self.options.tick;
        let task = tokio::spawn(async move {
            let mut wait = first;
            loop {
                tokio::time::sleep(wait).await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                match tracker.tick() {
                    Some(next) => wait = next,
                    None => break,
                }
            }
        });
        let previous = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_ticker(&self) {
        let task = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Follows one session through active, completed and archived.
pub struct SessionLifecycle {
    tracker: Arc<Tracker>,
    api: ApiClient,
    _subscription: Subscription,
    _handle: SessionHandle,
}

impl SessionLifecycle {
    /// Start tracking. Notices arrive on the returned receiver, in the order
    /// the underlying events were delivered.
    pub fn attach(
        handle: SessionHandle,
        api: ApiClient,
        clock: Arc<dyn Clock>,
        options: LifecycleOptions,
    ) -> (Self, mpsc::UnboundedReceiver<LifecycleNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LifecycleState::default());
        let tracker = Arc::new(Tracker {
            session_id: handle.session_id().to_string(),
            clock,
            options,
            state,
            notices,
            ticker: Mutex::new(None),
        });

        let on_event = tracker.clone();
        let subscription = handle.on_any(move |event| {
            if is_lifecycle_event(event.kind()) {
                on_event.on_event(event);
            }
        });

        let lifecycle = Self {
            tracker,
            api,
            _subscription: subscription,
            _handle: handle,
        };
        (lifecycle, rx)
    }

    pub fn session_id(&self) -> &str {
        &self.tracker.session_id
    }

    pub fn state(&self) -> LifecycleState {
        self.tracker.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tracker.state.subscribe()
    }

    pub fn countdown(&self) -> CountdownState {
        self.tracker.state.borrow().countdown
    }

    pub fn is_locked(&self) -> bool {
        self.tracker.state.borrow().locked
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.tracker.state.borrow().phase
    }

    /// Ask the server to lock the session. The flag changes when the
    /// `session_locked` event comes back.
    pub async fn request_lock(&self) -> Result<(), ApiError> {
        let result = self.api.lock_session(self.session_id()).await;
        if let Err(e) = &result {
            crate::log_warn!(session = self.session_id(), "lock request failed: {}", e);
        }
        result
    }

    pub async fn request_unlock(&self) -> Result<(), ApiError> {
        let result = self.api.unlock_session(self.session_id()).await;
        if let Err(e) = &result {
            crate::log_warn!(session = self.session_id(), "unlock request failed: {}", e);
        }
        result
    }
}

impl Drop for SessionLifecycle {
    fn drop(&mut self) {
        self.tracker.stop_ticker();
    }
}

fn is_lifecycle_event(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::SessionState
            | EventKind::SessionUpdate
            | EventKind::SessionLocked
            | EventKind::SessionUnlocked
            | EventKind::SessionCompleted
            | EventKind::SessionArchived
            | EventKind::TableReleased
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StaticCredentials;
    use crate::ws::mock::{MockConnector, MockPeer};
    use crate::ws::{ReconnectPolicy, SessionRegistry};
    use chrono::TimeZone;
    use tableside_shared::{LockChange, Session, SessionPatch, SessionState};
    use tokio::sync::mpsc::error::TryRecvError;
    use url::Url;

    struct Fixture {
        _registry: SessionRegistry,
        peer: MockPeer,
        clock: Arc<ManualClock>,
        lifecycle: SessionLifecycle,
        notices: mpsc::UnboundedReceiver<LifecycleNotice>,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 19, 30, 0).unwrap()
    }

    async fn fixture_with(options: LifecycleOptions) -> Fixture {
        let connector = Arc::new(MockConnector::new());
        let registry = SessionRegistry::new(
            Url::parse("ws://tables.test/ws").unwrap(),
            connector.clone(),
            Arc::new(StaticCredentials::anonymous()),
            ReconnectPolicy::default(),
        );
        let clock = Arc::new(ManualClock::new(start()));
        let (lifecycle, notices) =
            SessionLifecycle::attach(registry.acquire("s1"), ApiClient::new(), clock.clone(), options);
        let peer = connector.next_peer().await;
        Fixture {
            _registry: registry,
            peer,
            clock,
            lifecycle,
            notices,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(LifecycleOptions::default()).await
    }

    impl Fixture {
        /// Move wall-clock time forward, then let the ticker observe it.
        async fn pass(&self, by: Duration) {
            self.clock.advance(by);
            tokio::time::sleep(by + Duration::from_secs(1)).await;
        }

        fn drain(&mut self) -> Vec<LifecycleNotice> {
            let mut out = Vec::new();
            loop {
                match self.notices.try_recv() {
                    Ok(notice) => out.push(notice),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return out,
                }
            }
        }
    }

    fn completed(ms: Option<u64>) -> SessionEvent {
        SessionEvent::SessionCompleted(SessionCompleted {
            will_archive_in: ms,
            message: Some("Thanks for dining".to_string()),
        })
    }

    fn archived(redirect: Option<bool>) -> SessionEvent {
        SessionEvent::SessionArchived(SessionArchived {
            session_id: "s1".to_string(),
            message: None,
            reason: Some("timeout".to_string()),
            redirect_suggested: redirect,
        })
    }

    fn is_warning(notice: &LifecycleNotice) -> bool {
        matches!(notice, LifecycleNotice::ArchivalImminent { .. })
    }

    #[tokio::test(start_paused = true)]
    async fn lock_flag_toggles_while_active() {
        let mut f = fixture().await;
        f.peer.push(&SessionEvent::SessionLocked(LockChange {
            actor: Some("7".to_string()),
        }));
        assert_eq!(
            f.notices.recv().await,
            Some(LifecycleNotice::Locked {
                by: Some("7".to_string())
            })
        );
        assert!(f.lifecycle.is_locked());

        // Repeats are not transitions.
        f.peer.push(&SessionEvent::SessionLocked(LockChange::default()));
        f.peer.push(&SessionEvent::SessionUnlocked(LockChange::default()));
        assert_eq!(
            f.notices.recv().await,
            Some(LifecycleNotice::Unlocked { by: None })
        );
        assert!(!f.lifecycle.is_locked());
        assert_eq!(f.lifecycle.phase(), LifecyclePhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_changes_after_completion_are_ignored() {
        let mut f = fixture().await;
        f.peer.push(&completed(Some(600_000)));
        assert!(matches!(
            f.notices.recv().await,
            Some(LifecycleNotice::Completed { .. })
        ));

        f.peer.push(&SessionEvent::SessionLocked(LockChange::default()));
        f.peer.push(&SessionEvent::TableReleased(TableReleased {
            table_id: "12".to_string(),
            table_number: "4".to_string(),
            message: None,
        }));
        assert!(matches!(
            f.notices.recv().await,
            Some(LifecycleNotice::TableReleased(_))
        ));
        assert!(!f.lifecycle.is_locked());
        assert_eq!(f.lifecycle.phase(), LifecyclePhase::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn warning_fires_five_minutes_after_a_ten_minute_completion() {
        let mut f = fixture().await;
        f.peer.push(&completed(Some(600_000)));

        let deadline = start() + chrono::Duration::minutes(10);
        assert_eq!(
            f.notices.recv().await,
            Some(LifecycleNotice::Completed {
                deadline,
                message: Some("Thanks for dining".to_string())
            })
        );
        assert!(f.lifecycle.state().warning_pending);

        f.pass(Duration::from_secs(4 * 60 + 59)).await;
        assert!(f.drain().is_empty(), "too early for the warning");

        f.pass(Duration::from_secs(1)).await;
        assert_eq!(
            f.drain(),
            vec![LifecycleNotice::ArchivalImminent {
                remaining: Duration::from_secs(5 * 60)
            }]
        );

        f.pass(Duration::from_secs(2 * 60)).await;
        assert!(f.drain().is_empty(), "the warning fires once");
        assert_eq!(
            f.lifecycle.countdown().remaining,
            Some(Duration::from_secs(3 * 60))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn archival_before_the_warning_cancels_it() {
        let mut f = fixture().await;
        f.peer.push(&completed(Some(600_000)));
        f.notices.recv().await;

        f.pass(Duration::from_secs(60)).await;
        f.peer.push(&archived(None));
        assert!(matches!(
            f.notices.recv().await,
            Some(LifecycleNotice::Archived { .. })
        ));

        f.pass(Duration::from_secs(10 * 60)).await;
        assert!(!f.drain().iter().any(is_warning));
        let state = f.lifecycle.state();
        assert!(!state.warning_pending);
        assert!(state.countdown.is_archived);
        assert_eq!(state.countdown.remaining, Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn short_completion_schedules_no_warning() {
        let mut f = fixture().await;
        f.peer.push(&completed(Some(4 * 60 * 1000)));
        f.notices.recv().await;
        assert!(!f.lifecycle.state().warning_pending);

        f.pass(Duration::from_secs(5 * 60)).await;
        assert!(f.drain().is_empty());
        assert_eq!(f.lifecycle.countdown().remaining, Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_duration_defaults_to_thirty_minutes() {
        let mut f = fixture().await;
        f.peer.push(&completed(None));
        f.notices.recv().await;

        let state = f.lifecycle.state();
        assert_eq!(state.deadline, Some(start() + chrono::Duration::minutes(30)));
        assert_eq!(state.countdown.remaining, Some(Duration::from_secs(30 * 60)));
        assert!(state.countdown.is_completed);
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_process_still_gets_the_warning() {
        let mut f = fixture().await;
        f.peer.push(&completed(Some(600_000)));
        f.notices.recv().await;

        // Wall clock jumps eight minutes while the runtime barely moves.
        f.clock.advance(Duration::from_secs(8 * 60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            f.drain(),
            vec![LifecycleNotice::ArchivalImminent {
                remaining: Duration::from_secs(2 * 60)
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_never_goes_back_up() {
        let f = fixture().await;
        f.peer.push(&completed(Some(600_000)));
        let mut rx = f.lifecycle.subscribe();
        rx.wait_for(|s| s.countdown.is_completed).await.unwrap();

        f.pass(Duration::from_secs(120)).await;
        assert_eq!(
            f.lifecycle.countdown().remaining,
            Some(Duration::from_secs(8 * 60))
        );

        f.clock.set(start());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            f.lifecycle.countdown().remaining,
            Some(Duration::from_secs(8 * 60))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_archival_is_applied_once() {
        let mut f = fixture().await;
        for _ in 0..3 {
            f.peer.push(&archived(Some(true)));
        }
        f.peer.push(&SessionEvent::SessionLocked(LockChange::default()));
        f.peer.close_clean();

        let mut rx = f.lifecycle.subscribe();
        rx.wait_for(|s| s.phase == LifecyclePhase::Archived)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let notices = f.drain();
        assert_eq!(
            notices,
            vec![LifecycleNotice::Archived {
                action: ArchiveAction::Redirect,
                message: None,
                reason: Some("timeout".to_string()),
            }]
        );
        assert!(!f.lifecycle.is_locked(), "archived sessions do not lock");
    }

    #[tokio::test(start_paused = true)]
    async fn archive_action_follows_preference_and_server_hint() {
        let mut f = fixture().await;
        f.peer.push(&archived(Some(false)));
        assert!(matches!(
            f.notices.recv().await,
            Some(LifecycleNotice::Archived {
                action: ArchiveAction::ReturnHome,
                ..
            })
        ));

        let mut f = fixture_with(LifecycleOptions {
            auto_redirect: false,
            ..Default::default()
        })
        .await;
        f.peer.push(&archived(Some(true)));
        assert!(matches!(
            f.notices.recv().await,
            Some(LifecycleNotice::Archived {
                action: ArchiveAction::ReturnHome,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn session_state_and_updates_fold_into_the_machine() {
        let mut f = fixture().await;
        let deadline = start() + chrono::Duration::minutes(20);
        f.peer.push(&SessionEvent::SessionState(SessionState {
            session: Session {
                id: "s1".to_string(),
                status: SessionStatus::Completed,
                table: None,
                table_number: Some("4".to_string()),
                archive_deadline: Some(deadline),
                created_at: None,
            },
            participants: Vec::new(),
            orders: Vec::new(),
        }));
        assert_eq!(
            f.notices.recv().await,
            Some(LifecycleNotice::Completed {
                deadline,
                message: None
            })
        );

        f.peer.push(&SessionEvent::SessionUpdate(SessionPatch {
            status: Some(SessionStatus::Archived),
            ..Default::default()
        }));
        f.peer.push(&archived(None));
        assert!(matches!(
            f.notices.recv().await,
            Some(LifecycleNotice::Archived {
                action: ArchiveAction::Redirect,
                ..
            })
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn table_release_is_forwarded() {
        let mut f = fixture().await;
        f.peer.push(&SessionEvent::TableReleased(TableReleased {
            table_id: "12".to_string(),
            table_number: "4".to_string(),
            message: None,
        }));
        assert!(matches!(
            f.notices.recv().await,
            Some(LifecycleNotice::TableReleased(released)) if released.table_number == "4"
        ));
        assert_eq!(f.lifecycle.phase(), LifecyclePhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_tracker_stops_the_ticker() {
        let mut f = fixture().await;
        f.peer.push(&completed(Some(600_000)));
        f.notices.recv().await;

        let tracker = Arc::downgrade(&f.lifecycle.tracker);
        drop(f.lifecycle);
        assert!(tracker.upgrade().is_none());

        f.clock.advance(Duration::from_secs(10 * 60));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(f.notices.try_recv(), Err(TryRecvError::Disconnected)));
    }
}
