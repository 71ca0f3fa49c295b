//! ConnectionManager: lifecycle of the persistent update channel.
//!
//! Owns opening the channel, reacting to open/error signals, scheduling
//! reconnect attempts with exponential backoff, degrading to polling once
//! the attempt ceiling is hit, and carrying the resumption cursor across
//! reconnects. All state mutation happens in single synchronous critical
//! sections; subscribers are notified synchronously after each transition.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::protocol::UpdateEvent;
use super::registry::{ObserverRegistry, SubscriberId};
use super::timer::{self, TimerHandle};

/// Connection status, one value current at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Live,
    Reconnecting,
    Offline,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Live => "live",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Tuning for the update channel. Defaults are the production values; tests
/// override them freely.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Base URL of the event stream, e.g. `http://host/api/events`.
    pub events_url: String,
    /// Window-scoped client identity, sent along so the server can label
    /// presence.
    pub client_id: String,
    /// First reconnect delay; doubles per attempt.
    pub base_delay: Duration,
    /// Reconnect attempts before degrading to polling.
    pub max_attempts: u32,
    /// Ceiling on a single backoff delay.
    pub max_delay: Duration,
}

impl ChannelConfig {
    pub fn new(events_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            events_url: events_url.into(),
            client_id: client_id.into(),
            base_delay: Duration::from_millis(1000),
            max_attempts: 4,
            max_delay: Duration::from_millis(30_000),
        }
    }
}

/// An open channel instance. The manager closes it on disconnect and before
/// replacing it.
pub trait ChannelHandle: Send {
    fn close(&mut self);
}

/// Opens channel instances. Production: SSE over HTTP. Tests: a scripted
/// fake that records URLs and delivers signals on demand.
pub trait ChannelTransport: Send + Sync {
    fn open(&self, url: &str, sink: ChannelSink) -> Box<dyn ChannelHandle>;
}

/// Signal path from a channel instance back into the manager. Each sink is
/// tagged with the instance it was created for; signals from a superseded
/// instance are ignored, so a stale channel can never mutate current state.
#[derive(Clone)]
pub struct ChannelSink {
    shared: Weak<ManagerShared>,
    instance: u64,
}

impl ChannelSink {
    /// The channel reached the server and is streaming.
    pub fn opened(&self) {
        if let Some(shared) = self.shared.upgrade() {
            ManagerShared::channel_opened(&shared, self.instance);
        }
    }

    /// The channel failed, before or after opening.
    pub fn failed(&self) {
        if let Some(shared) = self.shared.upgrade() {
            ManagerShared::channel_failed(&shared, self.instance);
        }
    }

    /// An event arrived on the channel.
    pub fn event(&self, event: UpdateEvent) {
        if let Some(shared) = self.shared.upgrade() {
            ManagerShared::channel_event(&shared, self.instance, event);
        }
    }
}

struct ChannelState {
    status: ConnectionStatus,
    attempt_count: u32,
    last_cursor: Option<String>,
    polling_enabled: bool,
    /// Monotonic id of the current channel instance; bumped on every open
    /// and on disconnect so in-flight signals from older instances miss.
    instance: u64,
    channel: Option<Box<dyn ChannelHandle>>,
    reconnect_timer: Option<TimerHandle>,
}

impl ChannelState {
    fn initial() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            attempt_count: 0,
            last_cursor: None,
            polling_enabled: false,
            instance: 0,
            channel: None,
            reconnect_timer: None,
        }
    }
}

struct ManagerShared {
    config: ChannelConfig,
    transport: Arc<dyn ChannelTransport>,
    state: Mutex<ChannelState>,
    status_observers: ObserverRegistry<ConnectionStatus>,
    event_observers: ObserverRegistry<UpdateEvent>,
}

/// Manages the persistent update channel for one client session.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
}

impl ConnectionManager {
    pub fn new(config: ChannelConfig, transport: Arc<dyn ChannelTransport>) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                config,
                transport,
                state: Mutex::new(ChannelState::initial()),
                status_observers: ObserverRegistry::new(),
                event_observers: ObserverRegistry::new(),
            }),
        }
    }

    /// Open the channel. No-op unless the manager is idle; recovering from
    /// `Offline` requires `disconnect()` first.
    pub fn connect(&self) {
        {
            let mut state = self.shared.lock_state();
            if state.status != ConnectionStatus::Idle {
                debug!(status = %state.status, "connect ignored, channel not idle");
                return;
            }
            state.status = ConnectionStatus::Connecting;
        }
        info!("opening update channel");
        self.shared.status_observers.notify(&ConnectionStatus::Connecting);
        ManagerShared::open_instance(&self.shared);
    }

    /// Tear the channel down: cancel any pending reconnect, close the active
    /// instance, return to `Idle`, and forget the session's cursor.
    /// Idempotent.
    pub fn disconnect(&self) {
        let closed = {
            let mut state = self.shared.lock_state();
            if state.status == ConnectionStatus::Idle {
                return;
            }
            if let Some(pending) = state.reconnect_timer.take() {
                pending.cancel();
            }
            state.instance += 1;
            state.status = ConnectionStatus::Idle;
            state.attempt_count = 0;
            state.last_cursor = None;
            state.polling_enabled = false;
            state.channel.take()
        };
        if let Some(mut channel) = closed {
            channel.close();
        }
        info!("update channel disconnected");
        self.shared.status_observers.notify(&ConnectionStatus::Idle);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.lock_state().status
    }

    /// True once the attempt ceiling was exhausted and the client should
    /// poll for updates instead.
    pub fn polling_enabled(&self) -> bool {
        self.shared.lock_state().polling_enabled
    }

    /// The most recent resumption cursor seen on the channel, if any.
    pub fn last_cursor(&self) -> Option<String> {
        self.shared.lock_state().last_cursor.clone()
    }

    /// Subscribe to status transitions. Notifications are synchronous, in
    /// subscription order.
    pub fn subscribe_status(
        &self,
        callback: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> SubscriberId {
        self.shared.status_observers.subscribe(callback)
    }

    pub fn unsubscribe_status(&self, id: SubscriberId) {
        self.shared.status_observers.unsubscribe(id);
    }

    /// Subscribe to incoming update events.
    pub fn subscribe_events(
        &self,
        callback: impl Fn(&UpdateEvent) + Send + Sync + 'static,
    ) -> SubscriberId {
        self.shared.event_observers.subscribe(callback)
    }

    pub fn unsubscribe_events(&self, id: SubscriberId) {
        self.shared.event_observers.unsubscribe(id);
    }

    /// Return to the initial state. Pending timers are cancelled and the
    /// active channel closed before the reset; subscriptions survive.
    pub fn reset_for_tests(&self) {
        let closed = {
            let mut state = self.shared.lock_state();
            if let Some(pending) = state.reconnect_timer.take() {
                pending.cancel();
            }
            let channel = state.channel.take();
            let instance = state.instance;
            *state = ChannelState::initial();
            state.instance = instance + 1;
            channel
        };
        if let Some(mut channel) = closed {
            channel.close();
        }
    }
}

impl ManagerShared {
    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the open URL: client id always, resumption cursor when one has
    /// been seen.
    fn open_url(&self, state: &ChannelState) -> String {
        let separator = if self.config.events_url.contains('?') {
            '&'
        } else {
            '?'
        };
        let mut url = format!(
            "{}{}client_id={}",
            self.config.events_url, separator, self.config.client_id
        );
        if let Some(cursor) = &state.last_cursor {
            url.push_str("&last_event_id=");
            url.push_str(cursor);
        }
        url
    }

    /// Open a fresh channel instance for the current connect session. The
    /// transport is invoked outside the state lock; the instance tag keeps
    /// late signals and a concurrent disconnect consistent.
    fn open_instance(shared: &Arc<Self>) {
        let (url, instance) = {
            let mut state = shared.lock_state();
            state.instance += 1;
            (shared.open_url(&state), state.instance)
        };
        let sink = ChannelSink {
            shared: Arc::downgrade(shared),
            instance,
        };
        let handle = shared.transport.open(&url, sink);
        let mut state = shared.lock_state();
        if state.instance == instance {
            if let Some(mut old) = state.channel.replace(handle) {
                drop(state);
                old.close();
            }
        } else {
            // Superseded while opening (disconnect raced the open).
            drop(state);
            let mut handle = handle;
            handle.close();
        }
    }

    fn channel_opened(shared: &Arc<Self>, instance: u64) {
        {
            let mut state = shared.lock_state();
            if state.instance != instance {
                return;
            }
            state.status = ConnectionStatus::Live;
            state.attempt_count = 0;
        }
        info!("update channel live");
        shared.status_observers.notify(&ConnectionStatus::Live);
    }

    fn channel_failed(shared: &Arc<Self>, instance: u64) {
        let status = {
            let mut state = shared.lock_state();
            if state.instance != instance {
                return;
            }
            state.channel = None;
            if state.attempt_count < shared.config.max_attempts {
                state.attempt_count += 1;
                state.status = ConnectionStatus::Reconnecting;
                let delay = backoff_delay(
                    shared.config.base_delay,
                    shared.config.max_delay,
                    state.attempt_count,
                );
                warn!(
                    attempt = state.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    "update channel error, scheduling reconnect"
                );
                let weak = Arc::downgrade(shared);
                state.reconnect_timer = Some(timer::schedule_once(delay, move || {
                    if let Some(shared) = weak.upgrade() {
                        ManagerShared::reopen(&shared);
                    }
                }));
            } else {
                state.status = ConnectionStatus::Offline;
                state.polling_enabled = true;
                warn!(
                    attempts = state.attempt_count,
                    "reconnect attempts exhausted, degrading to polling"
                );
            }
            state.status
        };
        shared.status_observers.notify(&status);
    }

    /// Reconnect timer fired: open the next instance, resuming from the most
    /// recent cursor. A disconnect since scheduling leaves status != Reconnecting
    /// and the firing is dropped.
    fn reopen(shared: &Arc<Self>) {
        {
            let mut state = shared.lock_state();
            if state.status != ConnectionStatus::Reconnecting {
                return;
            }
            state.reconnect_timer = None;
        }
        Self::open_instance(shared);
    }

    fn channel_event(shared: &Arc<Self>, instance: u64, event: UpdateEvent) {
        {
            let mut state = shared.lock_state();
            if state.instance != instance {
                return;
            }
            // Cursor advances on every event that carries one, regardless of
            // status, so the next reconnect resumes from the latest point.
            if let Some(cursor) = &event.cursor {
                state.last_cursor = Some(cursor.clone());
            }
        }
        shared.event_observers.notify(&event);
    }
}

fn backoff_delay(base: Duration, ceiling: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << shift);
    delay.min(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::protocol::UpdatePayload;
    use std::sync::Mutex as StdMutex;

    /// Scripted transport: records every open URL, hands out sinks for the
    /// test to fire signals through, and counts closes.
    #[derive(Default)]
    struct ScriptedTransport {
        opens: StdMutex<Vec<String>>,
        sinks: StdMutex<Vec<ChannelSink>>,
        closes: StdMutex<usize>,
    }

    struct ScriptedHandle {
        transport: Arc<ScriptedTransport>,
    }

    impl ChannelHandle for ScriptedHandle {
        fn close(&mut self) {
            *self.transport.closes.lock().unwrap() += 1;
        }
    }

    // ChannelTransport::open has no access to the owning Arc; tests wrap the
    // transport so handles can report closes back to it.
    struct ArcTransport(Arc<ScriptedTransport>);

    impl ChannelTransport for ArcTransport {
        fn open(&self, url: &str, sink: ChannelSink) -> Box<dyn ChannelHandle> {
            self.0.opens.lock().unwrap().push(url.to_string());
            self.0.sinks.lock().unwrap().push(sink);
            Box::new(ScriptedHandle {
                transport: self.0.clone(),
            })
        }
    }

    impl ScriptedTransport {
        fn sink(&self, index: usize) -> ChannelSink {
            self.sinks.lock().unwrap()[index].clone()
        }

        fn open_count(&self) -> usize {
            self.opens.lock().unwrap().len()
        }

        fn open_url(&self, index: usize) -> String {
            self.opens.lock().unwrap()[index].clone()
        }
    }

    fn manager_with_transport() -> (ConnectionManager, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::default());
        let config = ChannelConfig::new("http://gallery.test/api/events", "tab-1");
        let manager = ConnectionManager::new(config, Arc::new(ArcTransport(transport.clone())));
        (manager, transport)
    }

    fn presence_event(cursor: &str) -> UpdateEvent {
        UpdateEvent::from_wire(
            "presence",
            Some(cursor.to_string()),
            r#"{"gallery_id":"g1","viewing":[],"editing":[]}"#,
        )
        .unwrap()
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sequence_then_offline() {
        let (manager, transport) = manager_with_transport();
        let statuses = Arc::new(StdMutex::new(Vec::new()));
        let seen = statuses.clone();
        manager.subscribe_status(move |status| seen.lock().unwrap().push(*status));

        manager.connect();
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        transport.sink(0).opened();
        assert_eq!(manager.status(), ConnectionStatus::Live);

        // Four consecutive failures with the 1s/2s/4s/8s delays.
        for (attempt, delay_secs) in [(1u64, 1u64), (2, 2), (3, 4), (4, 8)] {
            transport.sink(attempt as usize - 1).failed();
            assert_eq!(manager.status(), ConnectionStatus::Reconnecting);
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            settle().await;
            assert_eq!(transport.open_count(), attempt as usize + 1);
        }

        // Fifth failure exhausts the ceiling.
        transport.sink(4).failed();
        assert_eq!(manager.status(), ConnectionStatus::Offline);
        assert!(manager.polling_enabled());
        assert_eq!(transport.open_count(), 5);

        let seen = statuses.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Live,
                ConnectionStatus::Reconnecting,
                ConnectionStatus::Reconnecting,
                ConnectionStatus::Reconnecting,
                ConnectionStatus::Reconnecting,
                ConnectionStatus::Offline,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resumes_from_latest_cursor() {
        let (manager, transport) = manager_with_transport();
        manager.connect();
        transport.sink(0).opened();
        assert!(!transport.open_url(0).contains("last_event_id"));

        transport.sink(0).event(presence_event("41"));
        transport.sink(0).event(presence_event("42"));
        assert_eq!(manager.last_cursor().as_deref(), Some("42"));

        transport.sink(0).failed();
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(transport.open_count(), 2);
        assert!(transport.open_url(1).contains("last_event_id=42"));
        assert!(transport.open_url(1).contains("client_id=tab-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resets_attempts() {
        let (manager, transport) = manager_with_transport();
        manager.connect();
        transport.sink(0).opened();

        transport.sink(0).failed();
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        transport.sink(1).opened();
        assert_eq!(manager.status(), ConnectionStatus::Live);

        // Attempt count was reset, so the next failure starts over at 1s.
        transport.sink(1).failed();
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(transport.open_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect_and_clears_state() {
        let (manager, transport) = manager_with_transport();
        manager.connect();
        transport.sink(0).opened();
        transport.sink(0).event(presence_event("9"));
        transport.sink(0).failed();
        assert_eq!(manager.status(), ConnectionStatus::Reconnecting);

        manager.disconnect();
        assert_eq!(manager.status(), ConnectionStatus::Idle);
        assert_eq!(manager.last_cursor(), None);
        assert!(!manager.polling_enabled());

        // The scheduled reconnect must never fire into the closed channel.
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(manager.status(), ConnectionStatus::Idle);

        // Idempotent.
        manager.disconnect();
        assert_eq!(manager.status(), ConnectionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_active_channel() {
        let (manager, transport) = manager_with_transport();
        manager.connect();
        transport.sink(0).opened();
        manager.disconnect();
        assert_eq!(*transport.closes.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_noop_unless_idle() {
        let (manager, transport) = manager_with_transport();
        manager.connect();
        manager.connect();
        assert_eq!(transport.open_count(), 1);

        transport.sink(0).opened();
        manager.connect();
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_channel_signals_are_ignored() {
        let (manager, transport) = manager_with_transport();
        manager.connect();
        let first = transport.sink(0);
        first.opened();
        first.failed();
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        transport.sink(1).opened();
        assert_eq!(manager.status(), ConnectionStatus::Live);

        // The dead first instance reports another error: no transition.
        first.failed();
        assert_eq!(manager.status(), ConnectionStatus::Live);
        // And its events no longer advance the cursor.
        first.event(presence_event("99"));
        assert_eq!(manager.last_cursor(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn events_notify_subscribers_and_update_cursor_in_any_status() {
        let (manager, transport) = manager_with_transport();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let seen = received.clone();
        manager.subscribe_events(move |event| {
            if let UpdatePayload::Presence(p) = &event.payload {
                seen.lock().unwrap().push(p.gallery_id.clone());
            }
        });

        manager.connect();
        // Event before the open signal (still Connecting): cursor advances.
        transport.sink(0).event(presence_event("5"));
        assert_eq!(manager.last_cursor().as_deref(), Some("5"));
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_for_tests_returns_to_initial_state() {
        let (manager, transport) = manager_with_transport();
        manager.connect();
        transport.sink(0).opened();
        transport.sink(0).event(presence_event("3"));
        transport.sink(0).failed();

        manager.reset_for_tests();
        assert_eq!(manager.status(), ConnectionStatus::Idle);
        assert_eq!(manager.last_cursor(), None);
        assert!(!manager.polling_enabled());

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(transport.open_count(), 1);
    }
}
