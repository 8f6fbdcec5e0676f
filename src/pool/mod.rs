//! Bounded pool of per-source browser sessions.
//!
//! Sessions are created lazily under a per-source and a global cap, each
//! session hands out up to `max_units_per_session` page units, and callers
//! that find no capacity wait in a per-source priority queue until a release
//! frees a unit or a session slot. All bookkeeping happens under one mutex
//! that is never held across browser I/O.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::browser::{BrowserSession, SessionFactory};
use crate::config::PoolConfig;
use crate::events::{CrawlEvent, EventBus};
use crate::models::generate_id;
use crate::utils::error::AppError;
use crate::Result;

pub mod session;

pub use session::{PoolStats, SessionLease, SourcePoolStats, SweepReport, WorkerSession};

/// What a waiter (or an immediate caller) has been granted.
#[derive(Debug)]
enum Grant {
    /// A unit on this session has been reserved for the caller.
    Unit(String),
    /// A session slot has been reserved; the caller creates the session.
    NewSession,
}

struct Waiter {
    ticket: u64,
    priority: i32,
    requires_auth: bool,
    tx: oneshot::Sender<Grant>,
}

struct SessionSlot {
    info: WorkerSession,
    handle: Arc<dyn BrowserSession>,
    seq: u64,
    last_used: Instant,
    authenticated: Option<Instant>,
}

#[derive(Default)]
struct PoolState {
    sessions: HashMap<String, SessionSlot>,
    waiters: HashMap<String, Vec<Waiter>>,
    /// Session slots reserved by callers that are still launching a browser.
    creating: HashMap<String, usize>,
    next_seq: u64,
    shut_down: bool,
}

impl PoolState {
    fn sessions_for(&self, source: &str) -> usize {
        let live = self.sessions.values().filter(|s| s.info.source == source).count();
        live + self.creating.get(source).copied().unwrap_or(0)
    }

    fn total_sessions(&self) -> usize {
        self.sessions.len() + self.creating.values().sum::<usize>()
    }

    fn can_create(&self, source: &str, config: &PoolConfig) -> bool {
        self.sessions_for(source) < config.max_sessions_per_source
            && self.total_sessions() < config.max_total_sessions
    }

    /// Pick the least loaded session with spare capacity and reserve a unit on it.
    fn reserve_unit(&mut self, source: &str, requires_auth: bool, max_units: usize) -> Option<String> {
        let slot = self
            .sessions
            .values_mut()
            .filter(|s| s.info.source == source && s.info.active_units < max_units)
            .min_by_key(|s| {
                let auth_rank = if requires_auth && !s.info.is_authenticated { 1 } else { 0 };
                (auth_rank, s.info.active_units, s.seq)
            })?;

        slot.info.active_units += 1;
        slot.info.last_used_at = Utc::now();
        slot.last_used = Instant::now();
        Some(slot.info.id.clone())
    }

    fn reserve_creation(&mut self, source: &str) {
        *self.creating.entry(source.to_string()).or_insert(0) += 1;
    }

    fn cancel_creation(&mut self, source: &str) {
        if let Some(count) = self.creating.get_mut(source) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.creating.remove(source);
            }
        }
    }

    fn return_unit(&mut self, session_id: &str) {
        if let Some(slot) = self.sessions.get_mut(session_id) {
            slot.info.active_units = slot.info.active_units.saturating_sub(1);
            slot.info.last_used_at = Utc::now();
            slot.last_used = Instant::now();
        }
    }

    fn undo(&mut self, source: &str, grant: Grant) {
        match grant {
            Grant::Unit(session_id) => self.return_unit(&session_id),
            Grant::NewSession => self.cancel_creation(source),
        }
    }

    /// Queue a waiter behind everyone of equal or higher priority.
    fn push_waiter(&mut self, source: &str, priority: i32, requires_auth: bool, tx: oneshot::Sender<Grant>) -> u64 {
        self.next_seq += 1;
        let ticket = self.next_seq;
        let queue = self.waiters.entry(source.to_string()).or_default();
        let position = queue
            .iter()
            .position(|w| w.priority < priority)
            .unwrap_or(queue.len());
        queue.insert(
            position,
            Waiter {
                ticket,
                priority,
                requires_auth,
                tx,
            },
        );
        ticket
    }

    fn remove_waiter(&mut self, source: &str, ticket: u64) -> bool {
        let Some(queue) = self.waiters.get_mut(source) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|w| w.ticket != ticket);
        let removed = queue.len() != before;
        if queue.is_empty() {
            self.waiters.remove(source);
        }
        removed
    }

    fn waiting(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }
}

pub struct ResourcePool {
    config: PoolConfig,
    factory: Arc<dyn SessionFactory>,
    events: EventBus,
    state: Mutex<PoolState>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl ResourcePool {
    pub fn new(config: PoolConfig, factory: Arc<dyn SessionFactory>, events: EventBus) -> Self {
        Self {
            config,
            factory,
            events,
            state: Mutex::new(PoolState::default()),
            maintenance: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a unit of a session for `source`.
    ///
    /// Reuses the least loaded session with spare units, creates a new session
    /// if the caps allow, or waits (highest `priority` first, FIFO within a
    /// priority) until capacity frees up. Waiting ends with
    /// [`AppError::AcquireTimeout`] after `timeout`, or with
    /// [`AppError::PoolShutdown`] if the pool shuts down first.
    pub async fn acquire(
        &self,
        source: &str,
        requires_auth: bool,
        priority: i32,
        timeout: Duration,
    ) -> Result<SessionLease> {
        let started = Instant::now();

        let grant = {
            let mut state = self.state.lock().await;
            if state.shut_down {
                return Err(AppError::PoolShutdown);
            }

            if let Some(session_id) = state.reserve_unit(source, requires_auth, self.config.max_units_per_session) {
                Some(Grant::Unit(session_id))
            } else if state.can_create(source, &self.config) {
                state.reserve_creation(source);
                Some(Grant::NewSession)
            } else {
                None
            }
        };

        let grant = match grant {
            Some(grant) => grant,
            None => self.wait_for_capacity(source, requires_auth, priority, timeout, started).await?,
        };

        self.fulfil(source, grant).await
    }

    async fn wait_for_capacity(
        &self,
        source: &str,
        requires_auth: bool,
        priority: i32,
        timeout: Duration,
        started: Instant,
    ) -> Result<Grant> {
        let (tx, mut rx) = oneshot::channel();
        let ticket = {
            let mut state = self.state.lock().await;
            if state.shut_down {
                return Err(AppError::PoolShutdown);
            }
            // capacity may have been freed while the lock was released
            if let Some(session_id) = state.reserve_unit(source, requires_auth, self.config.max_units_per_session) {
                return Ok(Grant::Unit(session_id));
            }
            if state.can_create(source, &self.config) {
                state.reserve_creation(source);
                return Ok(Grant::NewSession);
            }
            state.push_waiter(source, priority, requires_auth, tx)
        };

        debug!(source = %source, priority, ticket, "Waiting for session capacity");
        let remaining = timeout.saturating_sub(started.elapsed());

        match tokio::time::timeout(remaining, &mut rx).await {
            Ok(Ok(grant)) => Ok(grant),
            Ok(Err(_)) => Err(AppError::PoolShutdown),
            Err(_) => {
                let mut state = self.state.lock().await;
                if state.remove_waiter(source, ticket) {
                    warn!(source = %source, ticket, "Timed out waiting for session capacity");
                    return Err(AppError::AcquireTimeout {
                        source_id: source.to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                drop(state);
                // Granted (or cancelled by shutdown) between the timeout and the lock
                rx.await.map_err(|_| AppError::PoolShutdown)
            }
        }
    }

    /// Turn a reservation into a lease, creating the session if needed.
    async fn fulfil(&self, source: &str, grant: Grant) -> Result<SessionLease> {
        let session_id = match grant {
            Grant::Unit(session_id) => session_id,
            Grant::NewSession => self.create_session(source).await?,
        };

        let (handle, is_authenticated) = {
            let state = self.state.lock().await;
            match state.sessions.get(&session_id) {
                Some(slot) => (Arc::clone(&slot.handle), slot.info.is_authenticated),
                None => {
                    return Err(AppError::TransientFetch(format!(
                        "Session {} closed before a unit could be opened",
                        session_id
                    )));
                }
            }
        };

        match handle.open_unit().await {
            Ok(unit) => {
                metrics::gauge!("rentwatch_units_active").increment(1.0);
                Ok(SessionLease {
                    session_id,
                    source: source.to_string(),
                    is_authenticated,
                    unit,
                })
            }
            Err(e) => {
                warn!(source = %source, session_id = %session_id, error = %e, "Failed to open page unit");
                let closed = {
                    let mut state = self.state.lock().await;
                    state.return_unit(&session_id);
                    let closed = self.record_failure(&mut state, &session_id);
                    self.dispatch_waiters(&mut state);
                    closed
                };
                if let Some(slot) = closed {
                    self.close_slot(slot).await;
                }
                Err(e)
            }
        }
    }

    async fn create_session(&self, source: &str) -> Result<String> {
        let handle = match self.factory.create(source).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(source = %source, error = %e, "Failed to create browser session");
                let mut state = self.state.lock().await;
                state.cancel_creation(source);
                self.dispatch_waiters(&mut state);
                return Err(e);
            }
        };

        let session_id = generate_id();
        {
            let mut state = self.state.lock().await;
            state.cancel_creation(source);
            if state.shut_down {
                drop(state);
                let _ = handle.close().await;
                return Err(AppError::PoolShutdown);
            }

            let now = Utc::now();
            state.next_seq += 1;
            let seq = state.next_seq;
            state.sessions.insert(
                session_id.clone(),
                SessionSlot {
                    info: WorkerSession {
                        id: session_id.clone(),
                        source: source.to_string(),
                        is_authenticated: false,
                        active_units: 1,
                        created_at: now,
                        last_used_at: now,
                        error_count: 0,
                        authenticated_at: None,
                        auth_metadata: None,
                    },
                    handle,
                    seq,
                    last_used: Instant::now(),
                    authenticated: None,
                },
            );
            metrics::gauge!("rentwatch_sessions_active").set(state.sessions.len() as f64);
        }

        metrics::counter!("rentwatch_sessions_created_total", "source" => source.to_string()).increment(1);
        info!(source = %source, session_id = %session_id, "Created browser session");
        self.events.emit(CrawlEvent::SessionCreated {
            source: source.to_string(),
            id: session_id.clone(),
        });
        Ok(session_id)
    }

    /// Return a unit to its session and hand freed capacity to the next waiter.
    ///
    /// A unit that fails to close counts against the session; past
    /// `max_release_errors` the session is destroyed even if other units are
    /// still checked out.
    pub async fn release(&self, lease: SessionLease) {
        let SessionLease {
            session_id, source, unit, ..
        } = lease;

        let close_result = unit.close().await;
        metrics::gauge!("rentwatch_units_active").decrement(1.0);

        let closed = {
            let mut state = self.state.lock().await;
            state.return_unit(&session_id);
            let closed = match &close_result {
                Ok(()) => None,
                Err(e) => {
                    warn!(source = %source, session_id = %session_id, error = %e, "Failed to close page unit");
                    self.record_failure(&mut state, &session_id)
                }
            };
            self.dispatch_waiters(&mut state);
            closed
        };

        if let Some(slot) = closed {
            self.close_slot(slot).await;
        }
    }

    /// Count a failure against a session and detach it once past the threshold.
    fn record_failure(&self, state: &mut PoolState, session_id: &str) -> Option<SessionSlot> {
        let slot = state.sessions.get_mut(session_id)?;
        slot.info.error_count += 1;
        if slot.info.error_count > self.config.max_release_errors {
            warn!(
                source = %slot.info.source,
                session_id = %session_id,
                errors = slot.info.error_count,
                active_units = slot.info.active_units,
                "Destroying session after repeated failures"
            );
            return state.sessions.remove(session_id);
        }
        None
    }

    /// Serve waiters of every source while capacity allows.
    fn dispatch_waiters(&self, state: &mut PoolState) {
        let sources: Vec<String> = state.waiters.keys().cloned().collect();
        for source in sources {
            self.dispatch_source(state, &source);
        }
    }

    fn dispatch_source(&self, state: &mut PoolState, source: &str) {
        loop {
            let requires_auth = match state.waiters.get(source).and_then(|q| q.first()) {
                Some(head) => head.requires_auth,
                None => break,
            };

            let grant = if let Some(session_id) =
                state.reserve_unit(source, requires_auth, self.config.max_units_per_session)
            {
                Grant::Unit(session_id)
            } else if state.can_create(source, &self.config) {
                state.reserve_creation(source);
                Grant::NewSession
            } else {
                break;
            };

            let waiter = match state.waiters.get_mut(source) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => {
                    state.undo(source, grant);
                    break;
                }
            };
            if state.waiters.get(source).is_some_and(Vec::is_empty) {
                state.waiters.remove(source);
            }

            debug!(source = %source, ticket = waiter.ticket, priority = waiter.priority, "Granting capacity to waiter");
            if let Err(grant) = waiter.tx.send(grant) {
                // caller went away; give the capacity to the next one
                state.undo(source, grant);
            }
        }
    }

    /// Record a successful login on a session.
    pub async fn mark_authenticated(&self, session_id: &str, metadata: Option<serde_json::Value>) -> Result<()> {
        let mut state = self.state.lock().await;
        let slot = state.sessions.get_mut(session_id).ok_or_else(|| AppError::NotFound {
            resource: format!("session {}", session_id),
        })?;

        slot.info.is_authenticated = true;
        slot.info.authenticated_at = Some(Utc::now());
        slot.info.auth_metadata = metadata;
        slot.authenticated = Some(Instant::now());
        debug!(source = %slot.info.source, session_id = %session_id, "Session authenticated");
        Ok(())
    }

    /// Close idle sessions and expire stale authentication.
    pub async fn sweep(&self) -> SweepReport {
        let session_timeout = self.config.session_timeout();
        let auth_lifetime = self.config.auth_lifetime();

        let (expired, demoted) = {
            let mut state = self.state.lock().await;
            let now = Instant::now();

            let idle: Vec<String> = state
                .sessions
                .values()
                .filter(|s| s.info.active_units == 0 && now.duration_since(s.last_used) >= session_timeout)
                .map(|s| s.info.id.clone())
                .collect();
            let expired: Vec<SessionSlot> = idle.iter().filter_map(|id| state.sessions.remove(id)).collect();

            let mut demoted = 0;
            for slot in state.sessions.values_mut() {
                if let Some(at) = slot.authenticated {
                    if now.duration_since(at) >= auth_lifetime {
                        slot.info.is_authenticated = false;
                        slot.authenticated = None;
                        demoted += 1;
                        debug!(source = %slot.info.source, session_id = %slot.info.id, "Authentication expired");
                    }
                }
            }

            if !expired.is_empty() {
                metrics::gauge!("rentwatch_sessions_active").set(state.sessions.len() as f64);
                self.dispatch_waiters(&mut state);
            }
            (expired, demoted)
        };

        let closed = expired.len();
        for slot in expired {
            debug!(source = %slot.info.source, session_id = %slot.info.id, "Closing idle session");
            self.close_slot(slot).await;
        }

        SweepReport { closed, demoted }
    }

    async fn close_slot(&self, slot: SessionSlot) {
        if let Err(e) = slot.handle.close().await {
            warn!(source = %slot.info.source, session_id = %slot.info.id, error = %e, "Error closing session");
        }
        info!(source = %slot.info.source, session_id = %slot.info.id, "Closed browser session");
        self.events.emit(CrawlEvent::SessionClosed {
            source: slot.info.source,
            id: slot.info.id,
        });
    }

    pub async fn sessions(&self) -> Vec<WorkerSession> {
        let state = self.state.lock().await;
        let mut sessions: Vec<(u64, WorkerSession)> =
            state.sessions.values().map(|s| (s.seq, s.info.clone())).collect();
        sessions.sort_by_key(|(seq, _)| *seq);
        sessions.into_iter().map(|(_, info)| info).collect()
    }

    pub async fn get_stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let mut by_source: HashMap<String, SourcePoolStats> = HashMap::new();

        for slot in state.sessions.values() {
            let entry = by_source.entry(slot.info.source.clone()).or_default();
            entry.sessions += 1;
            entry.active_units += slot.info.active_units;
            if slot.info.is_authenticated {
                entry.authenticated += 1;
            }
        }
        for (source, queue) in &state.waiters {
            by_source.entry(source.clone()).or_default().waiting += queue.len();
        }

        let total_active_units = state.sessions.values().map(|s| s.info.active_units).sum();
        let all_full = state
            .sessions
            .values()
            .all(|s| s.info.active_units >= self.config.max_units_per_session);

        PoolStats {
            total_sessions: state.sessions.len(),
            total_active_units,
            total_waiting: state.waiting(),
            at_capacity: state.total_sessions() >= self.config.max_total_sessions && all_full,
            by_source,
        }
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval_secs` until shutdown.
    pub async fn start_maintenance(self: &Arc<Self>) {
        let mut maintenance = self.maintenance.lock().await;
        if maintenance.is_some() {
            return;
        }

        let weak: Weak<ResourcePool> = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs);
        *maintenance = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                let report = pool.sweep().await;
                if report.closed > 0 || report.demoted > 0 {
                    debug!(closed = report.closed, demoted = report.demoted, "Pool sweep finished");
                }
            }
        }));
    }

    /// Accept new acquisitions again after a [`shutdown`](Self::shutdown).
    pub async fn reopen(&self) {
        self.state.lock().await.shut_down = false;
    }

    /// Close every session and cancel every waiter with [`AppError::PoolShutdown`].
    pub async fn shutdown(&self) {
        if let Some(handle) = self.maintenance.lock().await.take() {
            handle.abort();
        }

        let slots: Vec<SessionSlot> = {
            let mut state = self.state.lock().await;
            state.shut_down = true;
            // dropping the senders wakes every waiter
            state.waiters.clear();
            state.creating.clear();
            state.sessions.drain().map(|(_, slot)| slot).collect()
        };

        let count = slots.len();
        for slot in slots {
            self.close_slot(slot).await;
        }
        metrics::gauge!("rentwatch_sessions_active").set(0.0);
        info!(closed = count, "Resource pool shut down");
    }
}
