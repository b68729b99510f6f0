//! Session registry
//!
//! Keyed sessions plus the live (connected) set that drives the
//! first-connection / all-disconnected lifecycle events. Registry events are
//! delivered in order from a dispatcher task, never on the caller's stack.

use super::events::Listeners;
use super::peer_connection::PeerConnectionFactory;
use super::session::Session;
use super::RtcError;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug)]
enum RegistryEvent {
    Connected(String),
    Disconnected(String),
    FirstConnection,
    AllDisconnected,
}

struct RegistryInner {
    name: String,
    factory: PeerConnectionFactory,
    keyframe_interval: Duration,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    live: Mutex<HashSet<String>>,
    events: mpsc::UnboundedSender<RegistryEvent>,

    on_connection: Listeners<String>,
    on_disconnected: Listeners<String>,
    on_first_connection: Listeners<()>,
    on_all_disconnected: Listeners<()>,
}

/// Registry of sessions keyed by id. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Create a registry and start its dispatcher and sweep tasks.
    ///
    /// Both tasks stop once the last handle is dropped.
    pub fn new(
        name: impl Into<String>,
        factory: PeerConnectionFactory,
        keyframe_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(RegistryInner {
            name: name.into(),
            factory,
            keyframe_interval,
            sessions: RwLock::new(HashMap::new()),
            live: Mutex::new(HashSet::new()),
            events,
            on_connection: Listeners::new(),
            on_disconnected: Listeners::new(),
            on_first_connection: Listeners::new(),
            on_all_disconnected: Listeners::new(),
        });

        tokio::spawn(dispatch_events(Arc::downgrade(&inner), rx));
        tokio::spawn(sweep_loop(Arc::downgrade(&inner), sweep_interval));

        Self { inner }
    }

    /// Return the session for `id`, creating it if absent
    pub async fn create(&self, id: &str) -> Result<Arc<Session>, RtcError> {
        self.get_or_create(id).await.map(|(session, _)| session)
    }

    /// Like `create`, also reporting whether this call created the session
    pub async fn get_or_create(&self, id: &str) -> Result<(Arc<Session>, bool), RtcError> {
        if let Some(session) = self.get(id) {
            return Ok((session, false));
        }

        let pc = self.inner.factory.create_peer_connection().await?;
        let session = Session::new(id, pc, self.inner.keyframe_interval);

        let existing = {
            let mut sessions = self.inner.sessions.write();
            match sessions.get(id) {
                Some(existing) => Some(existing.clone()),
                None => {
                    sessions.insert(id.to_string(), session.clone());
                    None
                }
            }
        };

        if let Some(existing) = existing {
            // Lost a creation race; discard ours
            let _ = session.close().await;
            return Ok((existing, false));
        }

        self.watch(&session);
        info!("Registry {} created session {}", self.inner.name, id);
        Ok((session, true))
    }

    fn watch(&self, session: &Arc<Session>) {
        let id = session.id().to_string();
        let weak = Arc::downgrade(&self.inner);
        session.on_connected(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.session_connected(&id);
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let watched = Arc::downgrade(session);
        session.on_disconnected(move |_| {
            if let (Some(inner), Some(session)) = (weak.upgrade(), watched.upgrade()) {
                inner.forget(&session);
            }
        });
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(id).cloned()
    }

    /// Remove and close the session for `id`; no-op for unknown ids
    pub async fn remove(&self, id: &str) {
        let session = self.inner.sessions.write().remove(id);
        if let Some(session) = session {
            debug!("Registry {} removing session {}", self.inner.name, id);
            if let Err(e) = session.close().await {
                debug!("Session {} close: {}", id, e);
            }
            self.inner.forget(&session);
        }
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sessions currently connected
    pub fn live_count(&self) -> usize {
        self.inner.live.lock().len()
    }

    pub fn on_connection(&self, handler: impl Fn(&String) + Send + Sync + 'static) {
        self.inner.on_connection.subscribe(handler);
    }

    pub fn on_disconnected(&self, handler: impl Fn(&String) + Send + Sync + 'static) {
        self.inner.on_disconnected.subscribe(handler);
    }

    pub fn on_first_connection(&self, handler: impl Fn(&()) + Send + Sync + 'static) {
        self.inner.on_first_connection.subscribe(handler);
    }

    pub fn on_all_disconnected(&self, handler: impl Fn(&()) + Send + Sync + 'static) {
        self.inner.on_all_disconnected.subscribe(handler);
    }

    /// Reap sessions whose connection went terminal without a callback
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }
}

impl RegistryInner {
    fn session_connected(&self, id: &str) {
        if !self.sessions.read().contains_key(id) {
            return;
        }
        let mut live = self.live.lock();
        if !live.insert(id.to_string()) {
            return;
        }
        // Sent under the lock so concurrent transitions keep their order
        let _ = self.events.send(RegistryEvent::Connected(id.to_string()));
        if live.len() == 1 {
            let _ = self.events.send(RegistryEvent::FirstConnection);
        }
    }

    /// Drop `session` from the map (if still current) and the live set
    fn forget(&self, session: &Arc<Session>) {
        let id = session.id();
        {
            let mut sessions = self.sessions.write();
            if sessions.get(id).is_some_and(|current| Arc::ptr_eq(current, session)) {
                sessions.remove(id);
            }
        }

        let mut live = self.live.lock();
        if !live.remove(id) {
            return;
        }
        let _ = self.events.send(RegistryEvent::Disconnected(id.to_string()));
        if live.is_empty() {
            let _ = self.events.send(RegistryEvent::AllDisconnected);
        }
    }

    fn sweep(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        let mut reaped = 0;
        for session in sessions {
            if session.sync_with_connection() {
                self.forget(&session);
                reaped += 1;
            }
        }
        if reaped > 0 {
            debug!("Registry {} swept {} terminal session(s)", self.name, reaped);
        }
        reaped
    }

    fn deliver(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Connected(id) => self.on_connection.emit(&id),
            RegistryEvent::Disconnected(id) => self.on_disconnected.emit(&id),
            RegistryEvent::FirstConnection => {
                info!("Registry {} has its first live session", self.name);
                self.on_first_connection.emit(&());
            }
            RegistryEvent::AllDisconnected => {
                info!("Registry {} has no live sessions left", self.name);
                self.on_all_disconnected.emit(&());
            }
        }
    }
}

async fn dispatch_events(inner: Weak<RegistryInner>, mut rx: mpsc::UnboundedReceiver<RegistryEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.deliver(event);
    }
}

async fn sweep_loop(inner: Weak<RegistryInner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.sweep();
    }
}
