//! Stream table
//!
//! Streams are keyed by their id plus a per-process run id, so ids handed
//! out before a restart no longer resolve. Streams are never removed; stale
//! ones simply drop out of the listing.

use super::broadcast::Stream;
use super::signal_buffer::{DrainOrder, SignalBuffer};
use super::{StreamError, StreamListing, StreamSettings};
use crate::rtc::{PeerConnectionFactory, Session, SessionRegistry};
use log::info;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub struct BroadcastRegistry {
    run_id: String,
    factory: PeerConnectionFactory,
    settings: StreamSettings,
    streams: RwLock<HashMap<String, Arc<Stream>>>,
    captures: SessionRegistry,
    registration: tokio::sync::Mutex<()>,
}

impl BroadcastRegistry {
    pub fn new(factory: PeerConnectionFactory, settings: StreamSettings) -> Arc<Self> {
        let run_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let captures = SessionRegistry::new(
            "captures",
            factory.clone(),
            settings.keyframe_interval,
            settings.sweep_interval,
        );
        info!("Broadcast registry started with run id {}", run_id);
        Arc::new(Self {
            run_id,
            factory,
            settings,
            streams: RwLock::new(HashMap::new()),
            captures,
            registration: tokio::sync::Mutex::new(()),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    fn scoped_key(&self, id: &str) -> String {
        format!("{}:{}", id, self.run_id)
    }

    /// Register (or re-register) a capture endpoint's stream.
    ///
    /// Re-registering keeps the stream's viewers and their mailboxes, and
    /// resets the capture session, the capture mailbox and the keepalive.
    pub async fn new_stream(&self, id: &str, direct_connect: bool, private: bool) -> Arc<Stream> {
        // Held across the whole swap so concurrent registrations share one
        // viewer registry
        let _registering = self.registration.lock().await;

        let key = self.scoped_key(id);
        let previous = self.streams.read().get(&key).cloned();

        let (viewers, to_viewers) = match &previous {
            Some(previous) => {
                previous.detach_capture();
                (previous.viewer_registry().clone(), previous.viewer_outbox().clone())
            }
            None => {
                let viewers = SessionRegistry::new(
                    format!("viewers:{}", id),
                    self.factory.clone(),
                    self.settings.keyframe_interval,
                    self.settings.sweep_interval,
                );
                self.stop_capture_when_idle(&viewers, &key);
                (viewers, SignalBuffer::new(DrainOrder::Arrival))
            }
        };

        self.captures.remove(&key).await;

        let stream = Stream::new(
            id,
            &key,
            direct_connect,
            private,
            self.settings.clone(),
            viewers,
            to_viewers,
            self.captures.clone(),
        );
        stream.touch();
        self.streams.write().insert(key, stream.clone());

        info!(
            "Stream {} registered ({}, {}{})",
            id,
            if direct_connect { "direct-connect" } else { "relayed" },
            if private { "private" } else { "public" },
            if previous.is_some() { ", restarted" } else { "" }
        );
        stream
    }

    /// Drop the upstream connection once the last viewer leaves
    fn stop_capture_when_idle(&self, viewers: &SessionRegistry, key: &str) {
        let captures = self.captures.clone();
        let key = key.to_string();
        viewers.on_all_disconnected(move |_| {
            let captures = captures.clone();
            let key = key.clone();
            tokio::spawn(async move {
                info!("No viewers left on {}; closing capture session", key);
                captures.remove(&key).await;
            });
        });
    }

    pub fn get_stream(&self, id: &str) -> Option<Arc<Stream>> {
        self.streams.read().get(&self.scoped_key(id)).cloned()
    }

    pub fn require_stream(&self, id: &str) -> Result<Arc<Stream>, StreamError> {
        self.get_stream(id)
            .ok_or_else(|| StreamError::StreamNotFound(id.to_string()))
    }

    /// Like `require_stream`, but a stream whose capture endpoint has gone
    /// quiet counts as missing
    pub fn require_available_stream(&self, id: &str) -> Result<Arc<Stream>, StreamError> {
        self.require_stream(id).and_then(|stream| {
            if stream.is_available() {
                Ok(stream)
            } else {
                Err(StreamError::StreamNotFound(id.to_string()))
            }
        })
    }

    pub async fn connect_capture_endpoint(&self, id: &str) -> Result<Arc<Session>, StreamError> {
        self.require_stream(id)?.connect_capture_endpoint().await
    }

    pub async fn new_viewer(&self, id: &str, viewer_id: &str) -> Result<Arc<Session>, StreamError> {
        let stream = self.require_stream(id)?;
        if stream.is_direct_connect() {
            return Err(StreamError::Rtc(crate::rtc::RtcError::ConnectionFailed(format!(
                "stream {} is direct-connect",
                id
            ))));
        }
        stream.viewer_session(viewer_id).await
    }

    /// Available, public streams
    pub fn list_streams(&self) -> Vec<StreamListing> {
        let mut listings: Vec<StreamListing> = self
            .streams
            .read()
            .values()
            .filter(|s| s.is_available() && !s.is_private())
            .map(|s| StreamListing {
                stream_id: s.id().to_string(),
                viewers: s.viewer_count(),
                uptime: s.uptime().as_secs(),
                direct_connect: s.is_direct_connect(),
            })
            .collect();
        listings.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        listings
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    pub fn available_stream_count(&self) -> usize {
        self.streams.read().values().filter(|s| s.is_available()).count()
    }

    pub fn viewer_session_count(&self) -> usize {
        self.streams
            .read()
            .values()
            .filter(|s| !s.is_direct_connect())
            .map(|s| s.viewer_count())
            .sum()
    }
}
