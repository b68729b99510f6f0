use super::{PeerConnectionFactory, Session, Signal};
use crate::config::WebRTCConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn factory() -> PeerConnectionFactory {
    PeerConnectionFactory::new(WebRTCConfig::default(), Vec::new())
}

pub(crate) async fn session(id: &str) -> Arc<Session> {
    let pc = factory().create_peer_connection().await.unwrap();
    Session::new(id, pc, Duration::from_secs(2))
}

pub(crate) fn collect_signals(session: &Session) -> Arc<Mutex<Vec<Signal>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    session.on_signal(move |signal| sink.lock().push(signal.clone()));
    seen
}
