//! HTTP long-poll client for a capture endpoint

use super::ClientError;
use crate::rtc::Signal;
use crate::stream::{ConnectionEvent, NewStreamBody};
use bytes::Bytes;
use log::{debug, info, warn};
use reqwest::{Client, Response};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};

const BATCH_WINDOW: Duration = Duration::from_millis(100);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);
const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct SignalingClient {
    http: Client,
    base_url: String,
    stream_id: String,
    registration: NewStreamBody,
}

impl SignalingClient {
    pub fn new(base_url: impl Into<String>, stream_id: impl Into<String>, registration: NewStreamBody) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            stream_id: stream_id.into(),
            registration,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn url(&self, route: &str) -> String {
        format!("{}/{}/{}/internal", self.base_url, route, self.stream_id)
    }

    /// Register (or re-register) the stream with the relay
    pub async fn register(&self) -> Result<(), ClientError> {
        let res = self.http.post(self.url("connect")).json(&self.registration).send().await?;
        check(res).await?;
        info!("Registered stream {} with {}", self.stream_id, self.base_url);
        Ok(())
    }

    /// One long-poll for signals addressed to the capture endpoint
    pub async fn poll(&self) -> Result<Vec<Signal>, ClientError> {
        let res = self.http.get(self.url("signal")).send().await?;
        Ok(check(res).await?.json::<Vec<Signal>>().await?)
    }

    pub async fn send(&self, signals: &[Signal]) -> Result<(), ClientError> {
        let res = self.http.post(self.url("signal")).json(signals).send().await?;
        check(res).await?;
        Ok(())
    }

    pub async fn send_snapshot(&self, jpeg: Bytes) -> Result<(), ClientError> {
        let res = self
            .http
            .post(self.url("snapshot"))
            .header(reqwest::header::CONTENT_TYPE, "image/jpg")
            .body(jpeg)
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    pub async fn report_connection_event(&self, event: &ConnectionEvent) -> Result<(), ClientError> {
        let res = self.http.post(self.url("conn-evt")).json(event).send().await?;
        check(res).await?;
        Ok(())
    }

    /// Start the poll and send loops.
    ///
    /// The stream must already be registered. Signals from the relay arrive
    /// on `incoming`; signals written to `outgoing` are posted in batches.
    pub fn spawn(self) -> SignalingLink {
        let (incoming_tx, incoming) = mpsc::channel(CHANNEL_CAPACITY);
        let (outgoing, outgoing_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let poller = tokio::spawn(poll_loop(self.clone(), incoming_tx));
        let sender = tokio::spawn(send_loop(self, outgoing_rx));

        SignalingLink {
            incoming,
            outgoing,
            tasks: vec![poller, sender],
        }
    }
}

async fn check(res: Response) -> Result<Response, ClientError> {
    let status = res.status();
    if status.is_success() {
        Ok(res)
    } else {
        let body = res.text().await.unwrap_or_default();
        Err(ClientError::UnexpectedStatus { status, body })
    }
}

async fn poll_loop(client: SignalingClient, incoming: mpsc::Sender<Signal>) {
    loop {
        match client.poll().await {
            Ok(signals) => {
                for signal in signals {
                    if incoming.send(signal).await.is_err() {
                        debug!("Signal consumer for {} gone; stopping poll", client.stream_id);
                        return;
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                warn!("Relay forgot stream {}; registering again", client.stream_id);
                if let Err(e) = client.register().await {
                    warn!("Re-register of {} failed: {}", client.stream_id, e);
                    sleep(RETRY_BACKOFF).await;
                }
            }
            Err(e) => {
                warn!("Poll for {} failed: {}", client.stream_id, e);
                sleep(RETRY_BACKOFF).await;
            }
        }
    }
}

async fn send_loop(client: SignalingClient, mut outgoing: mpsc::Receiver<Signal>) {
    while let Some(first) = outgoing.recv().await {
        let mut batch = vec![first];
        let deadline = Instant::now() + BATCH_WINDOW;
        let mut closed = false;
        loop {
            match timeout_at(deadline, outgoing.recv()).await {
                Ok(Some(signal)) => batch.push(signal),
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        loop {
            match client.send(&batch).await {
                Ok(()) => break,
                Err(ClientError::Http(e)) => {
                    warn!("Sending {} signal(s) for {} failed: {}", batch.len(), client.stream_id, e);
                    sleep(RETRY_BACKOFF).await;
                }
                Err(e) => {
                    warn!("Relay rejected {} signal(s) for {}: {}", batch.len(), client.stream_id, e);
                    break;
                }
            }
        }

        if closed {
            break;
        }
    }
}

/// Running poll/send loops for one stream; dropping it stops both
pub struct SignalingLink {
    pub incoming: mpsc::Receiver<Signal>,
    pub outgoing: mpsc::Sender<Signal>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
