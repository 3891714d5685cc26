// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-session worker and event broadcaster.
//!
//! One long-lived task per session drains an unbounded inbound queue and
//! runs one turn at a time through the runtime adapter.  Raw events are
//! enriched with a correlation `message_id` per (sender, turn), buffered
//! for persistence, and fanned out through a bounded broadcast channel.
//! A subscriber that lags is disconnected by the transport layer rather
//! than ever blocking the worker.  Late subscribers see no replay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use troupe_store::{SessionMessage, SessionRecord, SessionRepository};

use crate::adapter::RuntimeAdapter;
use crate::events::{now_iso, SessionStreamEvent};

const BROADCAST_CAPACITY: usize = 256;

/// Correlation state for one in-flight agent message.
struct Tracker {
    id: String,
    buffer: String,
}

/// Processes queued messages for one session and broadcasts responses.
pub struct SessionRuntime {
    record: Mutex<SessionRecord>,
    adapter: Arc<dyn RuntimeAdapter>,
    repository: Arc<dyn SessionRepository>,
    queue_tx: mpsc::UnboundedSender<SessionMessage>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionMessage>>>,
    events_tx: broadcast::Sender<SessionStreamEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
    streaming: AtomicBool,
    /// Set by `force_stop`; the worker abandons the current turn and keeps
    /// draining the queue.
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl SessionRuntime {
    pub fn new(
        record: SessionRecord,
        adapter: Arc<dyn RuntimeAdapter>,
        repository: Arc<dyn SessionRepository>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            record: Mutex::new(record),
            adapter,
            repository,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            events_tx,
            worker: Mutex::new(None),
            streaming: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        })
    }

    /// Spawn the worker task if it is not already running.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().expect("worker lock");
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Some(queue_rx) = self.queue_rx.lock().expect("queue lock").take() else {
            return;
        };
        let this = self.clone();
        *worker = Some(tokio::spawn(async move {
            this.worker_loop(queue_rx).await;
        }));
        debug!(session = %self.session_id(), "session worker started");
    }

    /// Abort the worker permanently (session deleted).
    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().expect("worker lock").take() {
            handle.abort();
        }
    }

    /// Cancel the current turn, notify subscribers and keep the queue.
    ///
    /// Exactly one `session.stopped` reaches every subscriber; unprocessed
    /// tokens of the in-flight turn are discarded.
    pub async fn force_stop(&self, reason: Option<&str>) {
        info!(session = %self.session_id(), reason = reason.unwrap_or("force_stop"), "force stop");
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
        self.publish(SessionStreamEvent::session_stopped(
            &self.session_id(),
            reason.unwrap_or("force_stop"),
        ));
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn enqueue(&self, message: SessionMessage) {
        if self.queue_tx.send(message).is_err() {
            warn!(session = %self.session_id(), "worker gone; dropping message");
        }
    }

    /// A fresh event stream; no replay of earlier events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionStreamEvent> {
        self.events_tx.subscribe()
    }

    pub fn update_record(&self, record: SessionRecord) {
        *self.record.lock().expect("record lock") = record;
    }

    fn session_id(&self) -> String {
        self.record.lock().expect("record lock").id.clone()
    }

    fn publish(&self, event: SessionStreamEvent) {
        // Send fails only when no subscriber is connected; fan-out is
        // best-effort either way.
        let _ = self.events_tx.send(event);
    }

    async fn worker_loop(self: Arc<Self>, mut queue_rx: mpsc::UnboundedReceiver<SessionMessage>) {
        while let Some(message) = queue_rx.recv().await {
            let record = self.record.lock().expect("record lock").clone();
            debug!(session = %record.id, "worker picked up message");
            let mut rx = self.adapter.invoke_stream(record, message).await;
            let mut trackers: HashMap<String, Tracker> = HashMap::new();
            // A stale cancel from an idle-time force_stop must not kill this
            // fresh turn.
            self.cancelled.store(false, Ordering::SeqCst);
            self.streaming.store(true, Ordering::SeqCst);

            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel_notify.notified() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            if self.cancelled.load(Ordering::SeqCst) {
                                break;
                            }
                            self.handle_adapter_event(event, &mut trackers).await;
                        }
                        None => break,
                    },
                }
            }

            // Dropping the receiver cancels the in-flight producer.
            drop(rx);
            self.streaming.store(false, Ordering::SeqCst);

            if self.cancelled.swap(false, Ordering::SeqCst) {
                // Cancelled turn: partial buffers are discarded.
                trackers.clear();
                continue;
            }

            // Flush trackers that never saw an explicit agent.end (adapter
            // crashed mid-stream).
            for (sender, tracker) in trackers.drain() {
                let mut ev = SessionStreamEvent::agent_end(&sender, &tracker.buffer);
                ev.set("message_id", json!(tracker.id));
                ev.set("session_id", json!(self.session_id()));
                ev.set("timestamp", json!(now_iso()));
                if !tracker.buffer.is_empty() {
                    match self
                        .repository
                        .add_message(&self.session_id(), &sender, &tracker.buffer)
                        .await
                    {
                        Ok(rec) => ev.set("persisted_message_id", json!(rec.id)),
                        Err(e) => warn!("failed to persist flushed agent message: {e}"),
                    }
                }
                self.publish(ev);
            }
        }
    }

    async fn handle_adapter_event(
        &self,
        mut event: SessionStreamEvent,
        trackers: &mut HashMap<String, Tracker>,
    ) {
        let sender = event.data_str("sender").map(str::to_string);
        let is_agent_event =
            matches!(event.event.as_str(), "agent.start" | "agent.chunk" | "agent.end");

        if let (true, Some(sender)) = (is_agent_event, sender) {
            let session_id = self.session_id();
            let tracker = trackers.entry(sender.clone()).or_insert_with(|| Tracker {
                id: generate_agent_message_id(&sender),
                buffer: String::new(),
            });
            event.set_default("message_id", json!(tracker.id));
            event.set_default("session_id", json!(session_id));

            match event.event.as_str() {
                "agent.start" => {
                    event.set_default("timestamp", json!(now_iso()));
                }
                "agent.chunk" => {
                    let content = event.data_str("content").unwrap_or("").to_string();
                    tracker.buffer.push_str(&content);
                }
                "agent.end" => {
                    let final_content = match event.data_str("content") {
                        Some(c) if !c.is_empty() => c.to_string(),
                        _ => tracker.buffer.clone(),
                    };
                    event.set("content", json!(final_content));
                    event.set_default("timestamp", json!(now_iso()));
                    // Persist only on agent.end and only when non-empty; a
                    // store failure is logged, the event still goes out.
                    if !final_content.is_empty() {
                        match self
                            .repository
                            .add_message(&session_id, &sender, &final_content)
                            .await
                        {
                            Ok(rec) => event.set("persisted_message_id", json!(rec.id)),
                            Err(e) => warn!("failed to persist agent message: {e}"),
                        }
                    }
                    trackers.remove(&sender);
                }
                _ => {}
            }
        }

        self.publish(event);
    }
}

/// `<sanitized-sender>_<8 hex>`, assigned on the first `agent.start` for a
/// sender within a turn.
fn generate_agent_message_id(sender: &str) -> String {
    let normalized = if sender.is_empty() { "agent" } else { sender };
    let safe: String = normalized
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let safe = safe.trim_matches('_');
    let safe = if safe.is_empty() { "agent" } else { safe };
    let hex = Uuid::new_v4().simple().to_string();
    format!("{safe}_{}", &hex[..8])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
