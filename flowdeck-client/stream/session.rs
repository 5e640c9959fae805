//! Live event session for one task.
//!
//! A session is a best-effort observability channel: `open()` waits at most
//! the connect timeout and then lets the caller submit the task whether or
//! not the socket is up. Lost connections are retried a bounded number of
//! times with linear backoff. Giving up is reported to the subscriber as a
//! [`StreamEvent::Disconnected`] and never fails the task.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::transport::StreamTransport;
use super::{Frame, StreamEvent, parse_frame};
use crate::config::SessionConfig;

/// Receives every event of a session. Called on the session's driver task
/// and must not call back into the session.
pub type Subscriber = Arc<dyn Fn(StreamEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Reconnecting { attempt: u32 },
    Terminated,
}

struct Shared {
    task_id: String,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    subscriber: Mutex<Option<Subscriber>>,
    retry_count: AtomicU32,
}

impl Shared {
    /// Move to `next` unless the session is already terminated.
    fn transition(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Terminated || *state == next {
                return false;
            }
            tracing::trace!(task_id = %self.task_id, from = ?*state, to = ?next, "session transition");
            *state = next;
            true
        });
    }

    fn subscriber(&self) -> MutexGuard<'_, Option<Subscriber>> {
        self.subscriber
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand an event to the subscriber. The lock is held across the call so
    /// that once `terminate` returns no further event can be delivered.
    fn deliver(&self, event: StreamEvent) {
        let subscriber = self.subscriber();
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(callback) = subscriber.as_ref() {
            callback(event);
        }
    }

    fn handle_text(&self, text: &str) {
        match parse_frame(text) {
            Frame::Task(frame) => {
                if let Some(frame_task) = frame.task_id.as_deref() {
                    if frame_task != self.task_id {
                        tracing::debug!(
                            task_id = %self.task_id,
                            frame_task,
                            "dropping frame for another task"
                        );
                        return;
                    }
                }
                if frame.is_update() {
                    self.deliver(StreamEvent::Frame(frame));
                } else {
                    tracing::trace!(task_id = %self.task_id, kind = ?frame.kind, "control frame");
                }
            }
            Frame::Raw(raw) => {
                tracing::debug!(task_id = %self.task_id, "undecodable frame kept as log line");
                self.deliver(StreamEvent::Raw(raw));
            }
        }
    }

    /// Idempotent teardown: stop retrying, close the socket, release the subscriber.
    fn terminate(&self) {
        self.cancel.cancel();
        let released = self.subscriber().take();
        self.state.send_if_modified(|state| {
            if *state == SessionState::Terminated {
                return false;
            }
            *state = SessionState::Terminated;
            true
        });
        if released.is_some() {
            tracing::debug!(task_id = %self.task_id, "task stream session terminated");
        }
    }
}

/// One live event channel bound to one task id.
pub struct TaskStreamSession {
    shared: Arc<Shared>,
}

impl TaskStreamSession {
    pub fn new(task_id: impl Into<String>, subscriber: Subscriber) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                task_id: task_id.into(),
                state,
                cancel: CancellationToken::new(),
                subscriber: Mutex::new(Some(subscriber)),
                retry_count: AtomicU32::new(0),
            }),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.shared.task_id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Consecutive failed connection attempts since the last successful open.
    pub fn retry_count(&self) -> u32 {
        self.shared.retry_count.load(Ordering::SeqCst)
    }

    /// Start connecting and wait at most `config.connect_timeout` for the
    /// socket to open or fail. Returns whether the socket is open.
    pub async fn open(&self, transport: Arc<dyn StreamTransport>, config: SessionConfig) -> bool {
        if self.state() != SessionState::Idle {
            tracing::warn!(task_id = %self.task_id(), state = ?self.state(), "open() on a used session");
            return self.state() == SessionState::Open;
        }
        self.shared.transition(SessionState::Connecting);

        let mut state_rx = self.shared.state.subscribe();
        tokio::spawn(drive(self.shared.clone(), transport, config));

        let settled = tokio::time::timeout(
            config.connect_timeout,
            state_rx.wait_for(|s| *s != SessionState::Connecting),
        )
        .await
        .is_ok();

        let open = self.state() == SessionState::Open;
        if !settled {
            tracing::debug!(
                task_id = %self.task_id(),
                timeout_ms = config.connect_timeout.as_millis() as u64,
                "stream not connected yet, continuing without it"
            );
        }
        open
    }

    /// Stop listening. Safe from any state; the backend task keeps running.
    pub fn stop(&self) {
        self.shared.terminate();
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    pub async fn wait_terminated(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Terminated).await;
    }
}

impl Drop for TaskStreamSession {
    fn drop(&mut self) {
        self.shared.terminate();
    }
}

async fn drive(shared: Arc<Shared>, transport: Arc<dyn StreamTransport>, config: SessionConfig) {
    loop {
        let connected = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = transport.connect(&shared.task_id) => result,
        };

        let reason = match connected {
            Ok(mut frames) => {
                shared.retry_count.store(0, Ordering::SeqCst);
                shared.transition(SessionState::Open);
                tracing::info!(task_id = %shared.task_id, "task stream open");

                let reason = loop {
                    tokio::select! {
                        _ = shared.cancel.cancelled() => return,
                        next = frames.next() => match next {
                            Some(Ok(text)) => shared.handle_text(&text),
                            Some(Err(e)) => break e.to_string(),
                            None => break "closed by server".to_string(),
                        },
                    }
                };
                shared.transition(SessionState::Closed);
                reason
            }
            Err(e) => e.to_string(),
        };

        let attempt = shared.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > config.max_reconnects {
            tracing::warn!(
                task_id = %shared.task_id,
                attempts = attempt,
                reason = %reason,
                "giving up on task stream"
            );
            shared.deliver(StreamEvent::Disconnected {
                attempts: attempt,
                reason,
            });
            shared.terminate();
            break;
        }

        let backoff = reconnect_delay(config.reconnect_backoff, attempt);
        tracing::debug!(
            task_id = %shared.task_id,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            reason = %reason,
            "task stream lost, reconnecting"
        );
        shared.transition(SessionState::Reconnecting { attempt });

        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        shared.transition(SessionState::Connecting);
    }
}

/// `attempt * backoff`, saturating for absurd configured values.
fn reconnect_delay(backoff: Duration, attempt: u32) -> Duration {
    backoff.checked_mul(attempt).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::FrameKind;
    use crate::testing::{ScriptedTransport, collect_events};

    fn fast_config() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(200),
            max_reconnects: 2,
            reconnect_backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_open_delivers_frames_in_order() {
        let transport = Arc::new(ScriptedTransport::live());
        let (subscriber, events) = collect_events();
        let session = TaskStreamSession::new("t1", subscriber);

        assert!(session.open(transport.clone(), fast_config()).await);
        assert_eq!(session.state(), SessionState::Open);

        let tx = transport.sender("t1").await;
        tx.send(r#"{"type":"connected","task_id":"t1"}"#.into()).unwrap();
        tx.send(r#"{"type":"progress","progress":30,"message":"a"}"#.into()).unwrap();
        tx.send(r#"{"type":"log","message":"scanning"}"#.into()).unwrap();
        tx.send("garbage".into()).unwrap();

        let got = events.wait_for_len(3).await;
        assert!(matches!(
            &got[0],
            StreamEvent::Frame(f) if matches!(f.kind, FrameKind::Progress { .. })
        ));
        assert!(matches!(
            &got[1],
            StreamEvent::Frame(f) if matches!(&f.kind, FrameKind::Log { message, .. } if message == "scanning")
        ));
        assert_eq!(got[2], StreamEvent::Raw("garbage".into()));

        session.stop();
        assert!(session.is_terminated());
    }

    #[tokio::test]
    async fn test_frames_for_other_tasks_are_dropped() {
        let transport = Arc::new(ScriptedTransport::live());
        let (subscriber, events) = collect_events();
        let session = TaskStreamSession::new("t1", subscriber);
        session.open(transport.clone(), fast_config()).await;

        let tx = transport.sender("t1").await;
        tx.send(r#"{"type":"log","task_id":"t0","message":"stale"}"#.into()).unwrap();
        tx.send(r#"{"type":"log","task_id":"t1","message":"fresh"}"#.into()).unwrap();

        let got = events.wait_for_len(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &got[0],
            StreamEvent::Frame(f) if matches!(&f.kind, FrameKind::Log { message, .. } if message == "fresh")
        ));
    }

    #[tokio::test]
    async fn test_stop_while_connecting() {
        let transport = Arc::new(ScriptedTransport::hanging());
        let (subscriber, events) = collect_events();
        let session = TaskStreamSession::new("t1", subscriber);

        let config = SessionConfig {
            connect_timeout: Duration::from_millis(20),
            ..fast_config()
        };
        assert!(!session.open(transport, config).await);
        assert_eq!(session.state(), SessionState::Connecting);

        session.stop();
        assert_eq!(session.state(), SessionState::Terminated);
        session.stop();
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(events.len(), 0);
    }

    #[tokio::test]
    async fn test_stop_before_open_is_harmless() {
        let (subscriber, _events) = collect_events();
        let session = TaskStreamSession::new("t1", subscriber);
        session.stop();
        assert!(session.is_terminated());

        let transport = Arc::new(ScriptedTransport::live());
        assert!(!session.open(transport.clone(), fast_config()).await);
        assert_eq!(transport.attempts("t1"), 0);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_disconnect_once() {
        let transport = Arc::new(ScriptedTransport::refusing());
        let (subscriber, events) = collect_events();
        let session = TaskStreamSession::new("t1", subscriber);

        assert!(!session.open(transport.clone(), fast_config()).await);
        tokio::time::timeout(Duration::from_secs(2), session.wait_terminated())
            .await
            .unwrap();

        assert_eq!(transport.attempts("t1"), 3);
        let got = events.snapshot();
        assert_eq!(got.len(), 1);
        assert!(matches!(
            &got[0],
            StreamEvent::Disconnected { attempts: 3, reason } if reason.contains("refused")
        ));
    }

    #[test]
    fn test_reconnect_delay_grows_linearly_and_saturates() {
        let backoff = Duration::from_millis(40);
        assert_eq!(reconnect_delay(backoff, 1), Duration::from_millis(40));
        assert_eq!(reconnect_delay(backoff, 3), Duration::from_millis(120));
        assert_eq!(reconnect_delay(Duration::MAX, 2), Duration::MAX);
    }

    #[tokio::test]
    async fn test_huge_backoff_still_stops_cleanly() {
        let transport = Arc::new(ScriptedTransport::refusing());
        let (subscriber, events) = collect_events();
        let session = TaskStreamSession::new("t1", subscriber);

        let config = SessionConfig {
            reconnect_backoff: Duration::MAX,
            ..fast_config()
        };
        assert!(!session.open(transport, config).await);
        assert_eq!(session.state(), SessionState::Reconnecting { attempt: 1 });

        session.stop();
        tokio::time::timeout(Duration::from_secs(2), session.wait_terminated())
            .await
            .unwrap();
        assert_eq!(events.len(), 0);
    }

    #[tokio::test]
    async fn test_reconnects_after_server_close() {
        let transport = Arc::new(ScriptedTransport::live());
        let (subscriber, events) = collect_events();
        let session = TaskStreamSession::new("t1", subscriber);
        session.open(transport.clone(), fast_config()).await;

        let first = transport.sender("t1").await;
        drop(first);
        transport.forget("t1");

        let second = transport.sender("t1").await;
        second
            .send(r#"{"type":"log","message":"after reconnect"}"#.into())
            .unwrap();
        events.wait_for_len(1).await;

        assert_eq!(transport.attempts("t1"), 2);
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.retry_count(), 0);
        session.stop();
    }

    #[tokio::test]
    async fn test_drop_terminates_and_closes_socket() {
        let transport = Arc::new(ScriptedTransport::live());
        let (subscriber, _events) = collect_events();
        let session = TaskStreamSession::new("t1", subscriber);
        session.open(transport.clone(), fast_config()).await;
        let tx = transport.sender("t1").await;

        drop(session);
        tokio::time::timeout(Duration::from_secs(1), tx.closed())
            .await
            .unwrap();
    }
}
