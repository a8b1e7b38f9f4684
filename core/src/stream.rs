//! Event stream plumbing
//!
//! The orchestrator writes typed events into a bounded channel; the
//! stream side turns them into SSE frames and inserts heartbeats while
//! the request is otherwise idle. On overflow heartbeats are dropped
//! first; substantive events apply back-pressure instead.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use attest_protocol::{Event, HeartbeatPayload};

use crate::storage::now_epoch;

pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Sender half handed to the orchestrator.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer.max(8));
        (Self { tx }, rx)
    }

    /// Emit an event. Heartbeats are dropped when the channel is full;
    /// all other events wait for capacity. Send failures mean the
    /// consumer is gone (client disconnect) and are reported as `false`.
    pub async fn emit(&self, event: Event) -> bool {
        if event.is_heartbeat() {
            match self.tx.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("heartbeat dropped on full channel");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        } else {
            self.tx.send(event).await.is_ok()
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Collect-only sender for the non-streaming path: events accumulate in
/// memory and the terminal payload is extracted at the end.
pub fn collector(buffer: usize) -> (EventSender, mpsc::Receiver<Event>) {
    EventSender::channel(buffer)
}

/// Drain a receiver into a vector (test helper and non-stream path).
pub async fn drain(mut rx: mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Pump events into SSE frames with idle heartbeats.
///
/// Frames go to `frames`; the pump ends after the terminal event or when
/// the event channel closes. A heartbeat frame is produced after every
/// `heartbeat` of idle time.
pub async fn pump_sse(
    mut events: mpsc::Receiver<Event>,
    frames: mpsc::Sender<String>,
    heartbeat: Duration,
) {
    loop {
        let next = tokio::time::timeout(heartbeat, events.recv()).await;
        match next {
            Ok(Some(event)) => {
                let terminal = event.is_terminal();
                match event.to_sse_frame() {
                    Ok(frame) => {
                        if frames.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "event serialization failed");
                    }
                }
                if terminal {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {
                let hb = Event::Heartbeat(HeartbeatPayload {
                    t: now_epoch() as u64,
                });
                match hb.to_sse_frame() {
                    Ok(frame) => {
                        if frames.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attest_protocol::{ErrorPayload, ReadyPayload, TokenPayload};

    #[tokio::test]
    async fn test_emit_and_drain_preserves_order() {
        let (tx, rx) = EventSender::channel(16);
        tx.emit(Event::Ready(ReadyPayload {
            request_id: "r".to_string(),
        }))
        .await;
        tx.emit(Event::Token(TokenPayload {
            text: "hello".to_string(),
        }))
        .await;
        drop(tx);
        let events = drain(rx).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "ready");
        assert_eq!(events[1].name(), "token");
    }

    #[tokio::test]
    async fn test_heartbeat_dropped_when_full() {
        let (tx, _rx) = EventSender::channel(8);
        // Fill the channel with tokens.
        for i in 0..8 {
            tx.emit(Event::Token(TokenPayload {
                text: format!("t{i}"),
            }))
            .await;
        }
        // Heartbeat on a full channel reports success without blocking.
        let ok = tx
            .emit(Event::Heartbeat(HeartbeatPayload { t: 1 }))
            .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_pump_stops_after_terminal() {
        let (tx, rx) = EventSender::channel(16);
        let (frames_tx, mut frames_rx) = mpsc::channel(16);
        let pump = tokio::spawn(pump_sse(rx, frames_tx, Duration::from_secs(15)));

        tx.emit(Event::Ready(ReadyPayload {
            request_id: "r".to_string(),
        }))
        .await;
        tx.emit(Event::Error(ErrorPayload {
            code: "server_error".to_string(),
            message: "internal".to_string(),
        }))
        .await;

        let first = frames_rx.recv().await.unwrap();
        assert!(first.starts_with("event: ready\n"));
        let second = frames_rx.recv().await.unwrap();
        assert!(second.starts_with("event: error\n"));
        pump.await.unwrap();
        assert!(frames_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_emits_idle_heartbeats() {
        let (tx, rx) = EventSender::channel(16);
        let (frames_tx, mut frames_rx) = mpsc::channel(16);
        tokio::spawn(pump_sse(rx, frames_tx, Duration::from_secs(15)));

        tokio::time::advance(Duration::from_secs(16)).await;
        let frame = frames_rx.recv().await.unwrap();
        assert!(frame.starts_with("event: heartbeat\n"));
        drop(tx);
    }
}
