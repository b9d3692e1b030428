//! Per-socket connection state: idle tracking, the pending-acknowledgment
//! queue, the bounded processing channel and the one-shot closed signal.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use courier_core::{AckMode, Frame, FrameType};

use crate::error::SendError;
use crate::transport::{Transport, TransportError};

/// Capacity of the inbound processing channel. One slot is the
/// backpressure point: a slow handler stalls delivery to this connection
/// only, never to its neighbours.
const PROCESS_QUEUE_CAPACITY: usize = 1;

/// Unique connection identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl Default for ConnectionId {
    fn default() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl ConnectionId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Frames awaiting acknowledgment, oldest first, with the latest observed
/// sequence number per frame id.
#[derive(Default)]
struct PendingAcks {
    queue: VecDeque<Frame>,
    tracked: HashMap<String, u64>,
}

/// One step of the acknowledgment state machine for the oldest pending
/// frame.
#[derive(Debug)]
pub(crate) enum AckStep {
    /// Nothing pending; wait until a frame is admitted.
    Empty,
    /// First pass under the rigorous tier: the Ack request was issued and
    /// the frame stays queued until the client confirms.
    Request { reply: Frame },
    /// The frame leaves the queue and goes to processing. `reply` carries
    /// the single-tier Ack that precedes delivery.
    Deliver { frame: Frame, reply: Option<Frame> },
    /// Still unconfirmed: retransmit the Ack request and back off.
    Retry { reply: Frame },
    /// Confirmation never arrived in time; delivery is abandoned.
    Expired { id: String },
}

/// State for one client socket.
///
/// An idle timestamp of `None` means a read is in flight and the
/// connection counts as busy; completed writes stamp the current time.
pub struct Connection {
    id: ConnectionId,
    uid: OnceLock<String>,
    transport: Arc<dyn Transport>,
    idle: Mutex<Option<Instant>>,
    acks: Mutex<PendingAcks>,
    /// Wakes the confirmation loop on admissions and sequence updates.
    pub(crate) ack_wake: Notify,
    /// Inbound processing channel, capacity [`PROCESS_QUEUE_CAPACITY`].
    pub(crate) frames_tx: mpsc::Sender<Frame>,
    done: CancellationToken,
}

impl Connection {
    /// Wrap a transport. Returns the connection together with the receiving
    /// half of its processing channel.
    pub fn new(transport: Arc<dyn Transport>) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (frames_tx, frames_rx) = mpsc::channel(PROCESS_QUEUE_CAPACITY);
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            uid: OnceLock::new(),
            transport,
            idle: Mutex::new(Some(Instant::now())),
            acks: Mutex::new(PendingAcks::default()),
            ack_wake: Notify::new(),
            frames_tx,
            done: CancellationToken::new(),
        });
        (conn, frames_rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Bind the authenticated user identity. Later calls are ignored.
    pub fn set_uid(&self, uid: String) {
        let _ = self.uid.set(uid);
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.get().map(String::as_str)
    }

    /// Mark the connection busy; called for every received message.
    pub fn mark_active(&self) {
        *self.idle.lock() = None;
    }

    /// Time of the last completed write, or `None` while busy.
    pub fn idle_since(&self) -> Option<Instant> {
        *self.idle.lock()
    }

    /// Write a pre-encoded payload and stamp the idle clock.
    pub async fn write_text(&self, text: &str) -> Result<(), TransportError> {
        let result = self.transport.send_text(text).await;
        *self.idle.lock() = Some(Instant::now());
        result
    }

    pub async fn write_frame(&self, frame: &Frame) -> Result<(), SendError> {
        let text = serde_json::to_string(frame)?;
        self.write_text(&text).await?;
        Ok(())
    }

    /// Cancel the closed signal and release the transport. Idempotent.
    pub async fn close(&self) {
        self.done.cancel();
        self.transport.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.done.cancelled()
    }

    /// Admit an inbound frame into acknowledgment tracking.
    ///
    /// A frame whose id is already tracked never re-enters the queue: a
    /// sequence at or below the tracked one is a duplicate and is dropped,
    /// a greater one only advances the tracked sequence. Ack frames for
    /// unknown ids are dropped outright.
    pub(crate) fn admit(&self, frame: Frame) {
        {
            let mut guard = self.acks.lock();
            let PendingAcks { queue, tracked } = &mut *guard;
            if let Some(seq) = tracked.get_mut(&frame.id) {
                if queue.is_empty() {
                    return;
                }
                if *seq >= frame.ack_seq {
                    return;
                }
                *seq = frame.ack_seq;
            } else {
                if frame.frame_type == FrameType::Ack {
                    return;
                }
                tracked.insert(frame.id.clone(), frame.ack_seq);
                queue.push_back(frame);
            }
        }
        self.ack_wake.notify_one();
    }

    /// Evaluate the oldest pending frame against the configured tier.
    pub(crate) fn advance_ack(&self, mode: AckMode, timeout: Duration) -> AckStep {
        let mut guard = self.acks.lock();
        let PendingAcks { queue, tracked } = &mut *guard;
        match mode {
            AckMode::Disabled => AckStep::Empty,
            AckMode::Single => match queue.pop_front() {
                None => AckStep::Empty,
                Some(frame) => {
                    let reply = Frame::ack(frame.id.clone(), frame.ack_seq + 1);
                    AckStep::Deliver {
                        frame,
                        reply: Some(reply),
                    }
                }
            },
            AckMode::Rigorous => {
                let Some(head) = queue.front_mut() else {
                    return AckStep::Empty;
                };
                if head.ack_seq == 0 {
                    head.ack_seq += 1;
                    head.ack_time = Some(Instant::now());
                    tracked.insert(head.id.clone(), head.ack_seq);
                    return AckStep::Request {
                        reply: Frame::ack(head.id.clone(), head.ack_seq),
                    };
                }
                let head_id = head.id.clone();
                let head_seq = head.ack_seq;
                let requested_at = head.ack_time;
                if tracked.get(&head_id).is_some_and(|seq| *seq > head_seq) {
                    match queue.pop_front() {
                        Some(frame) => AckStep::Deliver { frame, reply: None },
                        None => AckStep::Empty,
                    }
                } else if requested_at.is_some_and(|at| at.elapsed() >= timeout) {
                    tracked.remove(&head_id);
                    queue.pop_front();
                    AckStep::Expired { id: head_id }
                } else {
                    AckStep::Retry {
                        reply: Frame::ack(head_id, head_seq),
                    }
                }
            }
        }
    }

    /// Drop the tracked sequence for a frame that reached dispatch.
    pub(crate) fn clear_tracked(&self, id: &str) {
        self.acks.lock().tracked.remove(id);
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.acks.lock().queue.len()
    }

    #[cfg(test)]
    pub(crate) fn tracked_seq(&self, id: &str) -> Option<u64> {
        self.acks.lock().tracked.get(id).copied()
    }
}
