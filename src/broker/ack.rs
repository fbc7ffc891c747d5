//! Ack dispatcher thread: confirms that a filter registration the
//! dispatcher thread accepted was actually applied, so
//! `Broker::add_context` can report success/failure to its caller
//! instead of assuming the registration landed. Grounded in
//! `DLTFilterAckMessageHandler`.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::broker::context_handler::ContextId;

/// Sent by the dispatcher once it has applied a filter registration.
pub struct AckRequest {
    pub id: ContextId,
}

/// Registered by `Broker::add_context` before it sends the
/// corresponding filter command, so the ack dispatcher has somewhere
/// to deliver (or time out) the confirmation.
pub struct PendingAck {
    pub id: ContextId,
    pub registered_at: Instant,
    pub reply: SyncSender<()>,
}

/// How often the dispatcher checks for timed-out pending acks when no
/// new ack or registration has arrived.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct AckDispatcher {
    ack_rx: Receiver<AckRequest>,
    pending_rx: Receiver<PendingAck>,
    timeout: Duration,
    ignore_timeout: bool,
}

impl AckDispatcher {
    pub fn new(
        ack_rx: Receiver<AckRequest>,
        pending_rx: Receiver<PendingAck>,
        timeout: Duration,
        ignore_timeout: bool,
    ) -> Self {
        AckDispatcher {
            ack_rx,
            pending_rx,
            timeout,
            ignore_timeout,
        }
    }

    /// Runs until both `ack_rx` and `pending_rx` are disconnected
    /// (i.e. the broker has shut down).
    pub fn run(mut self) {
        let mut pending: HashMap<ContextId, PendingAck> = HashMap::new();

        loop {
            while let Ok(p) = self.pending_rx.try_recv() {
                pending.insert(p.id, p);
            }

            match self.ack_rx.recv_timeout(POLL_INTERVAL) {
                Ok(AckRequest { id }) => {
                    if let Some(p) = pending.remove(&id) {
                        let _ = p.reply.send(());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if pending.is_empty() {
                        break;
                    }
                }
            }

            let now = Instant::now();
            let timeout = self.timeout;
            let ignore_timeout = self.ignore_timeout;
            pending.retain(|id, p| {
                if now.duration_since(p.registered_at) <= timeout {
                    return true;
                }
                if ignore_timeout {
                    warn!("ack timeout for context {id}, continuing without confirmation");
                } else {
                    error!("ack timeout for context {id}");
                }
                false
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;

    #[test]
    fn ack_arriving_before_timeout_notifies_waiter() {
        let (ack_tx, ack_rx) = sync_channel(4);
        let (pending_tx, pending_rx) = sync_channel(4);
        let dispatcher = AckDispatcher::new(ack_rx, pending_rx, Duration::from_millis(500), false);
        let handle = std::thread::spawn(move || dispatcher.run());

        let (reply_tx, reply_rx) = sync_channel(1);
        pending_tx
            .send(PendingAck {
                id: 1,
                registered_at: Instant::now(),
                reply: reply_tx,
            })
            .unwrap();
        ack_tx.send(AckRequest { id: 1 }).unwrap();

        reply_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        drop(ack_tx);
        drop(pending_tx);
        handle.join().unwrap();
    }

    #[test]
    fn timeout_drops_pending_ack_without_reply() {
        let (ack_tx, ack_rx) = sync_channel(4);
        let (pending_tx, pending_rx) = sync_channel(4);
        let dispatcher = AckDispatcher::new(ack_rx, pending_rx, Duration::from_millis(20), true);
        let handle = std::thread::spawn(move || dispatcher.run());

        let (reply_tx, reply_rx) = sync_channel(1);
        pending_tx
            .send(PendingAck {
                id: 1,
                registered_at: Instant::now(),
                reply: reply_tx,
            })
            .unwrap();

        assert!(reply_rx.recv_timeout(Duration::from_millis(500)).is_err());

        drop(ack_tx);
        drop(pending_tx);
        handle.join().unwrap();
    }
}
