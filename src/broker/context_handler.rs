//! C6 — the context handler: owns the subscriber map and fans each
//! dispatched message out to every context whose filter matches.
//! Grounded in `DLTContextHandler` (register/unregister/run loop
//! draining `message_queue`).

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};

use log::warn;

use crate::codec::DltMessage;

/// Context id, allocated by [`crate::broker::next_context_id`].
pub type ContextId = u64;

/// One decoded message plus the context ids the dispatcher has already
/// determined it matches (spec §4.5 step 4's match set, computed once
/// by the dispatcher rather than re-run per subscriber here).
pub struct Envelope {
    pub message: DltMessage,
    pub matched: Vec<ContextId>,
}

/// Everything the context handler's single inbound channel carries:
/// both registration control (from `Broker`) and dispatched data
/// (from the dispatcher), matching `DLTContextHandler`'s combined
/// `add_context`/`remove_context`/message-queue draining loop.
pub enum ContextHandlerMsg {
    Register { id: ContextId, tx: SyncSender<DltMessage> },
    Unregister { id: ContextId },
    Dispatch(Envelope),
    Stop,
}

/// Owns the `id -> subscriber queue` map and runs the fan-out loop.
pub struct ContextHandler {
    rx: Receiver<ContextHandlerMsg>,
    subscribers: HashMap<ContextId, SyncSender<DltMessage>>,
}

impl ContextHandler {
    pub fn new(rx: Receiver<ContextHandlerMsg>) -> Self {
        ContextHandler {
            rx,
            subscribers: HashMap::new(),
        }
    }

    /// Drains `rx` until a [`ContextHandlerMsg::Stop`] or the channel
    /// is disconnected (every sender dropped).
    pub fn run(mut self) {
        while let Ok(msg) = self.rx.recv() {
            match msg {
                ContextHandlerMsg::Register { id, tx } => {
                    self.subscribers.insert(id, tx);
                }
                ContextHandlerMsg::Unregister { id } => {
                    self.subscribers.remove(&id);
                }
                ContextHandlerMsg::Dispatch(envelope) => self.fan_out(envelope),
                ContextHandlerMsg::Stop => break,
            }
        }
    }

    fn fan_out(&mut self, envelope: Envelope) {
        let Envelope { message, matched } = envelope;
        let mut disconnected = Vec::new();

        for id in matched {
            let Some(tx) = self.subscribers.get(&id) else {
                continue;
            };
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("subscriber {id} queue is full, dropping message");
                }
                Err(TrySendError::Disconnected(_)) => {
                    disconnected.push(id);
                }
            }
        }

        for id in disconnected {
            self.subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_frame, DecodeOutcome, FourCc};
    use std::sync::mpsc::sync_channel;

    fn sample_message() -> DltMessage {
        let extended_len = crate::codec::header::EXTENDED_HEADER_LEN;
        let total_len = (4 + extended_len) as u16;
        let mut frame = Vec::new();
        frame.push(0x01);
        frame.push(0);
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.push(0x01);
        frame.push(0);
        frame.extend_from_slice(FourCc::new("APP1").as_bytes());
        frame.extend_from_slice(FourCc::new("CTX1").as_bytes());
        match decode_frame(&frame, false) {
            DecodeOutcome::Frame { message, .. } => message,
            _ => panic!("expected Frame"),
        }
    }

    #[test]
    fn dispatch_reaches_only_registered_and_matched_subscribers() {
        let (cmd_tx, cmd_rx) = sync_channel(16);
        let handler = ContextHandler::new(cmd_rx);
        let handle = std::thread::spawn(move || handler.run());

        let (sub_tx, sub_rx) = sync_channel(4);
        cmd_tx
            .send(ContextHandlerMsg::Register { id: 1, tx: sub_tx })
            .unwrap();
        cmd_tx
            .send(ContextHandlerMsg::Dispatch(Envelope {
                message: sample_message(),
                matched: vec![1, 2],
            }))
            .unwrap();

        let received = sub_rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(received.apid().to_string(), "APP1");

        cmd_tx.send(ContextHandlerMsg::Stop).unwrap();
        handle.join().unwrap();
    }
}
