//! C5 — the dispatcher: owns the live source and the reverse filter
//! index (context id -> [`FilterSet`]), reads frames one at a time,
//! and forwards each to the context handler along with the set of
//! context ids it matched. Grounded in
//! `DLTMessageDispatcherBase.handle`/`_process_filter_queue` and the
//! `DLTFileSpinner`/`DLTMessageHandler` run loops.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::broker::ack::AckRequest;
use crate::broker::context_handler::{ContextHandlerMsg, ContextId, Envelope};
use crate::broker::time_cell::TimeCell;
use crate::codec::ContinuityChecker;
use crate::source::{PollOutcome, Source, SourceError};

/// Control messages the broker façade sends to the dispatcher thread
/// to add or remove a context's filter from the reverse index.
pub enum FilterCommand {
    Add { id: ContextId, filter: crate::filter::FilterSet },
    Remove { id: ContextId },
    Stop,
}

/// An optional cap on the number of messages a dispatcher loop
/// processes before stopping on its own, reimplementing
/// `dlt/helpers.py::LimitCondition` for test harnesses that want a
/// bounded run (not exposed on the public `Broker`, which runs until
/// `stop()`).
#[derive(Clone, Copy, Debug)]
pub struct MessageLimit {
    remaining: usize,
}

impl MessageLimit {
    pub fn new(count: usize) -> Self {
        MessageLimit { remaining: count }
    }

    fn take(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// Runs the dispatch loop over `source` until stopped, a
/// [`MessageLimit`] is exhausted, or the source reports `Done`.
pub struct Dispatcher<S: Source> {
    source: S,
    filter_rx: Receiver<FilterCommand>,
    context_tx: SyncSender<ContextHandlerMsg>,
    ack_tx: SyncSender<AckRequest>,
    time_cell: TimeCell,
    enable_time_cell: bool,
    sink: Option<File>,
    reverse_index: HashMap<ContextId, crate::filter::FilterSet>,
    continuity: ContinuityChecker,
    limit: Option<MessageLimit>,
}

impl<S: Source> Dispatcher<S> {
    pub fn new(
        source: S,
        filter_rx: Receiver<FilterCommand>,
        context_tx: SyncSender<ContextHandlerMsg>,
        ack_tx: SyncSender<AckRequest>,
        time_cell: TimeCell,
        enable_time_cell: bool,
        sink: Option<File>,
    ) -> Self {
        Dispatcher {
            source,
            filter_rx,
            context_tx,
            ack_tx,
            time_cell,
            enable_time_cell,
            sink,
            reverse_index: HashMap::new(),
            continuity: ContinuityChecker::new(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: MessageLimit) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Computes the context ids whose filter matches `(apid, ctid)`.
    /// An empty `FilterSet` (no pairs added) matches nothing; a
    /// subscriber that wants every message must register an explicit
    /// `(*, *)` pair, same as `_process_filter_queue` adding no
    /// `context_map` entry at all for an empty filter list.
    fn match_set(&self, apid: crate::codec::FourCc, ctid: crate::codec::FourCc) -> Vec<ContextId> {
        self.reverse_index
            .iter()
            .filter(|(_, filter)| filter.matches(apid, ctid))
            .map(|(&id, _)| id)
            .collect()
    }

    fn drain_filter_commands(&mut self) -> bool {
        loop {
            match self.filter_rx.try_recv() {
                Ok(FilterCommand::Add { id, filter }) => {
                    self.reverse_index.insert(id, filter);
                    if self.ack_tx.send(AckRequest { id }).is_err() {
                        debug!("ack channel closed, dropping ack for context {id}");
                    }
                }
                Ok(FilterCommand::Remove { id }) => {
                    self.reverse_index.remove(&id);
                }
                Ok(FilterCommand::Stop) => return true,
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    /// Runs the loop body described in spec §4.5 until the source is
    /// exhausted, stopped, or the message limit (if any) runs out.
    pub fn run(mut self) {
        loop {
            if self.drain_filter_commands() {
                info!("dispatcher stopping");
                return;
            }

            if let Some(limit) = &mut self.limit {
                if !limit.take() {
                    info!("dispatcher reached its message limit, stopping");
                    return;
                }
            }

            match self.source.poll() {
                Ok(PollOutcome::Message(message)) => {
                    if let Some(sink) = &mut self.sink {
                        if let Err(e) = sink.write_all(&message.encode()) {
                            warn!("failed to append frame to sink file: {e}");
                        }
                    }

                    if self.continuity.check(&message) {
                        debug!(
                            "counter gap detected for {}/{}",
                            message.apid(),
                            message.ctid()
                        );
                    }

                    let timestamp = message.timestamp();
                    let matched = self.match_set(message.apid(), message.ctid());
                    if matched.is_empty() {
                        continue;
                    }
                    if self
                        .context_tx
                        .send(ContextHandlerMsg::Dispatch(Envelope { message, matched }))
                        .is_err()
                    {
                        error!("context handler channel closed, stopping dispatcher");
                        return;
                    }
                    if self.enable_time_cell {
                        self.time_cell.set(timestamp);
                    }
                }
                Ok(PollOutcome::Pending) => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(PollOutcome::Done) => {
                    info!("source exhausted, dispatcher stopping");
                    return;
                }
                Err(SourceError::Stopped) => {
                    info!("source stopped, dispatcher stopping");
                    return;
                }
                Err(e) => {
                    error!("source error: {e}, stopping dispatcher");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_frame, DecodeOutcome, DltMessage};
    use std::sync::mpsc::sync_channel;

    struct FixedSource {
        messages: Vec<DltMessage>,
    }

    impl Source for FixedSource {
        fn poll(&mut self) -> Result<PollOutcome, SourceError> {
            match self.messages.pop() {
                Some(m) => Ok(PollOutcome::Message(m)),
                None => Ok(PollOutcome::Done),
            }
        }

        fn stop(&mut self) {}
    }

    fn sample_message(apid: &str) -> DltMessage {
        let extended_len = crate::codec::header::EXTENDED_HEADER_LEN;
        let total_len = (4 + extended_len) as u16;
        let mut frame = Vec::new();
        frame.push(0x01);
        frame.push(0);
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.push(0x01);
        frame.push(0);
        frame.extend_from_slice(crate::codec::FourCc::new(apid).as_bytes());
        frame.extend_from_slice(crate::codec::FourCc::new("CTX1").as_bytes());
        match decode_frame(&frame, false) {
            DecodeOutcome::Frame { message, .. } => message,
            _ => panic!("expected Frame"),
        }
    }

    #[test]
    fn dispatcher_forwards_matched_messages_and_stops_on_done() {
        let (filter_tx, filter_rx) = sync_channel(4);
        let (context_tx, context_rx) = sync_channel(4);
        let (ack_tx, _ack_rx) = sync_channel(4);

        let mut filter = crate::filter::FilterSet::new();
        filter
            .add(crate::codec::FourCc::new("APP1"), crate::codec::FourCc::EMPTY)
            .unwrap();
        filter_tx
            .send(FilterCommand::Add { id: 1, filter })
            .unwrap();

        let source = FixedSource {
            messages: vec![sample_message("APP1")],
        };
        let dispatcher = Dispatcher::new(
            source,
            filter_rx,
            context_tx,
            ack_tx,
            TimeCell::new(),
            false,
            None,
        );
        let handle = std::thread::spawn(move || dispatcher.run());

        match context_rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            ContextHandlerMsg::Dispatch(envelope) => {
                assert_eq!(envelope.matched, vec![1]);
                assert_eq!(envelope.message.apid().to_string(), "APP1");
            }
            _ => panic!("expected Dispatch"),
        }

        handle.join().unwrap();
        let _ = filter_tx;
    }
}
