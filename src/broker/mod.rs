//! C7 — the broker façade: wires a [`Source`] to a dispatcher thread, a
//! context handler thread, and an ack dispatcher thread, and exposes
//! the small lifecycle API a caller needs (spec §4.7). Grounded in
//! `DLTBroker` (`start`/`add_context`/`remove_context`/`stop`/`isAlive`).

pub mod ack;
pub mod context_handler;
pub mod dispatcher;
pub mod time_cell;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::codec::DltMessage;
use crate::filter::FilterSet;
use crate::source::Source;

use ack::{AckDispatcher, AckRequest, PendingAck};
use context_handler::{ContextHandler, ContextHandlerMsg, ContextId};
use dispatcher::{Dispatcher, FilterCommand};
use time_cell::TimeCell;

/// Channel capacities, all small and bounded per spec §5 ("no
/// unbounded buffering between threads").
const FILTER_CHANNEL_CAPACITY: usize = 64;
const CONTEXT_CHANNEL_CAPACITY: usize = 1024;
const ACK_CHANNEL_CAPACITY: usize = 64;
/// Default per-subscriber queue depth, used when a caller doesn't
/// provide its own via [`Broker::add_context_with_capacity`].
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("source error: {0}")]
    Source(#[from] crate::source::SourceError),

    #[error("filter error: {0}")]
    Filter(#[from] crate::filter::FilterError),

    #[error("dispatcher is not running")]
    NotRunning,

    #[error("timed out waiting for context {0} registration to be acknowledged")]
    AckTimeout(ContextId),

    #[error("the shared time cell is disabled (Config::enable_time_cell is false)")]
    TimeCellDisabled,
}

/// Per-run broker options (spec §4.7). Not persisted — ambient
/// defaults for these live in [`crate::config::Settings`] instead.
#[derive(Clone, Debug)]
pub struct Config {
    /// How long `add_context`/`remove_context` wait for the dispatcher
    /// to acknowledge a filter change before giving up. Only consulted
    /// when `enable_filter_ack` is `true`.
    pub ack_timeout: Duration,
    /// When an ack times out, log and proceed (`true`) instead of
    /// returning [`BrokerError::AckTimeout`] (`false`).
    pub ignore_ack_timeout: bool,
    /// Bounded queue depth for each subscriber's message channel.
    pub subscriber_capacity: usize,
    /// Whether `add_context` waits for the dispatcher to acknowledge a
    /// filter registration before returning. Off by default: most
    /// callers don't need the round-trip, and paying for it
    /// unconditionally was never part of the original façade's
    /// contract (`DLTBroker.add_context` doesn't block on one either).
    pub enable_filter_ack: bool,
    /// Whether the dispatcher publishes the timestamp of each
    /// delivered message to the shared time cell. Off by default;
    /// [`Broker::current_time`] fails while disabled rather than
    /// returning a stale or zero reading.
    pub enable_time_cell: bool,
    /// When set, the dispatcher appends every raw frame it receives
    /// from the source to this file, before filter matching, as a
    /// verbatim capture independent of any subscriber (spec §4.7).
    pub sink_file: Option<PathBuf>,
    /// Timeout for establishing a socket connection (`SocketSource`).
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ack_timeout: Duration::from_secs(2),
            ignore_ack_timeout: false,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            enable_filter_ack: false,
            enable_time_cell: false,
            sink_file: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh, process-unique context id.
pub fn next_context_id() -> ContextId {
    NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A running broker: one dispatcher thread, one context handler
/// thread, and one ack dispatcher thread, connected by bounded
/// channels with no shared mutable state besides the time cell.
pub struct Broker {
    config: Config,
    filter_tx: SyncSender<FilterCommand>,
    context_tx: SyncSender<ContextHandlerMsg>,
    pending_ack_tx: SyncSender<PendingAck>,
    time_cell: TimeCell,
    alive: std::sync::Arc<AtomicBool>,
    dispatcher_handle: Option<JoinHandle<()>>,
    context_handle: Option<JoinHandle<()>>,
    ack_handle: Option<JoinHandle<()>>,
}

impl Broker {
    /// Starts the three worker threads over `source` (spec §4.7
    /// `start`).
    pub fn start<S>(source: S, config: Config) -> Self
    where
        S: Source + Send + 'static,
    {
        let (filter_tx, filter_rx) = sync_channel(FILTER_CHANNEL_CAPACITY);
        let (context_tx, context_rx) = sync_channel::<ContextHandlerMsg>(CONTEXT_CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = sync_channel::<AckRequest>(ACK_CHANNEL_CAPACITY);
        let (pending_ack_tx, pending_ack_rx) = sync_channel::<PendingAck>(ACK_CHANNEL_CAPACITY);

        let time_cell = TimeCell::new();
        let alive = std::sync::Arc::new(AtomicBool::new(true));

        let sink = config.sink_file.as_ref().and_then(|path| {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Some(file),
                Err(e) => {
                    log::warn!("failed to open sink file {}: {e}, proceeding without one", path.display());
                    None
                }
            }
        });

        let dispatcher = Dispatcher::new(
            source,
            filter_rx,
            context_tx.clone(),
            ack_tx,
            time_cell.clone(),
            config.enable_time_cell,
            sink,
        );
        let alive_for_dispatcher = alive.clone();
        let dispatcher_handle = std::thread::spawn(move || {
            dispatcher.run();
            alive_for_dispatcher.store(false, Ordering::SeqCst);
        });

        let context_handler = ContextHandler::new(context_rx);
        let context_handle = std::thread::spawn(move || context_handler.run());

        let ack_dispatcher = AckDispatcher::new(
            ack_rx,
            pending_ack_rx,
            config.ack_timeout,
            config.ignore_ack_timeout,
        );
        let ack_handle = std::thread::spawn(move || ack_dispatcher.run());

        Broker {
            config,
            filter_tx,
            context_tx,
            pending_ack_tx,
            time_cell,
            alive,
            dispatcher_handle: Some(dispatcher_handle),
            context_handle: Some(context_handle),
            ack_handle: Some(ack_handle),
        }
    }

    /// Registers a new subscriber matching `filter`, returning its
    /// receiver and context id once the dispatcher has acknowledged
    /// the registration (or the ack timeout elapses; spec §4.7, §8
    /// ack-timeout scenario).
    pub fn add_context(
        &self,
        filter: FilterSet,
    ) -> Result<(ContextId, Receiver<DltMessage>), BrokerError> {
        let id = next_context_id();
        let (sub_tx, sub_rx) = sync_channel(self.config.subscriber_capacity);

        self.context_tx
            .send(ContextHandlerMsg::Register { id, tx: sub_tx })
            .map_err(|_| BrokerError::NotRunning)?;

        if !self.config.enable_filter_ack {
            self.filter_tx
                .send(FilterCommand::Add { id, filter })
                .map_err(|_| BrokerError::NotRunning)?;
            return Ok((id, sub_rx));
        }

        let (reply_tx, reply_rx) = sync_channel(1);
        self.pending_ack_tx
            .send(PendingAck {
                id,
                registered_at: Instant::now(),
                reply: reply_tx,
            })
            .map_err(|_| BrokerError::NotRunning)?;

        self.filter_tx
            .send(FilterCommand::Add { id, filter })
            .map_err(|_| BrokerError::NotRunning)?;

        match reply_rx.recv_timeout(self.config.ack_timeout) {
            Ok(()) => Ok((id, sub_rx)),
            Err(_) if self.config.ignore_ack_timeout => {
                log::warn!("context {id} registration not acknowledged in time, proceeding anyway");
                Ok((id, sub_rx))
            }
            Err(_) => Err(BrokerError::AckTimeout(id)),
        }
    }

    /// Removes a previously-registered subscriber (spec §4.7
    /// `remove_context`).
    pub fn remove_context(&self, id: ContextId) -> Result<(), BrokerError> {
        self.context_tx
            .send(ContextHandlerMsg::Unregister { id })
            .map_err(|_| BrokerError::NotRunning)?;
        self.filter_tx
            .send(FilterCommand::Remove { id })
            .map_err(|_| BrokerError::NotRunning)?;
        Ok(())
    }

    /// The timestamp of the most recently dispatched message, read
    /// from the shared time cell (spec §4.8). Fails when
    /// `Config::enable_time_cell` is `false`, since the dispatcher
    /// never publishes to the cell in that case and a reading would be
    /// permanently stale or zero.
    pub fn current_time(&self) -> Result<f64, BrokerError> {
        if !self.config.enable_time_cell {
            return Err(BrokerError::TimeCellDisabled);
        }
        Ok(self.time_cell.get())
    }

    /// Whether the dispatcher thread is still running.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stops all three worker threads and joins them (spec §4.7
    /// `stop`).
    pub fn stop(mut self) {
        let _ = self.filter_tx.send(FilterCommand::Stop);
        let _ = self.context_tx.send(ContextHandlerMsg::Stop);

        if let Some(h) = self.dispatcher_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.context_handle.take() {
            let _ = h.join();
        }
        // Dropping `pending_ack_tx`/the ack sender inside the dispatcher
        // disconnects the ack dispatcher's channels, which it treats as
        // its own stop signal once no pending acks remain.
        if let Some(h) = self.ack_handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{PollOutcome, SourceError};

    struct EmptySource;

    impl Source for EmptySource {
        fn poll(&mut self) -> Result<PollOutcome, SourceError> {
            Ok(PollOutcome::Pending)
        }
        fn stop(&mut self) {}
    }

    #[test]
    fn start_and_stop_joins_all_threads() {
        let broker = Broker::start(EmptySource, Config::default());
        assert!(broker.is_alive());
        broker.stop();
    }

    #[test]
    fn add_context_returns_a_receiver() {
        let broker = Broker::start(EmptySource, Config::default());
        let (id, _rx) = broker.add_context(FilterSet::new()).unwrap();
        assert!(id > 0);
        broker.stop();
    }
}
