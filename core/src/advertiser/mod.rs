//! Advertiser sequencer
//!
//! Serializes one outbound message onto the radio: split into chunks, put
//! each chunk on air for the dwell period, pause for the inter-chunk gap,
//! then signal completion. Cancellation stops the radio immediately and
//! drops the remaining chunks; starting a new message cancels the sequence
//! already in flight.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::adapter::BleAdapter;
use crate::config::VuelinkConfig;
use crate::message::{self, CodecError, Fragment, Message};

/// Observable sequencer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Advertising { part: u8, total: u8 },
    Gap { next: u8, total: u8 },
}

struct Inner {
    cancel: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

/// Drives the adapter through one message's chunk sequence at a time
pub struct AdvertiseSequencer {
    adapter: Arc<dyn BleAdapter>,
    config: VuelinkConfig,
    state_tx: watch::Sender<SequencerState>,
    state_rx: watch::Receiver<SequencerState>,
    inner: Mutex<Inner>,
}

struct SequenceParams {
    dwell: Duration,
    gap: Duration,
    name: String,
    manufacturer_id: u16,
    include_service_uuid: bool,
}

impl AdvertiseSequencer {
    pub fn new(adapter: Arc<dyn BleAdapter>, config: VuelinkConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(SequencerState::Idle);
        Self {
            adapter,
            config,
            state_tx,
            state_rx,
            inner: Mutex::new(Inner {
                cancel: None,
                task: None,
            }),
        }
    }

    /// Start advertising a message, cancelling any sequence in flight.
    ///
    /// Returns a completion receiver resolving `true` once the last chunk
    /// left the air, `false` on cancellation or adapter refusal. Split and
    /// validation errors fail the call itself.
    pub fn advertise(
        &self,
        message: Message,
        dwell: Option<Duration>,
    ) -> Result<oneshot::Receiver<bool>, CodecError> {
        let fragments = message::split(&message)?;
        let params = SequenceParams {
            dwell: dwell.unwrap_or(self.config.dwell),
            gap: self.config.chunk_gap,
            name: self.config.device_name.clone(),
            manufacturer_id: self.config.manufacturer_id,
            include_service_uuid: self.config.include_service_uuid,
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        let adapter = Arc::clone(&self.adapter);
        let state_tx = self.state_tx.clone();

        let mut inner = self.inner.lock();
        if let Some(prior) = inner.cancel.replace(cancel_tx) {
            let _ = prior.send(true);
        }
        let prior_task = inner.task.take();
        inner.task = Some(tokio::spawn(async move {
            // Let the cancelled sequence finish stopping the radio before
            // this one touches it.
            if let Some(prior) = prior_task {
                let _ = prior.await;
            }
            let ok = run_sequence(adapter, fragments, params, cancel_rx, state_tx).await;
            let _ = done_tx.send(ok);
        }));
        Ok(done_rx)
    }

    /// Cancel the in-flight sequence, if any. Idempotent: stops the radio,
    /// drops the remaining chunks, and reports whether a sequence was
    /// actually running.
    pub async fn cancel(&self) -> bool {
        let was_running = self.is_running();
        if let Some(cancel) = self.inner.lock().cancel.take() {
            let _ = cancel.send(true);
        }
        if was_running {
            self.adapter.stop_advertising().await;
        }
        was_running
    }

    pub fn is_running(&self) -> bool {
        !matches!(*self.state_rx.borrow(), SequencerState::Idle)
    }

    pub fn state(&self) -> watch::Receiver<SequencerState> {
        self.state_rx.clone()
    }
}

async fn run_sequence(
    adapter: Arc<dyn BleAdapter>,
    fragments: Vec<Fragment>,
    params: SequenceParams,
    mut cancel_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<SequencerState>,
) -> bool {
    let total = fragments.len() as u8;
    for (index, fragment) in fragments.iter().enumerate() {
        let part = (index + 1) as u8;
        let payload = match message::encode(fragment) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, part, "chunk encode failed, aborting sequence");
                let _ = state_tx.send(SequencerState::Idle);
                return false;
            }
        };

        let _ = state_tx.send(SequencerState::Advertising { part, total });
        if !adapter
            .start_advertising(
                &params.name,
                params.manufacturer_id,
                &payload,
                params.include_service_uuid,
            )
            .await
        {
            tracing::warn!(part, total, "adapter refused advertisement, aborting sequence");
            let _ = state_tx.send(SequencerState::Idle);
            return false;
        }
        tracing::debug!(part, total, bytes = payload.len(), "chunk on air");

        if wait_or_cancelled(params.dwell, &mut cancel_rx).await {
            adapter.stop_advertising().await;
            let _ = state_tx.send(SequencerState::Idle);
            return false;
        }
        adapter.stop_advertising().await;

        if part < total {
            let _ = state_tx.send(SequencerState::Gap {
                next: part + 1,
                total,
            });
            if wait_or_cancelled(params.gap, &mut cancel_rx).await {
                let _ = state_tx.send(SequencerState::Idle);
                return false;
            }
        }
    }
    let _ = state_tx.send(SequencerState::Idle);
    true
}

/// Sleep for `duration`, returning `true` early if cancellation fires.
/// A dropped cancel handle counts as cancellation: the owning sequencer is
/// gone and the radio must not be left on.
async fn wait_or_cancelled(duration: Duration, cancel_rx: &mut watch::Receiver<bool>) -> bool {
    if *cancel_rx.borrow() {
        return true;
    }
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = cancel_rx.changed() => match changed {
                Ok(()) if *cancel_rx.borrow() => return true,
                Ok(()) => continue,
                Err(_) => return true,
            },
        }
    }
}
