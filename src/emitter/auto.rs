use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    EmitterError,
    dispatcher::{Dispatcher, ListenerFuture, Subscription},
    emitter::fetch::EventsEmitter,
    producer::{BlockProducer, ProducerMessage},
    types::{Batch, BlockRef, Channel, EmitterEvent},
};

/// Where the emitter is in its lifecycle.
///
/// ```text
///  Created ──start()──► Initializing ──init done──► Running
///     ▲                                                │
///     │ init failed                               stop()
///     │                                                ▼
///     └──────────────── Stopped ◄──────────────── Stopping
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// Drives an [`EventsEmitter`] from a [`BlockProducer`].
///
/// On the first start it drains history from the persisted cursor (or the
/// configured starting block) and emits `initFinished`; afterwards every
/// produced header triggers one fetch cycle followed by the confirmation
/// routine. With `auto_start` (the default) the lifecycle follows the
/// `newEvent` subscriber count: the first subscription starts the
/// emitter, dropping the last one stops it.
pub struct AutoEventsEmitter {
    emitter: EventsEmitter,
    producer: Arc<dyn BlockProducer>,
    state: Mutex<LifecycleState>,
    cancel: Mutex<Option<CancellationToken>>,
    failures: AtomicU64,
}

impl AutoEventsEmitter {
    #[must_use]
    pub fn new(emitter: EventsEmitter, producer: Arc<dyn BlockProducer>) -> Arc<Self> {
        let auto = Arc::new(Self {
            emitter,
            producer,
            state: Mutex::new(LifecycleState::Created),
            cancel: Mutex::new(None),
            failures: AtomicU64::new(0),
        });

        if auto.emitter.inner().auto_start {
            Self::spawn_autostart_watcher(&auto);
        }

        auto
    }

    /// The underlying manual emitter.
    #[must_use]
    pub fn emitter(&self) -> &EventsEmitter {
        &self.emitter
    }

    /// The dispatcher carrying this emitter's channels.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        self.emitter.dispatcher()
    }

    /// Registers a listener on one of the emitter's channels.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe<F>(&self, channel: Channel, listener: F) -> Subscription
    where
        F: Fn(EmitterEvent) -> ListenerFuture + Send + Sync + 'static,
    {
        self.emitter.subscribe(channel, listener)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().expect("lifecycle mutex poisoned")
    }

    /// Number of processing-loop failures since construction.
    ///
    /// Failures never stop the loop, but a climbing counter is the signal
    /// that something persistent is wrong upstream.
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Starts the emitter: runs the historical catch-up if no fetch
    /// cursor is persisted, then subscribes to the block producer.
    ///
    /// Calling `start` on an emitter that is not `Created` or `Stopped`
    /// is a no-op. An initialization failure is routed to the `error`
    /// channel and returns the state to `Created`.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("lifecycle mutex poisoned");
            match *state {
                LifecycleState::Created | LifecycleState::Stopped => {
                    *state = LifecycleState::Initializing;
                }
                _ => return,
            }
        }

        if let Err(e) = self.init().await {
            error!(error = %e, "initialization failed");
            *self.state.lock().expect("lifecycle mutex poisoned") = LifecycleState::Created;
            return;
        }

        // the token is published before the state flips to Running so a
        // concurrent stop() always finds something to cancel
        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("lifecycle mutex poisoned") = Some(cancel.clone());

        {
            let mut state = self.state.lock().expect("lifecycle mutex poisoned");
            if *state != LifecycleState::Initializing {
                // stop() arrived mid-init
                *state = LifecycleState::Stopped;
                return;
            }
            *state = LifecycleState::Running;
        }

        let receiver = self.producer.subscribe();
        tokio::spawn(run_loop(self.clone(), receiver, cancel));

        info!("emitter running");
    }

    /// Stops the emitter. An in-flight cycle runs to completion so the
    /// cursors are left consistent; only the subscription to new heads is
    /// torn down.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().expect("lifecycle mutex poisoned");
            match *state {
                LifecycleState::Running | LifecycleState::Initializing => {
                    *state = LifecycleState::Stopping;
                }
                _ => return,
            }
        }

        if let Some(cancel) = self.cancel.lock().expect("lifecycle mutex poisoned").take() {
            cancel.cancel();
        }
        info!("emitter stopping");
    }

    async fn init(&self) -> Result<(), EmitterError> {
        if self.emitter.tracker().last_fetched().await.inspect_err(|e| self.dispatch_failure(e))?
            .is_none()
        {
            info!("no fetch cursor persisted, draining history from the starting block");
            let mut batches = self.emitter.fetch(None);
            while let Some(item) = batches.next().await {
                match item {
                    Ok(batch) => {
                        self.deliver_batch(batch)
                            .await
                            .inspect_err(|e| self.dispatch_failure(e))?;
                    }
                    Err(e) => {
                        // the fetch cycle already routed this failure
                        self.count_failure();
                        return Err(e);
                    }
                }
            }
        }

        self.emitter.dispatcher().emit(EmitterEvent::InitFinished).await;
        debug!("initialization finished");
        Ok(())
    }

    async fn process_head(&self, head: BlockRef) {
        trace!(block_number = head.number, "processing new head");

        let mut batches = self.emitter.fetch(Some(head));
        while let Some(item) = batches.next().await {
            match item {
                Ok(batch) => {
                    if let Err(e) = self.deliver_batch(batch).await {
                        self.dispatch_failure(&e);
                        return;
                    }
                }
                Err(_) => {
                    // the fetch cycle already routed this failure; the next
                    // head retries from the unchanged cursor
                    self.count_failure();
                    return;
                }
            }
        }

        if let Some(confirmator) = &self.emitter.inner().confirmator {
            // same gate as fetch, so the routine never races the buffer
            let _gate = self.emitter.inner().fetch_gate.clone().lock_owned().await;
            if let Err(e) = confirmator.run_confirmations_routine(head).await {
                self.dispatch_failure(&e);
            }
        }
    }

    /// Emits progress and hands each confirmed event to the dispatcher,
    /// advancing the processed cursor in source order.
    async fn deliver_batch(&self, batch: Batch) -> Result<(), EmitterError> {
        self.emitter.dispatcher().emit(EmitterEvent::Progress(batch.progress())).await;

        for event in batch.events {
            let block_ref = event.block_ref();
            self.emitter.dispatch_event(EmitterEvent::NewEvent(event)).await;
            self.emitter.tracker().set_last_processed_if_higher(block_ref).await?;
        }

        Ok(())
    }

    fn count_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn dispatch_failure(&self, error: &EmitterError) {
        self.count_failure();
        self.emitter.dispatcher().dispatch_error(error.clone());
    }

    fn spawn_autostart_watcher(auto: &Arc<Self>) {
        let weak = Arc::downgrade(auto);
        let mut subscribers = auto.emitter.dispatcher().new_event_subscribers();

        tokio::spawn(async move {
            loop {
                let count = *subscribers.borrow_and_update();
                let Some(auto) = weak.upgrade() else { break };

                if count > 0 {
                    if matches!(auto.state(), LifecycleState::Created | LifecycleState::Stopped) {
                        debug!(subscribers = count, "first newEvent subscriber, auto-starting");
                        auto.start().await;
                    }
                } else if matches!(
                    auto.state(),
                    LifecycleState::Running | LifecycleState::Initializing
                ) {
                    debug!("last newEvent subscriber gone, auto-stopping");
                    auto.stop();
                }
                drop(auto);

                if subscribers.changed().await.is_err() {
                    break;
                }
            }
        });
    }
}

async fn run_loop(
    auto: Arc<AutoEventsEmitter>,
    mut receiver: broadcast::Receiver<ProducerMessage>,
    cancel: CancellationToken,
) {
    debug!("processing loop started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = receiver.recv() => match message {
                Ok(Ok(head)) => auto.process_head(head).await,
                Ok(Err(e)) => {
                    error!(error = %e, "block producer reported a failure");
                    auto.dispatch_failure(&e);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped_messages = skipped, "head subscription lagged");
                    auto.dispatch_failure(&EmitterError::ProducerLagged(skipped));
                }
                Err(RecvError::Closed) => {
                    warn!("block producer closed");
                    break;
                }
            }
        }
    }

    *auto.state.lock().expect("lifecycle mutex poisoned") = LifecycleState::Stopped;
    debug!("processing loop ended");
}
