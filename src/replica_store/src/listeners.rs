use crate::record::CacheEntry;
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, warn};
use pool_lib::{EntryState, PnfsId, PoolResult, StickyRecord};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub pnfs_id: PnfsId,
    pub old_state: EntryState,
    pub new_state: EntryState,
    pub entry: CacheEntry,
}

#[derive(Debug, Clone)]
pub struct EntryChangeEvent {
    pub old_entry: CacheEntry,
    pub new_entry: CacheEntry,
}

#[derive(Debug, Clone)]
pub struct StickyChangeEvent {
    pub old_entry: CacheEntry,
    pub new_entry: CacheEntry,
    pub sticky: StickyRecord,
}

#[derive(Debug, Clone)]
pub enum RepositoryEvent {
    StateChanged(StateChangeEvent),
    AccessTimeChanged(EntryChangeEvent),
    StickyChanged(StickyChangeEvent),
}

/// Observer of replica changes. Errors and panics are logged by the
/// dispatcher and never reach the repository.
#[async_trait]
pub trait StateChangeListener: Send + Sync {
    async fn state_changed(&self, event: &StateChangeEvent) -> PoolResult<()>;

    async fn access_time_changed(&self, _event: &EntryChangeEvent) -> PoolResult<()> {
        Ok(())
    }

    async fn sticky_changed(&self, _event: &StickyChangeEvent) -> PoolResult<()> {
        Ok(())
    }
}

enum ListenerMessage {
    Event(RepositoryEvent),
    Flush(oneshot::Sender<()>),
}

type ListenerList = Arc<RwLock<Vec<Arc<dyn StateChangeListener>>>>;

/// FIFO fan-out of repository events, drained by a single worker task.
pub struct StateChangeListeners {
    listeners: ListenerList,
    sender: mpsc::UnboundedSender<ListenerMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StateChangeListeners {
    /// Must be called inside a tokio runtime, the worker is spawned here.
    pub fn new() -> Self {
        let listeners: ListenerList = Arc::new(RwLock::new(Vec::new()));
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run_worker(listeners.clone(), receiver));
        Self {
            listeners,
            sender,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn add(&self, listener: Arc<dyn StateChangeListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(listener);
    }

    pub fn remove(&self, listener: &Arc<dyn StateChangeListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues `event`; never blocks.
    pub fn notify(&self, event: RepositoryEvent) {
        if self.sender.send(ListenerMessage::Event(event)).is_err() {
            warn!("StateChangeListeners: worker stopped, event dropped");
        }
    }

    pub fn state_changed(&self, event: StateChangeEvent) {
        self.notify(RepositoryEvent::StateChanged(event));
    }

    pub fn access_time_changed(&self, event: EntryChangeEvent) {
        self.notify(RepositoryEvent::AccessTimeChanged(event));
    }

    pub fn sticky_changed(&self, event: StickyChangeEvent) {
        self.notify(RepositoryEvent::StickyChanged(event));
    }

    /// Resolves once every event queued before the call has been delivered.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(ListenerMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Delivers what is queued, then stops the worker.
    pub async fn stop(&self) {
        self.flush().await;
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            worker.abort();
        }
    }

    async fn run_worker(
        listeners: ListenerList,
        mut receiver: mpsc::UnboundedReceiver<ListenerMessage>,
    ) {
        while let Some(message) = receiver.recv().await {
            match message {
                ListenerMessage::Event(event) => {
                    let targets: Vec<Arc<dyn StateChangeListener>> = listeners
                        .read()
                        .map(|l| l.clone())
                        .unwrap_or_default();
                    for listener in targets {
                        Self::deliver(listener.as_ref(), &event).await;
                    }
                }
                ListenerMessage::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("StateChangeListeners: worker exits");
    }

    async fn deliver(listener: &dyn StateChangeListener, event: &RepositoryEvent) {
        let call = async {
            match event {
                RepositoryEvent::StateChanged(e) => listener.state_changed(e).await,
                RepositoryEvent::AccessTimeChanged(e) => listener.access_time_changed(e).await,
                RepositoryEvent::StickyChanged(e) => listener.sticky_changed(e).await,
            }
        };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("StateChangeListeners: listener failed on {:?}: {}", event, e),
            Err(_) => error!("StateChangeListeners: listener panicked on {:?}", event),
        }
    }
}

impl Drop for StateChangeListeners {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(worker) = worker.take() {
                worker.abort();
            }
        }
    }
}
