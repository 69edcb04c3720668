use async_trait::async_trait;
use log::{debug, error, info, warn};
use pool_lib::{
    ChecksumType, Checksum, EntryState, FileAttributes, NamespaceClient, PnfsId, PoolError,
    PoolResult, StickyRecord, unix_millis,
};
use replica_store::{Repository, WriteHandle};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

static NEXT_COMPANION_ID: AtomicU64 = AtomicU64::new(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// Keep-alive interval towards the source mover while transferring.
    pub ping_period_ms: u64,
    /// How long to wait for file attributes or for the source to answer.
    pub reply_timeout_ms: u64,
    pub buffer_size: usize,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            ping_period_ms: 5 * 60 * 1000,
            reply_timeout_ms: 5 * 60 * 1000,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

pub type SourceStream = Box<dyn AsyncRead + Send + Unpin>;

/// The pool a replica is copied from.
#[async_trait]
pub trait SourcePool: Send + Sync {
    fn name(&self) -> &str;

    /// Asks the source to start a mover for `pnfs_id`. The mover later
    /// announces its URL through `Companion::door_url_arrived`.
    async fn deliver(&self, pnfs_id: &PnfsId, companion_id: u64, destination: &str)
        -> PoolResult<u64>;

    async fn ping(&self, mover_id: u64) -> PoolResult<()>;

    /// Opens the mover URL, returning the advertised content length.
    async fn open_stream(&self, uri: &str) -> PoolResult<(u64, SourceStream)>;
}

/// Completion callback, `error` is `None` on success.
pub trait CacheFileAvailable: Send + Sync {
    fn cache_file_available(&self, pnfs_id: &PnfsId, error: Option<&PoolError>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionState {
    Idle,
    AwaitingStorageInfo,
    RequestingDelivery,
    Transferring,
    Done,
    Failed,
}

impl CompanionState {
    pub fn is_finished(&self) -> bool {
        matches!(self, CompanionState::Done | CompanionState::Failed)
    }
}

impl fmt::Display for CompanionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompanionState::Idle => "Idle",
            CompanionState::AwaitingStorageInfo => "WaitingForStorageInfo",
            CompanionState::RequestingDelivery => "WaitingForDelivery",
            CompanionState::Transferring => "Transferring",
            CompanionState::Done => "Done",
            CompanionState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct CompanionRequest {
    pub attributes: FileAttributes,
    pub target_state: EntryState,
    pub sticky_records: Vec<StickyRecord>,
    /// Access time given to the new replica, e.g. the one of the source copy.
    pub access_time: Option<i64>,
}

#[derive(Debug)]
enum CompanionEvent {
    AttributesArrived(PoolResult<FileAttributes>),
    DeliveryAccepted(PoolResult<u64>),
    DoorUrlArrived(String),
    DoorTransferFinished(PoolResult<()>),
    TransferEnded(PoolResult<()>),
    PingFailed(PoolError),
    Cancel(String),
}

/// Copies one replica from a source pool into the local repository.
pub struct Companion {
    id: u64,
    pnfs_id: PnfsId,
    source_name: String,
    started: i64,
    state: Arc<Mutex<CompanionState>>,
    events: mpsc::UnboundedSender<CompanionEvent>,
    result: watch::Receiver<Option<PoolResult<()>>>,
}

impl Companion {
    pub fn start(
        repository: Arc<Repository>,
        namespace: Arc<dyn NamespaceClient>,
        source: Arc<dyn SourcePool>,
        request: CompanionRequest,
        config: CompanionConfig,
        callback: Option<Arc<dyn CacheFileAvailable>>,
    ) -> Arc<Companion> {
        let id = NEXT_COMPANION_ID.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(Mutex::new(CompanionState::Idle));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = watch::channel(None);

        let companion = Arc::new(Companion {
            id,
            pnfs_id: request.attributes.pnfs_id.clone(),
            source_name: source.name().to_string(),
            started: unix_millis(),
            state: state.clone(),
            events: events_tx.clone(),
            result: result_rx,
        });

        let driver = CompanionDriver {
            id,
            repository,
            namespace,
            source,
            config,
            request,
            state,
            events: events_tx,
            mover_id: None,
            transfer_cancel: CancellationToken::new(),
            error: None,
            deadline: None,
            callback,
            result: result_tx,
        };
        tokio::spawn(driver.run(events_rx));
        companion
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pnfs_id(&self) -> &PnfsId {
        &self.pnfs_id
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn started(&self) -> i64 {
        self.started
    }

    pub fn state(&self) -> CompanionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The source mover announced where to fetch the data.
    pub fn door_url_arrived(&self, uri: &str) {
        self.send(CompanionEvent::DoorUrlArrived(uri.to_string()));
    }

    /// The source mover finished its side of the transfer.
    pub fn door_transfer_finished(&self, result: PoolResult<()>) {
        self.send(CompanionEvent::DoorTransferFinished(result));
    }

    /// Aborts the companion. Returns whether it had not yet completed.
    pub fn cancel(&self, cause: &str) -> bool {
        self.send(CompanionEvent::Cancel(cause.to_string()));
        self.state() != CompanionState::Done
    }

    fn send(&self, event: CompanionEvent) {
        if let Err(e) = self.events.send(event) {
            debug!("Companion {}: event after completion: {:?}", self.id, e.0);
        }
    }

    /// Waits for the outcome of the copy.
    pub async fn wait(&self) -> PoolResult<()> {
        let mut result = self.result.clone();
        loop {
            let current = result.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if result.changed().await.is_err() {
                let current = result.borrow().clone();
                return current.unwrap_or_else(|| {
                    Err(PoolError::Internal(format!("companion {} vanished", self.id)))
                });
            }
        }
    }
}

impl fmt::Display for Companion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} from {}",
            self.id,
            self.pnfs_id,
            self.state(),
            self.source_name
        )
    }
}

struct CompanionDriver {
    id: u64,
    repository: Arc<Repository>,
    namespace: Arc<dyn NamespaceClient>,
    source: Arc<dyn SourcePool>,
    config: CompanionConfig,
    request: CompanionRequest,
    state: Arc<Mutex<CompanionState>>,
    events: mpsc::UnboundedSender<CompanionEvent>,
    mover_id: Option<u64>,
    transfer_cancel: CancellationToken,
    /// First error seen; wins over whatever the aborted transfer reports.
    error: Option<PoolError>,
    deadline: Option<Instant>,
    callback: Option<Arc<dyn CacheFileAvailable>>,
    result: watch::Sender<Option<PoolResult<()>>>,
}

impl CompanionDriver {
    fn state(&self) -> CompanionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: CompanionState) {
        debug!(
            "Companion {}: {} -> {}",
            self.id,
            self.state(),
            state
        );
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn pnfs_id(&self) -> &PnfsId {
        &self.request.attributes.pnfs_id
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<CompanionEvent>) {
        let period = Duration::from_millis(self.config.ping_period_ms.max(1));
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.begin();
        while !self.state().is_finished() {
            let deadline = self.deadline;
            let may_ping = self.state() == CompanionState::Transferring
                && self.mover_id.is_some()
                && self.error.is_none();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.timer();
                }
                _ = ping.tick(), if may_ping => {
                    self.send_ping();
                }
            }
        }
        self.done();
    }

    fn begin(&mut self) {
        let attrs = &self.request.attributes;
        if attrs.size.is_some() {
            self.request_delivery();
            return;
        }

        self.set_state(CompanionState::AwaitingStorageInfo);
        self.arm_timer();
        let namespace = self.namespace.clone();
        let pnfs_id = self.pnfs_id().clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let attrs = namespace.get_file_attributes(&pnfs_id).await;
            let _ = events.send(CompanionEvent::AttributesArrived(attrs));
        });
    }

    fn request_delivery(&mut self) {
        self.set_state(CompanionState::RequestingDelivery);
        self.arm_timer();
        let source = self.source.clone();
        let pnfs_id = self.pnfs_id().clone();
        let destination = self.repository.pool_name().to_string();
        let events = self.events.clone();
        let id = self.id;
        tokio::spawn(async move {
            let accepted = source.deliver(&pnfs_id, id, &destination).await;
            let _ = events.send(CompanionEvent::DeliveryAccepted(accepted));
        });
    }

    fn begin_transfer(&mut self, uri: String) {
        self.deadline = None;
        self.set_state(CompanionState::Transferring);
        let transfer = Transfer {
            repository: self.repository.clone(),
            source: self.source.clone(),
            request: self.request.clone(),
            buffer_size: self.config.buffer_size.max(1),
            cancel: self.transfer_cancel.clone(),
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = transfer.run(&uri).await;
            let _ = events.send(CompanionEvent::TransferEnded(result));
        });
    }

    fn arm_timer(&mut self) {
        self.deadline = Some(Instant::now() + Duration::from_millis(self.config.reply_timeout_ms));
    }

    fn handle(&mut self, event: CompanionEvent) {
        use CompanionEvent::*;
        use CompanionState::*;

        match (self.state(), event) {
            (AwaitingStorageInfo, AttributesArrived(Ok(mut attrs))) => {
                attrs.pnfs_id = self.pnfs_id().clone();
                self.request.attributes = attrs;
                self.request_delivery();
            }
            (AwaitingStorageInfo, AttributesArrived(Err(e))) => self.fail(e),
            (RequestingDelivery | Transferring, DeliveryAccepted(Ok(mover_id))) => {
                debug!("Companion {}: source mover {}", self.id, mover_id);
                self.mover_id = Some(mover_id);
            }
            (RequestingDelivery, DeliveryAccepted(Err(e))) => self.fail(e),
            (RequestingDelivery, DoorUrlArrived(uri)) => self.begin_transfer(uri),
            (Transferring, TransferEnded(result)) => match (self.error.take(), result) {
                (Some(e), _) | (None, Err(e)) => self.fail(e),
                (None, Ok(())) => self.set_state(Done),
            },
            (Transferring, DoorTransferFinished(Ok(()))) => {
                debug!("Companion {}: source reports transfer finished", self.id);
            }
            (Transferring, DoorTransferFinished(Err(e))) | (Transferring, PingFailed(e)) => {
                self.abort(e)
            }
            (Transferring, Cancel(cause)) => self.abort(PoolError::Interrupted(cause)),
            (state, Cancel(cause)) if !state.is_finished() => {
                self.fail(PoolError::Interrupted(cause))
            }
            (state, event) => {
                debug!(
                    "Companion {}: ignoring {:?} in state {}",
                    self.id, event, state
                );
            }
        }
    }

    fn timer(&mut self) {
        self.deadline = None;
        match self.state() {
            CompanionState::AwaitingStorageInfo => self.fail(PoolError::Timeout(
                "timeout waiting for file attributes".to_string(),
            )),
            CompanionState::RequestingDelivery => self.fail(PoolError::Timeout(format!(
                "timeout waiting for {} to deliver",
                self.source.name()
            ))),
            _ => {}
        }
    }

    fn send_ping(&self) {
        let Some(mover_id) = self.mover_id else {
            return;
        };
        let source = self.source.clone();
        let events = self.events.clone();
        let id = self.id;
        tokio::spawn(async move {
            if let Err(e) = source.ping(mover_id).await {
                match &e {
                    PoolError::NoRoute(_) => warn!("Companion {}: source pool is unreachable", id),
                    PoolError::Timeout(_) => warn!("Companion {}: ping of mover timed out", id),
                    _ => warn!("Companion {}: ping failed: {}", id, e),
                }
                let _ = events.send(CompanionEvent::PingFailed(e));
            }
        });
    }

    /// Stops a running transfer; the companion fails once the transfer has
    /// closed its handle.
    fn abort(&mut self, err: PoolError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.transfer_cancel.cancel();
    }

    fn fail(&mut self, err: PoolError) {
        self.error = Some(err);
        self.deadline = None;
        self.set_state(CompanionState::Failed);
    }

    fn done(&mut self) {
        let outcome = match self.error.take() {
            None if self.state() == CompanionState::Done => Ok(()),
            None => Err(PoolError::Interrupted("companion stopped".to_string())),
            Some(e) => Err(e),
        };

        match &outcome {
            Ok(()) => info!("P2P for {} completed", self.pnfs_id()),
            Err(e) => error!("P2P for {} failed: {}", self.pnfs_id(), e),
        }
        if let Some(callback) = &self.callback {
            callback.cache_file_available(self.pnfs_id(), outcome.as_ref().err());
        }
        let _ = self.result.send(Some(outcome));
    }
}

struct Transfer {
    repository: Arc<Repository>,
    source: Arc<dyn SourcePool>,
    request: CompanionRequest,
    buffer_size: usize,
    cancel: CancellationToken,
}

impl Transfer {
    fn interrupted(&self) -> PoolError {
        PoolError::Interrupted(format!("transfer of {} aborted", self.request.attributes.pnfs_id))
    }

    async fn run(&self, uri: &str) -> PoolResult<()> {
        if self.cancel.is_cancelled() {
            return Err(self.interrupted());
        }
        let handle = self
            .repository
            .create_entry(
                self.request.attributes.clone(),
                EntryState::FromPool,
                self.request.target_state,
                self.request.sticky_records.clone(),
            )
            .await?;

        let result = match self.copy(&handle, uri).await {
            Ok(checksum) => {
                let atime = match self.request.access_time {
                    Some(atime) => handle.set_last_access_time(atime),
                    None => Ok(()),
                };
                match atime {
                    Ok(()) => handle.commit(Some(checksum)).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        let closed = handle.close().await;
        if let Err(e) = &closed {
            warn!("Companion: closing {} failed: {}", handle.pnfs_id(), e);
        }
        result.and(closed)
    }

    async fn copy(&self, handle: &WriteHandle, uri: &str) -> PoolResult<Checksum> {
        let (length, mut stream) = self.source.open_stream(uri).await?;
        if let Some(expected) = self.request.attributes.size {
            if length != expected {
                return Err(PoolError::SizeMismatch(format!(
                    "content length {} does not match file size {}",
                    length, expected
                )));
            }
        }

        let kind = handle
            .get_checksums()
            .ok()
            .and_then(|known| known.first().map(|c| c.kind))
            .unwrap_or(ChecksumType::Sha256);
        let mut hasher = kind.create_hasher();

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(handle.get_file())
            .await?;
        let mut buffer = vec![0u8; self.buffer_size];
        let mut received: u64 = 0;
        while received < length {
            let want = (length - received).min(buffer.len() as u64) as usize;
            let n = tokio::select! {
                read = stream.read(&mut buffer[..want]) => read?,
                _ = self.cancel.cancelled() => return Err(self.interrupted()),
            };
            if n == 0 {
                return Err(PoolError::IoError(format!(
                    "unexpected end of stream after {} of {} bytes",
                    received, length
                )));
            }
            tokio::select! {
                allocated = handle.allocate(n as u64) => allocated?,
                _ = self.cancel.cancelled() => return Err(self.interrupted()),
            }
            file.write_all(&buffer[..n]).await?;
            hasher.update(&buffer[..n]);
            received += n as u64;
        }

        file.flush().await?;
        if let Err(e) = file.sync_all().await {
            warn!("Companion: sync of {} failed: {}", handle.pnfs_id(), e);
        }
        Ok(hasher.finish())
    }
}
