use log::{debug, error};
use pool_lib::{PoolError, PoolResult};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    total: u64,
    used: u64,
    precious: u64,
}

/// Space bookkeeping for the pool.
///
/// All counters live behind one lock; `allocate` parks on a `Notify` until
/// enough space is credited back or the caller's token is cancelled.
pub struct Allocator {
    counters: Mutex<Counters>,
    space_freed: Notify,
}

impl Allocator {
    pub fn new(total: u64) -> Self {
        Self {
            counters: Mutex::new(Counters {
                total,
                ..Default::default()
            }),
            space_freed: Notify::new(),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        // counters are plain integers, a poisoned guard is still consistent
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits until `bytes` are free and debits them.
    ///
    /// Returns `PoolError::Interrupted` if `cancel` fires first, in which
    /// case nothing has been debited.
    pub async fn allocate(&self, bytes: u64, cancel: &CancellationToken) -> PoolResult<()> {
        if bytes == 0 {
            return Ok(());
        }

        loop {
            let notified = self.space_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Err(PoolError::Interrupted(format!(
                    "allocation of {} bytes cancelled",
                    bytes
                )));
            }
            if self.try_allocate(bytes) {
                return Ok(());
            }

            debug!("allocator: waiting for {} bytes", bytes);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(PoolError::Interrupted(format!(
                        "allocation of {} bytes cancelled",
                        bytes
                    )));
                }
                _ = &mut notified => {}
            }
        }
    }

    pub fn try_allocate(&self, bytes: u64) -> bool {
        let mut counters = self.counters();
        if counters.total.saturating_sub(counters.used) >= bytes {
            counters.used += bytes;
            true
        } else {
            false
        }
    }

    /// Credits `bytes` back. Freeing more than is used is a bookkeeping bug
    /// elsewhere and only gets logged.
    pub fn free(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        {
            let mut counters = self.counters();
            if bytes > counters.used {
                error!(
                    "allocator: freeing {} bytes but only {} are used",
                    bytes, counters.used
                );
                counters.used = 0;
            } else {
                counters.used -= bytes;
            }
        }
        self.space_freed.notify_waiters();
    }

    /// Accounts space already occupied on disk, e.g. found by the inventory.
    pub fn add_used(&self, bytes: u64) {
        let mut counters = self.counters();
        counters.used = counters.used.saturating_add(bytes);
    }

    pub fn adjust_precious(&self, delta: i64) {
        let mut counters = self.counters();
        if delta >= 0 {
            counters.precious = counters.precious.saturating_add(delta as u64);
        } else {
            let dec = delta.unsigned_abs();
            if dec > counters.precious {
                error!(
                    "allocator: precious space would become negative ({} - {})",
                    counters.precious, dec
                );
                counters.precious = 0;
            } else {
                counters.precious -= dec;
            }
        }
    }

    pub fn set_total(&self, total: u64) {
        self.counters().total = total;
        self.space_freed.notify_waiters();
    }

    pub fn total(&self) -> u64 {
        self.counters().total
    }

    pub fn used(&self) -> u64 {
        self.counters().used
    }

    pub fn free_space(&self) -> u64 {
        let counters = self.counters();
        counters.total.saturating_sub(counters.used)
    }

    pub fn precious(&self) -> u64 {
        self.counters().precious
    }
}
