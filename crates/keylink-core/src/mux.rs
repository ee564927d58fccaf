//! Command/notification demultiplexer.
//!
//! Sits above `SecureSession` and below `LockApi`. The pending-request
//! table is a `dashmap::DashMap<u8, oneshot::Sender<...>>`: the sender is
//! registered before the write goes out, closing the race where the device
//! answers before the waiter exists. The notification bus is a
//! `tokio::sync::broadcast` channel, so late subscribers never see prior
//! notifications.
//!
//! A per-command `tokio::sync::Mutex` serializes sequential requests for
//! the same command byte while leaving distinct command bytes free to
//! proceed concurrently.

use crate::error::Error;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

const NOTIFICATION_BUS_CAPACITY: usize = 64;

/// Demultiplexes decrypted `(command, payload)` messages into
/// request/response correlation and notification fan-out.
pub struct CommandMux {
    locks: DashMap<u8, Arc<AsyncMutex<()>>>,
    pending: DashMap<u8, oneshot::Sender<Vec<u8>>>,
    notify_tx: broadcast::Sender<(u8, Vec<u8>)>,
}

impl CommandMux {
    /// Build an empty mux.
    #[must_use]
    pub fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_BUS_CAPACITY);
        Self {
            locks: DashMap::new(),
            pending: DashMap::new(),
            notify_tx,
        }
    }

    /// Subscribe to the notification bus. There is no backlog: this
    /// subscriber will not see notifications dispatched before this call.
    #[must_use]
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<(u8, Vec<u8>)> {
        self.notify_tx.subscribe()
    }

    /// Dispatch a decrypted indication message to its waiter, if any is
    /// currently armed. Indications with no waiter are dropped (the
    /// request already timed out, or nothing ever asked for this command).
    pub fn dispatch_indication(&self, command: u8, payload: Vec<u8>) {
        if let Some((_, sender)) = self.pending.remove(&command) {
            let _ = sender.send(payload);
        } else {
            tracing::debug!(command, "indication arrived with no waiter armed");
        }
    }

    /// Dispatch a decrypted notification message to the fan-out bus.
    pub fn dispatch_notification(&self, notification_type: u8, payload: Vec<u8>) {
        let _ = self.notify_tx.send((notification_type, payload));
    }

    fn command_lock(&self, command: u8) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(command)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn arm_waiter(&self, command: u8) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(command, tx);
        rx
    }

    /// Issue a request and wait for the matching indication.
    ///
    /// `write` is invoked only after the waiter is armed, closing the
    /// device-answers-before-subscription race. Sequential
    /// calls for the same `command` serialize against each other; calls
    /// for distinct commands never block one another.
    ///
    /// `cancel` is raced against the whole operation: a cancellation tears
    /// down this waiter (removing it from the pending table so a stray late
    /// indication is dropped rather than misrouted) without affecting the
    /// underlying session or any other in-flight request.
    ///
    /// # Errors
    ///
    /// Returns whatever `write` or `map_fn` returns, [`Error::Timeout`] if
    /// no matching indication arrives within `timeout_duration`, or
    /// [`Error::Cancelled`] if `cancel` fires first.
    pub async fn request<T, W, M>(
        &self,
        command: u8,
        write: W,
        map_fn: M,
        timeout_duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, Error>
    where
        W: Future<Output = Result<(), Error>>,
        M: FnOnce(&[u8]) -> Result<T, Error>,
    {
        tokio::select! {
            result = self.request_inner(command, write, map_fn, timeout_duration) => result,
            () = cancel.cancelled() => {
                self.pending.remove(&command);
                Err(Error::Cancelled)
            }
        }
    }

    async fn request_inner<T, W, M>(
        &self,
        command: u8,
        write: W,
        map_fn: M,
        timeout_duration: Duration,
    ) -> Result<T, Error>
    where
        W: Future<Output = Result<(), Error>>,
        M: FnOnce(&[u8]) -> Result<T, Error>,
    {
        let lock = self.command_lock(command);
        let _guard = lock.lock().await;

        let rx = self.arm_waiter(command);
        if let Err(err) = write.await {
            self.pending.remove(&command);
            return Err(err);
        }

        match tokio::time::timeout(timeout_duration, rx).await {
            Ok(Ok(payload)) => map_fn(&payload),
            Ok(Err(_)) => Err(Error::Timeout(command)),
            Err(_) => {
                self.pending.remove(&command);
                Err(Error::Timeout(command))
            }
        }
    }

    /// Wait for the next notification of `notification_type`, optionally
    /// filtered by a predicate on the payload bytes.
    ///
    /// `cancel` is raced against the wait; a cancellation returns
    /// [`Error::Cancelled`] and drops this subscriber without affecting the
    /// notification bus or any other subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotificationTimeout`] if no matching notification
    /// arrives within `timeout_duration`, or if the bus is closed or this
    /// subscriber lags behind the broadcast buffer; [`Error::Cancelled`] if
    /// `cancel` fires first.
    pub async fn await_notification(
        &self,
        notification_type: u8,
        timeout_duration: Duration,
        filter: Option<impl Fn(&[u8]) -> bool>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, Error> {
        tokio::select! {
            result = self.await_notification_inner(notification_type, timeout_duration, filter) => result,
            () = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn await_notification_inner(
        &self,
        notification_type: u8,
        timeout_duration: Duration,
        filter: Option<impl Fn(&[u8]) -> bool>,
    ) -> Result<Vec<u8>, Error> {
        let mut rx = self.subscribe_notifications();
        let deadline = tokio::time::Instant::now() + timeout_duration;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::NotificationTimeout);
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok((kind, payload))) if kind == notification_type => {
                    if filter.as_ref().is_none_or(|f| f(&payload)) {
                        return Ok(payload);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) => return Err(Error::NotificationTimeout),
                Err(_) => return Err(Error::NotificationTimeout),
            }
        }
    }
}

impl Default for CommandMux {
    fn default() -> Self {
        Self::new()
    }
}
