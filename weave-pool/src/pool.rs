//! A bounded, health-checked, FIFO/LIFO store of idle channels with
//! acquire timeouts and pending-acquire queueing.
//!
//! Every state mutation serializes on the pool's own task. There is no
//! single per-channel event loop to borrow here (channels in the store may
//! belong to different transports/loops), so the pool is its own
//! single-threaded actor: a `tokio::spawn`ed task owns all mutable state
//! and processes one [`Command`] at a time from an mpsc mailbox. Async work
//! that must not block the mailbox (bootstrap connects, health checks) is
//! spawned as a side task that reports its result back through the same
//! mailbox, preserving "only the pool's own thread mutates pool state".

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use weave_core::pipeline::context::{AttributeKey, Context};

use crate::error::PoolError;

/// A channel dispensed by a [`ChannelPool`]. Pools are generic over the
/// concrete transport; all they require is the pipeline's `Context`
/// capability, used both to tag pool ownership via `attribute()` and
/// to close the channel with `close_async()`.
pub type PooledChannel = Arc<dyn Context>;

/// The attribute key a pool uses to tag a dispensed channel with its
/// owning pool via a channel-attached attribute.
pub const POOL_IDENTITY_KEY: AttributeKey = AttributeKey("weave_pool.owning_pool");

/// Establishes new channels on behalf of a pool: every channel the pool
/// ever dispenses was produced by this.
#[async_trait]
pub trait Bootstrap: Send + Sync + 'static {
    async fn connect(&self) -> Result<PooledChannel, PoolError>;
}

/// Runs on acquisition (always) and optionally on release. The default is
/// `AlwaysHealthy`.
#[async_trait]
pub trait HealthChecker: Send + Sync + 'static {
    async fn is_healthy(&self, channel: &PooledChannel) -> bool;
}

/// A health checker that never rejects a channel — used when the pool is
/// not configured with one.
pub struct AlwaysHealthy;

#[async_trait]
impl HealthChecker for AlwaysHealthy {
    async fn is_healthy(&self, _channel: &PooledChannel) -> bool {
        true
    }
}

/// Observes acquire/release events. Optional; a capability interface for
/// what would otherwise be inheritance-style hooks.
pub trait PoolHandler: Send + Sync + 'static {
    fn channel_acquired(&self, _channel: &PooledChannel) {}
    fn channel_released(&self, _channel: &PooledChannel, _returned_to_store: bool) {}
}

/// Timeout policies for acquiring a channel when the pool is at capacity.
#[derive(Debug, Clone, Copy)]
pub enum AcquireTimeoutPolicy {
    /// Acquire never times out; callers wait indefinitely for capacity.
    None,
    /// On expiration, fail the pending acquire with `AcquireTimedOut`.
    Fail(Duration),
    /// On expiration, bypass the concurrency cap transiently and start a
    /// new connection for the request.
    New(Duration),
}

/// Store discipline: LIFO ("last recently used" — reuse the most recently
/// released channel, the Netty default) or FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOrder {
    Lifo,
    Fifo,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_pending_acquires: usize,
    pub acquire_timeout: AcquireTimeoutPolicy,
    pub store_order: StoreOrder,
    pub health_check_on_acquire: bool,
    pub health_check_on_release: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            max_pending_acquires: usize::MAX,
            acquire_timeout: AcquireTimeoutPolicy::None,
            store_order: StoreOrder::Lifo,
            health_check_on_acquire: true,
            health_check_on_release: false,
        }
    }
}

type AcquireReply = oneshot::Sender<Result<PooledChannel, PoolError>>;
type ReleaseReply = oneshot::Sender<Result<bool, PoolError>>;

enum Command {
    Acquire(AcquireReply),
    Release(PooledChannel, ReleaseReply),
    Connected {
        request_id: u64,
        result: Result<PooledChannel, PoolError>,
        reply: AcquireReply,
    },
    AcquireHealthChecked {
        request_id: u64,
        channel: PooledChannel,
        healthy: bool,
        reply: AcquireReply,
    },
    ReleaseHealthChecked {
        channel: PooledChannel,
        healthy: bool,
        reply: ReleaseReply,
    },
    AcquireTimedOut(u64),
    Dispose(oneshot::Sender<()>),
}

struct PendingAcquire {
    request_id: u64,
    reply: AcquireReply,
    timer: Option<tokio::task::JoinHandle<()>>,
}

struct PoolActor {
    config: PoolConfig,
    bootstrap: Arc<dyn Bootstrap>,
    health_checker: Arc<dyn HealthChecker>,
    handler: Option<Arc<dyn PoolHandler>>,
    identity: Arc<()>,
    self_tx: mpsc::UnboundedSender<Command>,

    store: VecDeque<PooledChannel>,
    acquired_count: Arc<AtomicUsize>,
    pending: VecDeque<PendingAcquire>,
    pending_count: Arc<AtomicUsize>,
    next_request_id: u64,
    disposed: bool,
}

impl PoolActor {
    fn pop_store(&mut self) -> Option<PooledChannel> {
        match self.config.store_order {
            StoreOrder::Lifo => self.store.pop_back(),
            StoreOrder::Fifo => self.store.pop_front(),
        }
    }

    /// The "pop or connect, health-check, retry on unhealthy" loop for a
    /// slot already counted in `acquired_count`.
    fn fulfill_reserved_slot(&mut self, reply: AcquireReply) {
        if let Some(channel) = self.pop_store() {
            if self.config.health_check_on_acquire {
                let checker = self.health_checker.clone();
                let tx = self.self_tx.clone();
                let request_id = self.next_request_id;
                self.next_request_id += 1;
                tokio::spawn(async move {
                    let healthy = checker.is_healthy(&channel).await;
                    let _ = tx.send(Command::AcquireHealthChecked {
                        request_id,
                        channel,
                        healthy,
                        reply,
                    });
                });
            } else {
                self.on_acquire_healthy(channel, reply);
            }
        } else {
            self.spawn_connect(reply);
        }
    }

    fn spawn_connect(&mut self, reply: AcquireReply) {
        let bootstrap = self.bootstrap.clone();
        let tx = self.self_tx.clone();
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        tokio::spawn(async move {
            let result = bootstrap.connect().await;
            let _ = tx.send(Command::Connected {
                request_id,
                result,
                reply,
            });
        });
    }

    fn on_acquire_healthy(&mut self, channel: PooledChannel, reply: AcquireReply) {
        channel
            .attribute(POOL_IDENTITY_KEY)
            .set(self.identity.clone());
        if let Some(handler) = &self.handler {
            handler.channel_acquired(&channel);
        }
        let _ = reply.send(Ok(channel));
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Acquire(reply) => self.handle_acquire(reply),
            Command::Release(channel, reply) => self.handle_release(channel, reply),
            Command::Connected {
                result, reply, ..
            } => match result {
                Ok(channel) => self.on_acquire_healthy(channel, reply),
                Err(err) => {
                    // The reserved slot never panned out; give it back and
                    // let anyone waiting behind it have a shot.
                    self.acquired_count.fetch_sub(1, Ordering::SeqCst);
                    let _ = reply.send(Err(err));
                    self.drain_pending();
                }
            },
            Command::AcquireHealthChecked {
                channel,
                healthy,
                reply,
                ..
            } => {
                if healthy {
                    self.on_acquire_healthy(channel, reply);
                } else {
                    warn!("discarding unhealthy idle channel on acquire");
                    self.close_fire_and_forget(channel);
                    self.fulfill_reserved_slot(reply);
                }
            }
            Command::ReleaseHealthChecked {
                channel,
                healthy,
                reply,
            } => self.finish_release(channel, healthy, reply),
            Command::AcquireTimedOut(request_id) => self.handle_timeout(request_id),
            Command::Dispose(ack) => self.handle_dispose(ack),
        }
    }

    fn handle_acquire(&mut self, reply: AcquireReply) {
        if self.disposed {
            let _ = reply.send(Err(PoolError::ClosedOnAcquire));
            return;
        }

        if self.acquired_count.load(Ordering::SeqCst) < self.config.max_connections {
            self.acquired_count.fetch_add(1, Ordering::SeqCst);
            self.fulfill_reserved_slot(reply);
            return;
        }

        if self.pending_count.load(Ordering::SeqCst) < self.config.max_pending_acquires {
            let request_id = self.next_request_id;
            self.next_request_id += 1;
            let timer = match self.config.acquire_timeout {
                AcquireTimeoutPolicy::None => None,
                AcquireTimeoutPolicy::Fail(d) | AcquireTimeoutPolicy::New(d) => {
                    let tx = self.self_tx.clone();
                    Some(tokio::spawn(async move {
                        tokio::time::sleep(d).await;
                        let _ = tx.send(Command::AcquireTimedOut(request_id));
                    }))
                }
            };
            self.pending_count.fetch_add(1, Ordering::SeqCst);
            self.pending.push_back(PendingAcquire {
                request_id,
                reply,
                timer,
            });
            return;
        }

        let _ = reply.send(Err(PoolError::PoolFull));
    }

    fn handle_timeout(&mut self, request_id: u64) {
        let Some(pos) = self.pending.iter().position(|p| p.request_id == request_id) else {
            // Already dequeued by a release that raced the timer.
            return;
        };
        let pending = self.pending.remove(pos).unwrap();
        self.pending_count.fetch_sub(1, Ordering::SeqCst);

        match self.config.acquire_timeout {
            AcquireTimeoutPolicy::Fail(d) => {
                let _ = pending.reply.send(Err(PoolError::AcquireTimedOut(d)));
            }
            AcquireTimeoutPolicy::New(_) => {
                debug!("acquire timeout policy New: bypassing concurrency cap");
                self.acquired_count.fetch_add(1, Ordering::SeqCst);
                self.spawn_connect(pending.reply);
            }
            AcquireTimeoutPolicy::None => {
                // A timer should never exist under this policy.
            }
        }
    }

    fn handle_release(&mut self, channel: PooledChannel, reply: ReleaseReply) {
        let owns_it = channel
            .attribute(POOL_IDENTITY_KEY)
            .get()
            .and_then(|tag| tag.downcast::<()>().ok())
            .map(|tag| Arc::ptr_eq(&tag, &self.identity))
            .unwrap_or(false);

        if !owns_it {
            self.close_fire_and_forget(channel);
            let _ = reply.send(Err(PoolError::NotAcquiredFromThisPool));
            return;
        }

        channel.attribute(POOL_IDENTITY_KEY).clear();

        if self.config.health_check_on_release {
            let checker = self.health_checker.clone();
            let tx = self.self_tx.clone();
            tokio::spawn(async move {
                let healthy = checker.is_healthy(&channel).await;
                let _ = tx.send(Command::ReleaseHealthChecked {
                    channel,
                    healthy,
                    reply,
                });
            });
        } else {
            self.finish_release(channel, true, reply);
        }
    }

    fn finish_release(&mut self, channel: PooledChannel, healthy: bool, reply: ReleaseReply) {
        let returned = if healthy {
            let within_capacity = self.store.len() < self.config.max_connections;
            if within_capacity {
                self.store.push_back(channel.clone());
                true
            } else {
                warn!("idle store at capacity, closing released channel");
                self.close_fire_and_forget(channel.clone());
                false
            }
        } else {
            self.close_fire_and_forget(channel.clone());
            false
        };

        if let Some(handler) = &self.handler {
            handler.channel_released(&channel, returned);
        }

        self.acquired_count.fetch_sub(1, Ordering::SeqCst);
        self.drain_pending();

        if healthy && !returned {
            let _ = reply.send(Err(PoolError::PoolFull));
        } else {
            let _ = reply.send(Ok(returned));
        }
    }

    /// While `acquired_count < max`, dequeue a pending request and acquire
    /// a slot for it.
    fn drain_pending(&mut self) {
        while self.acquired_count.load(Ordering::SeqCst) < self.config.max_connections {
            let Some(mut pending) = self.pending.pop_front() else {
                break;
            };
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            self.pending_count.fetch_sub(1, Ordering::SeqCst);
            self.acquired_count.fetch_add(1, Ordering::SeqCst);
            self.fulfill_reserved_slot(pending.reply);
        }
    }

    fn handle_dispose(&mut self, ack: oneshot::Sender<()>) {
        self.disposed = true;

        while let Some(mut pending) = self.pending.pop_front() {
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            let _ = pending.reply.send(Err(PoolError::ClosedOnAcquire));
        }
        self.pending_count.store(0, Ordering::SeqCst);

        while let Some(channel) = self.store.pop_front() {
            self.close_fire_and_forget(channel);
        }

        let _ = ack.send(());
    }

    fn close_fire_and_forget(&self, channel: PooledChannel) {
        tokio::spawn(async move {
            let _ = channel.close_async().await;
        });
    }
}

/// A bounded, health-checked pool of [`PooledChannel`]s.
///
/// Cloning a `ChannelPool` is cheap: it is a thin handle around the
/// actor's mailbox, matching `other_examples/19370489_…connection_pool.rs.rs`'s
/// `#[derive(Clone)] pub struct ConnectionPool`.
#[derive(Clone)]
pub struct ChannelPool {
    cmd_tx: mpsc::UnboundedSender<Command>,
    acquired_count: Arc<AtomicUsize>,
    pending_count: Arc<AtomicUsize>,
}

impl ChannelPool {
    pub fn new(config: PoolConfig, bootstrap: Arc<dyn Bootstrap>) -> Self {
        Self::with_health_checker(config, bootstrap, Arc::new(AlwaysHealthy))
    }

    pub fn with_health_checker(
        config: PoolConfig,
        bootstrap: Arc<dyn Bootstrap>,
        health_checker: Arc<dyn HealthChecker>,
    ) -> Self {
        Self::with_handler(config, bootstrap, health_checker, None)
    }

    pub fn with_handler(
        config: PoolConfig,
        bootstrap: Arc<dyn Bootstrap>,
        health_checker: Arc<dyn HealthChecker>,
        handler: Option<Arc<dyn PoolHandler>>,
    ) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let acquired_count = Arc::new(AtomicUsize::new(0));
        let pending_count = Arc::new(AtomicUsize::new(0));

        let mut actor = PoolActor {
            config,
            bootstrap,
            health_checker,
            handler,
            identity: Arc::new(()),
            self_tx: cmd_tx.clone(),
            store: VecDeque::new(),
            acquired_count: acquired_count.clone(),
            pending: VecDeque::new(),
            pending_count: pending_count.clone(),
            next_request_id: 0,
            disposed: false,
        };

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                actor.handle(cmd);
            }
        });

        Self {
            cmd_tx,
            acquired_count,
            pending_count,
        }
    }

    pub async fn acquire(&self) -> Result<PooledChannel, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Acquire(tx))
            .map_err(|_| PoolError::ClosedOnAcquire)?;
        rx.await.map_err(|_| PoolError::ClosedOnAcquire)?
    }

    pub async fn release(&self, channel: PooledChannel) -> Result<bool, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Release(channel, tx))
            .map_err(|_| PoolError::ClosedWhileAcquired)?;
        rx.await.map_err(|_| PoolError::ClosedWhileAcquired)?
    }

    /// Fail pending requests, drain and close the idle store. Outstanding
    /// (already-acquired) channels are unaffected — releasing one into a
    /// disposed pool simply closes it (see `handle_release`'s
    /// health-check/store path, which will find the store full or will
    /// just be skipped, because `disposed` only gates *acquire*).
    pub async fn dispose(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Dispose(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Current count of channels out on loan. Only mutated from the
    /// actor's own task; safe to read from any thread.
    pub fn acquired_count(&self) -> usize {
        self.acquired_count.load(Ordering::SeqCst)
    }

    pub fn pending_acquire_count(&self) -> usize {
        self.pending_count.load(Ordering::SeqCst)
    }
}
