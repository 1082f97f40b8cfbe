//! A bounded, health-checked, FIFO/LIFO connection pool with acquire
//! timeouts and pending-acquire queueing, plus a keyed [`map::ChannelPoolMap`]
//! of such pools.

pub mod error;
pub mod map;
pub mod pool;

pub use error::PoolError;
pub use map::{BootstrapFactory, ChannelPoolMap};
pub use pool::{
    AcquireTimeoutPolicy, AlwaysHealthy, Bootstrap, ChannelPool, HealthChecker, PoolConfig,
    PoolHandler, PooledChannel, StoreOrder, POOL_IDENTITY_KEY,
};
