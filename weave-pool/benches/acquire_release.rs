use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, Criterion};
use weave_core::error::PipelineError;
use weave_core::pipeline::context::{
    AttributeKey, AttributeSlot, BoxFuture, Context, EventLoop, PipelineMessage, TimerHandle,
};
use weave_pool::{Bootstrap, ChannelPool, PoolConfig, PoolError, PooledChannel};

struct InlineEventLoop;
impl EventLoop for InlineEventLoop {
    fn in_loop(&self) -> bool {
        true
    }
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
    fn schedule(&self, task: Box<dyn FnOnce() + Send>, _delay: std::time::Duration) -> Box<dyn TimerHandle> {
        task();
        Box::new(NoopTimer)
    }
}

struct NoopTimer;
impl TimerHandle for NoopTimer {
    fn cancel(&self) {}
}

#[derive(Default)]
struct NullSlot(std::sync::Mutex<Option<Arc<dyn std::any::Any + Send + Sync>>>);
impl AttributeSlot for NullSlot {
    fn get(&self) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.0.lock().unwrap().clone()
    }
    fn set(&self, value: Arc<dyn std::any::Any + Send + Sync>) {
        *self.0.lock().unwrap() = Some(value);
    }
    fn clear(&self) {
        *self.0.lock().unwrap() = None;
    }
}

struct BenchChannel {
    identity_slot: NullSlot,
    closed: AtomicBool,
}

impl BenchChannel {
    fn new() -> Self {
        Self { identity_slot: NullSlot::default(), closed: AtomicBool::new(false) }
    }
}

impl Context for BenchChannel {
    fn event_loop(&self) -> &dyn EventLoop {
        static L: InlineEventLoop = InlineEventLoop;
        &L
    }
    fn fire_inbound(&self, _msg: PipelineMessage) {}
    fn fire_inbound_complete(&self) {}
    fn fire_user_event(&self, _event: Arc<dyn std::any::Any + Send + Sync>) {}
    fn fire_exception(&self, _err: PipelineError) {}
    fn read(&self) {}
    fn write_async(&self, _msg: PipelineMessage) -> BoxFuture<'static, Result<(), PipelineError>> {
        Box::pin(async { Ok(()) })
    }
    fn write_and_flush(&self, _msg: PipelineMessage) -> BoxFuture<'static, Result<(), PipelineError>> {
        Box::pin(async { Ok(()) })
    }
    fn flush(&self) {}
    fn close_async(&self) -> BoxFuture<'static, Result<(), PipelineError>> {
        self.closed.store(true, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
    fn attribute(&self, _key: AttributeKey) -> &dyn AttributeSlot {
        &self.identity_slot
    }
}

struct BenchBootstrap;

#[async_trait]
impl Bootstrap for BenchBootstrap {
    async fn connect(&self) -> Result<PooledChannel, PoolError> {
        Ok(Arc::new(BenchChannel::new()))
    }
}

fn bench_acquire_release_roundtrip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let pool = rt.block_on(async {
        ChannelPool::new(
            PoolConfig { max_connections: 64, ..PoolConfig::default() },
            Arc::new(BenchBootstrap),
        )
    });

    c.bench_function("pool_acquire_then_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let channel = pool.acquire().await.unwrap();
                pool.release(channel).await.unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_acquire_release_roundtrip);
criterion_main!(benches);
