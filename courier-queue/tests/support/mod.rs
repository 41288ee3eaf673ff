#![allow(dead_code)]

pub mod transport;

use std::sync::Arc;

use courier_queue::{Dispatcher, DispatcherConfig, JobQueue, RecipientResolver, RetryPolicy};

/// Dispatcher settings that retry immediately so a test can drive every
/// attempt with successive batches.
pub fn immediate_retries() -> DispatcherConfig {
    DispatcherConfig {
        retry: RetryPolicy {
            base_retry_delay_secs: 0,
            max_retry_delay_secs: 0,
            retry_jitter_factor: 0.0,
        },
        ..DispatcherConfig::default()
    }
}

pub fn dispatcher(
    config: DispatcherConfig,
    queue: &JobQueue,
    resolver: RecipientResolver,
    transport: &Arc<transport::FakeTransport>,
) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        config,
        queue.clone(),
        resolver,
        transport.clone(),
    ))
}
