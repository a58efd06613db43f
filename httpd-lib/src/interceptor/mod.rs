//! The built-in stages of the pipeline.

mod bridge;
mod cache;
mod connect;
mod network;
mod retry;

use std::sync::Arc;

use crate::chain::Interceptor;

pub use retry::DEFAULT_MAX_RETRIES;

/// Assemble the full stage list around the user's interceptors
pub(crate) fn stages(
    interceptors: &[Arc<dyn Interceptor>],
    network_interceptors: &[Arc<dyn Interceptor>],
) -> Vec<Arc<dyn Interceptor>> {
    let mut stages = interceptors.to_vec();
    stages.push(Arc::new(retry::RetryAndFollowUp));
    stages.push(Arc::new(bridge::Bridge));
    stages.push(Arc::new(cache::Cache));
    stages.push(Arc::new(connect::Connect));
    stages.extend(network_interceptors.iter().cloned());
    stages.push(Arc::new(network::CallServer));
    stages
}
