//! Agent subservice lifecycle
//!
//! Subservices stop in reverse start order. A stop on the normal shutdown
//! path propagates errors; a stop on an exception path aggregates every
//! teardown failure into a single `StopAgentService` error so one bad
//! service never blocks the rest of the teardown.

use tracing::{error, info};
use uvnet_common::{Error, Result};

/// A stoppable agent subservice
#[async_trait::async_trait]
pub trait AgentService: Send {
    fn name(&self) -> &'static str;

    /// Must be idempotent: a second stop is a no-op
    async fn stop(&mut self, assert_stopped: bool) -> Result<()>;
}

/// Stop services in reverse start order.
///
/// With `assert_stopped` (exception path) failures are collected and
/// reported once at the end; otherwise the first failure propagates.
pub async fn stop_all(
    services: &mut [&mut dyn AgentService],
    assert_stopped: bool,
) -> Result<()> {
    let mut failures = Vec::new();
    for service in services.iter_mut().rev() {
        info!("stopping service: {}", service.name());
        match service.stop(assert_stopped).await {
            Ok(()) => {}
            Err(e) if assert_stopped => {
                error!("failed to stop {}: {}", service.name(), e);
                failures.push(format!("{}: {}", service.name(), e));
            }
            Err(e) => return Err(e),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::StopAgentService(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeService {
        name: &'static str,
        fail: bool,
        order: Arc<AtomicUsize>,
        stopped_at: Option<usize>,
        stops: usize,
    }

    #[async_trait::async_trait]
    impl AgentService for FakeService {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn stop(&mut self, _assert_stopped: bool) -> Result<()> {
            self.stops += 1;
            if self.stops > 1 {
                return Ok(());
            }
            self.stopped_at = Some(self.order.fetch_add(1, Ordering::SeqCst));
            if self.fail {
                return Err(Error::Internal("boom".into()));
            }
            Ok(())
        }
    }

    fn service(name: &'static str, fail: bool, order: &Arc<AtomicUsize>) -> FakeService {
        FakeService {
            name,
            fail,
            order: order.clone(),
            stopped_at: None,
            stops: 0,
        }
    }

    #[tokio::test]
    async fn test_reverse_order_and_aggregation() {
        let order = Arc::new(AtomicUsize::new(0));
        let mut a = service("net", false, &order);
        let mut b = service("router", true, &order);
        let mut c = service("tester", true, &order);

        let result = stop_all(&mut [&mut a, &mut b, &mut c], true).await;
        match result {
            Err(Error::StopAgentService(failures)) => {
                assert_eq!(failures.len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
        // Reverse start order: tester, router, net
        assert_eq!(c.stopped_at, Some(0));
        assert_eq!(b.stopped_at, Some(1));
        assert_eq!(a.stopped_at, Some(2));

        // Idempotent: a second stop pass succeeds
        let result = stop_all(&mut [&mut a, &mut b, &mut c], true).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_normal_path_propagates_first_error() {
        let order = Arc::new(AtomicUsize::new(0));
        let mut a = service("net", false, &order);
        let mut b = service("router", true, &order);
        let result = stop_all(&mut [&mut a, &mut b], false).await;
        assert!(matches!(result, Err(Error::Internal(_))));
        // net was never reached
        assert_eq!(a.stopped_at, None);
    }
}
