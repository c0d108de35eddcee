//! Fault-tolerance policies wrapping sender selection.

use std::sync::Arc;

use futures::future::BoxFuture;

use strato_core::{FrameworkError, Reply, Request, StratoError};

use crate::balancer::LoadBalancer;

/// Call policy applied on top of a load balancer.
///
/// Implementations are stateless; everything a call needs comes in through
/// the arguments.
pub trait FaultTolerance: Send + Sync {
    /// Policy name as registered in `Extensions`.
    fn name(&self) -> &'static str;

    /// Run one logical call.
    ///
    /// `default_retries` is the retry budget used when neither the request nor
    /// the provider address carries a `retries` option.
    fn invoke<'a>(
        &'a self,
        balancer: &'a dyn LoadBalancer,
        request: Request,
        default_retries: u32,
    ) -> BoxFuture<'a, Result<Reply, StratoError>>;
}

/// One sender, one attempt; any failure propagates.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailFast;

impl FaultTolerance for FailFast {
    fn name(&self) -> &'static str {
        "failfast"
    }

    fn invoke<'a>(
        &'a self,
        balancer: &'a dyn LoadBalancer,
        request: Request,
        _default_retries: u32,
    ) -> BoxFuture<'a, Result<Reply, StratoError>> {
        Box::pin(async move {
            let sender = balancer.select_one(&request)?;
            sender.invoke(request).await
        })
    }
}

/// Retries transport failures on the next sender of the live set.
///
/// Starts at the sender the balancer picks and advances by index modulo the
/// live-set size on every attempt. Business errors (and any other
/// non-transport error) end the call at once. When the budget runs out the
/// last transport failure is reported as `FrameworkError::RetriesExhausted`
/// naming the sender tried last.
#[derive(Debug, Default, Clone, Copy)]
pub struct Failover;

impl FaultTolerance for Failover {
    fn name(&self) -> &'static str {
        "failover"
    }

    fn invoke<'a>(
        &'a self,
        balancer: &'a dyn LoadBalancer,
        request: Request,
        default_retries: u32,
    ) -> BoxFuture<'a, Result<Reply, StratoError>> {
        Box::pin(async move {
            let senders = balancer.select_all(&request)?;
            let first = balancer.select_one(&request)?;
            let start = senders
                .iter()
                .position(|s| Arc::ptr_eq(s, &first))
                .unwrap_or(0);

            let budget = request
                .retries()
                .or_else(|| first.address().retries())
                .unwrap_or(default_retries);
            let attempts = budget.saturating_add(1);

            let mut last = None;
            for attempt in 0..attempts {
                let sender = &senders[(start + attempt as usize) % senders.len()];
                let mut request = request.clone();
                request.attempt = attempt;

                match sender.invoke(request).await {
                    Ok(reply) => {
                        if attempt > 0 {
                            tracing::info!(
                                address = %sender.address(),
                                attempt,
                                "Call succeeded after failover"
                            );
                        }
                        return Ok(reply);
                    }
                    Err(StratoError::Transport(cause)) => {
                        tracing::warn!(
                            address = %sender.address(),
                            attempt,
                            error = %cause,
                            "Attempt failed"
                        );
                        last = Some((sender.address().to_string(), cause));
                    }
                    Err(other) => return Err(other),
                }
            }

            match last {
                Some((target, cause)) => Err(FrameworkError::RetriesExhausted {
                    target,
                    attempts,
                    cause,
                }
                .into()),
                None => Err(FrameworkError::NoProviderAvailable(request.service_key()).into()),
            }
        })
    }
}

/// Sends to every active sender in turn; the last reply wins.
///
/// A business error aborts the broadcast. Other failures are logged and
/// skipped; if nothing succeeds the call fails with
/// `FrameworkError::NoProviderAvailable`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Broadcast;

impl FaultTolerance for Broadcast {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn invoke<'a>(
        &'a self,
        balancer: &'a dyn LoadBalancer,
        request: Request,
        _default_retries: u32,
    ) -> BoxFuture<'a, Result<Reply, StratoError>> {
        Box::pin(async move {
            let senders = balancer.select_all(&request)?;

            let mut last = None;
            for sender in &senders {
                match sender.invoke(request.clone()).await {
                    Ok(reply) => last = Some(reply),
                    Err(e) if e.is_business() => return Err(e),
                    Err(e) => {
                        tracing::warn!(
                            address = %sender.address(),
                            error = %e,
                            "Broadcast target failed, skipping"
                        );
                    }
                }
            }

            last.ok_or_else(|| FrameworkError::NoProviderAvailable(request.service_key()).into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_core::{BusinessError, TransportError, keys};

    use crate::balancer::RoundRobinBalancer;
    use crate::sender::testing::{ScriptedTransport, Step, refused, sender};
    use crate::sender::Sender;

    fn live_set(steps: Vec<Vec<Step>>) -> (RoundRobinBalancer, Vec<Arc<ScriptedTransport>>) {
        let mut senders = Vec::new();
        let mut transports = Vec::new();
        for (i, steps) in steps.into_iter().enumerate() {
            let (s, t) = sender(9000 + i as u16, steps);
            senders.push(s);
            transports.push(t);
        }
        let balancer = RoundRobinBalancer::new();
        balancer.refresh(senders);
        (balancer, transports)
    }

    fn calls(transports: &[Arc<ScriptedTransport>]) -> Vec<usize> {
        transports.iter().map(|t| t.calls()).collect()
    }

    #[tokio::test]
    async fn test_failfast_propagates_first_failure() {
        let (balancer, transports) = live_set(vec![vec![refused()], vec![Step::Ok(b"1")]]);
        let result = FailFast.invoke(&balancer, Request::new("Echo", "echo"), 5).await;
        assert!(matches!(result, Err(StratoError::Transport(_))));
        assert_eq!(calls(&transports), vec![1, 0]);
    }

    #[tokio::test]
    async fn test_failover_visits_senders_in_order() {
        // the first K = 3 of N = 5 fail
        for budget in 3..6u32 {
            let (balancer, transports) = live_set(vec![
                vec![refused()],
                vec![refused()],
                vec![refused()],
                vec![Step::Ok(b"3")],
                vec![Step::Ok(b"4")],
            ]);
            let request =
                Request::new("Echo", "echo").with_option(keys::RETRIES, budget.to_string());

            let reply = Failover.invoke(&balancer, request, 0).await.unwrap();
            assert_eq!(reply.outcome.unwrap(), b"3".to_vec());
            assert_eq!(calls(&transports), vec![1, 1, 1, 1, 0]);
        }
    }

    #[tokio::test]
    async fn test_failover_wraps_around_from_selected_start() {
        let (balancer, transports) = live_set(vec![
            vec![Step::Ok(b"0")],
            vec![refused()],
            vec![refused()],
        ]);
        // advance round robin so the call starts at index 1
        balancer.select_one(&Request::new("Echo", "warmup")).unwrap();

        let reply = Failover
            .invoke(&balancer, Request::new("Echo", "echo"), 2)
            .await
            .unwrap();
        assert_eq!(reply.outcome.unwrap(), b"0".to_vec());
        assert_eq!(calls(&transports), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_failover_business_error_is_not_retried() {
        let (balancer, transports) = live_set(vec![
            vec![Step::Fail(BusinessError::new(9, "invalid").into())],
            vec![Step::Ok(b"1")],
        ]);
        let result = Failover.invoke(&balancer, Request::new("Echo", "echo"), 5).await;
        assert!(matches!(result, Err(StratoError::Business(e)) if e.code == 9));
        assert_eq!(calls(&transports), vec![1, 0]);
    }

    #[tokio::test]
    async fn test_failover_exhaustion_names_last_target() {
        let (balancer, transports) = live_set(vec![vec![refused()], vec![refused()]]);
        let result = Failover.invoke(&balancer, Request::new("Echo", "echo"), 2).await;

        match result {
            Err(StratoError::Framework(FrameworkError::RetriesExhausted {
                target,
                attempts,
                cause,
            })) => {
                assert_eq!(attempts, 3);
                assert!(target.contains(":9000/"));
                assert!(matches!(cause, TransportError::ConnectionFailed(_)));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(calls(&transports), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_failover_budget_precedence() {
        let transport = ScriptedTransport::new(vec![refused()]);
        let provider = Arc::new(Sender::new(
            crate::sender::testing::address(9000).with_option(keys::RETRIES, "1"),
            transport.clone(),
            std::time::Duration::from_secs(1),
        ));
        let balancer = RoundRobinBalancer::new();
        balancer.refresh(vec![provider]);

        // provider option beats the default
        let _ = Failover.invoke(&balancer, Request::new("Echo", "a"), 5).await;
        assert_eq!(transport.calls(), 2);

        // request option beats the provider option
        let request = Request::new("Echo", "b").with_option(keys::RETRIES, "3");
        let _ = Failover.invoke(&balancer, request, 5).await;
        assert_eq!(transport.calls(), 6);
    }

    #[tokio::test]
    async fn test_failover_framework_error_is_not_retried() {
        let (balancer, transports) = live_set(vec![
            vec![Step::Fail(FrameworkError::Remote("method not found".into()).into())],
            vec![Step::Ok(b"1")],
        ]);
        let result = Failover.invoke(&balancer, Request::new("Echo", "echo"), 5).await;
        assert!(matches!(result, Err(StratoError::Framework(FrameworkError::Remote(_)))));
        assert_eq!(calls(&transports), vec![1, 0]);
    }

    #[tokio::test]
    async fn test_broadcast_last_reply_wins_and_skips_failures() {
        let (balancer, transports) = live_set(vec![
            vec![Step::Ok(b"0")],
            vec![Step::Ok(b"1")],
            vec![refused()],
        ]);
        let reply = Broadcast
            .invoke(&balancer, Request::new("Echo", "echo"), 0)
            .await
            .unwrap();
        assert_eq!(reply.outcome.unwrap(), b"1".to_vec());
        assert_eq!(calls(&transports), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_broadcast_business_error_aborts() {
        let (balancer, transports) = live_set(vec![
            vec![Step::Ok(b"0")],
            vec![Step::Fail(BusinessError::new(1, "no").into())],
            vec![Step::Ok(b"2")],
        ]);
        let result = Broadcast.invoke(&balancer, Request::new("Echo", "echo"), 0).await;
        assert!(matches!(result, Err(StratoError::Business(_))));
        assert_eq!(calls(&transports), vec![1, 1, 0]);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_success() {
        let (balancer, _) = live_set(vec![vec![refused()], vec![refused()]]);
        let result = Broadcast.invoke(&balancer, Request::new("Echo", "echo"), 0).await;
        assert!(matches!(
            result,
            Err(StratoError::Framework(FrameworkError::NoProviderAvailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_empty_live_set() {
        let balancer = RoundRobinBalancer::new();
        for strategy in [
            &FailFast as &dyn FaultTolerance,
            &Failover,
            &Broadcast,
        ] {
            let result = strategy.invoke(&balancer, Request::new("Echo", "echo"), 1).await;
            assert!(matches!(
                result,
                Err(StratoError::Framework(FrameworkError::NoProviderAvailable(_)))
            ));
        }
    }
}
