//! Relay engine integration.
//!
//! [`engine`] holds the trait seam; [`mediasoup_relay`] implements it over
//! a mediasoup worker.

pub mod engine;
pub mod mediasoup_relay;

pub use engine::{
    ConsumerParams, DtlsParameters, RelayError, RelayRouter, RelayWorker, RtpCapabilities,
    RtpCodecCapability, RtpParameters, TransportListenIp, TransportParams,
    WebRtcTransportOptions, WorkerLogLevel, WorkerSettings,
};
pub use mediasoup_relay::{MediasoupRouter, MediasoupWorker};

use crate::observability::metrics::record_relay_call;
use std::future::Future;
use std::time::{Duration, Instant};

/// Run a relay call bounded by `limit`.
///
/// Records `rc_relay_call_duration_seconds{operation}` for every call, and
/// maps an elapsed timeout to [`RelayError::Timeout`].
pub async fn with_timeout<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, RelayError>
where
    F: Future<Output = Result<T, RelayError>>,
{
    let start = Instant::now();
    let result = match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout {
            operation,
            after: limit,
        }),
    };
    record_relay_call(operation, result.is_ok(), start.elapsed());

    if let Err(e) = &result {
        tracing::debug!(
            target: "rc.relay",
            operation = operation,
            error = %e,
            "Relay call failed"
        );
    }

    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let ok = with_timeout("connect_transport", Duration::from_secs(1), async {
            Ok::<_, RelayError>(7)
        })
        .await;
        assert_eq!(ok.unwrap(), 7);

        let err = with_timeout("produce", Duration::from_secs(1), async {
            Err::<(), _>(RelayError::Failed("rejected".to_string()))
        })
        .await;
        assert!(matches!(err, Err(RelayError::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_elapses() {
        let result = with_timeout("consume", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, RelayError>(())
        })
        .await;

        assert!(matches!(
            result,
            Err(RelayError::Timeout {
                operation: "consume",
                ..
            })
        ));
    }
}
