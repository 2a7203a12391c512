//! Retry-once policy shared by all serial drivers.
//!
//! A failed exchange is logged, the port is reopened and the exchange runs one
//! more time. A second failure is logged at `error` and handed back to the
//! caller ([`retry_once`]) or replaced by a fallback value ([`retry_or`]).

use crate::hardware::transport::InstrumentPort;
use anyhow::Result;
use std::future::Future;
use tracing::{error, warn};

/// Run `op`, reconnect on failure, run it again.
pub async fn retry_once<T, F, Fut>(port: &InstrumentPort, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let first = match op().await {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };
    warn!(
        port = port.name(),
        operation,
        error = %first,
        "Exchange failed, reconnecting for one retry"
    );

    if let Err(e) = port.reconnect().await {
        error!(port = port.name(), operation, error = %e, "Reconnect failed");
        return Err(e);
    }

    op().await.map_err(|second| {
        error!(
            port = port.name(),
            operation,
            error = %second,
            "Exchange failed again after reconnect"
        );
        second
    })
}

/// Like [`retry_once`], but a second failure yields `fallback`.
pub async fn retry_or<T, F, Fut>(port: &InstrumentPort, operation: &str, fallback: T, op: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_once(port, operation, op).await.unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{ScriptedDevice, SimulatedOpener};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn port_with(device: ScriptedDevice) -> (InstrumentPort, SimulatedOpener<ScriptedDevice>) {
        let opener = SimulatedOpener::new(device, b'\n');
        let port = InstrumentPort::new("retry", Arc::new(opener.clone()))
            .with_timeout(Duration::from_millis(30));
        (port, opener)
    }

    #[tokio::test]
    #[traced_test]
    async fn second_attempt_succeeds_after_reconnect() {
        let (port, opener) = port_with(ScriptedDevice::new().reply("V?", "1.5\n"));
        port.connect().await.unwrap();
        opener.with_model(|d| d.go_silent(1));

        let value = retry_once(&port, "read", || async {
            let reply = port.query("V?").await?;
            Ok(reply.parse::<f64>()?)
        })
        .await
        .unwrap();

        assert_eq!(value, 1.5);
        assert_eq!(opener.open_count(), 2);
        assert!(logs_contain("reconnecting for one retry"));
    }

    #[tokio::test]
    #[traced_test]
    async fn second_failure_is_logged_and_returned() {
        let (port, _opener) = port_with(ScriptedDevice::new());
        port.connect().await.unwrap();
        let calls = AtomicUsize::new(0);

        let result: Result<String> = retry_once(&port, "read", || {
            calls.fetch_add(1, Ordering::SeqCst);
            port.query("V?")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(logs_contain("failed again after reconnect"));
    }

    #[tokio::test]
    async fn fallback_value_on_double_failure() {
        let (port, _opener) = port_with(ScriptedDevice::new());
        port.connect().await.unwrap();

        let level = retry_or(&port, "level", -1.0, || async {
            Ok(port.query("MEAS?").await?.parse::<f64>()?)
        })
        .await;
        assert_eq!(level, -1.0);
    }
}
