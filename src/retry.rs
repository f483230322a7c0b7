/// Retries a transient-classified broker operation with doubling delay.
/// Permanent errors break out immediately; the last transient error is
/// returned once attempts are exhausted.
macro_rules! retry_broker_operation {
    ($context:expr, $operation:expr) => {{
        const MAX_ATTEMPTS: u32 = 3;
        const BASE_DELAY_MS: u64 = 1_000;

        let context_value: String = $context.into();
        let mut attempt = 1;

        loop {
            match ($operation).await {
                Ok(value) => break Ok(value),
                Err(err) if !err.is_transient() || attempt >= MAX_ATTEMPTS => break Err(err),
                Err(err) => {
                    let delay_ms = BASE_DELAY_MS << (attempt - 1);
                    log::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {}ms.",
                        attempt,
                        MAX_ATTEMPTS,
                        context_value,
                        err,
                        delay_ms
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_broker_operation;

#[cfg(test)]
mod tests {
    use crate::error::BotError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, BotError> = retry_broker_operation!("test op", async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BotError::TransientBroker("timeout".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, BotError> = retry_broker_operation!("test op", async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BotError::BrokerPermanent("rejected".into()))
        });
        assert!(matches!(result, Err(BotError::BrokerPermanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_exhaust_the_attempt_cap() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, BotError> = retry_broker_operation!("test op", async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BotError::TransientBroker("rate limited".into()))
        });
        assert!(matches!(result, Err(BotError::TransientBroker(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
