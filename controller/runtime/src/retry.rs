//! Retrying writes rejected by optimistic concurrency.

use std::{future::Future, time::Duration};
use tracing::debug;

const ATTEMPTS: u32 = 5;
const INITIAL_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(2);

fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(e) if e.code == 409)
}

pub(crate) fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(e) if e.code == 404)
}

/// Runs `op` until it succeeds, fails with anything but a conflict, or
/// exhausts the retry budget. `op` must re-read the object it writes.
pub(crate) async fn on_conflict<F, Fut, T>(what: &str, mut op: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut delay = INITIAL_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(error) if is_conflict(&error) && attempt < ATTEMPTS => {
                debug!(%what, attempt, ?delay, "Write conflicted; retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
                attempt += 1;
            }
            res => return res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Conflict".to_string(),
            code,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn retries_conflicts_until_success() {
        let calls = &AtomicU32::new(0);
        let res = on_conflict("test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(api_error(409))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_budget() {
        let calls = &AtomicU32::new(0);
        let res: Result<(), _> = on_conflict("test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(api_error(409))
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let res: Result<(), _> = on_conflict("test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(api_error(500))
        })
        .await;
        assert!(is_not_found(&api_error(404)));
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
