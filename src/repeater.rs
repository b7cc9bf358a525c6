use std::future::Future;
use tracing::debug;

/// Outcome of [`repeat`]
#[derive(Debug)]
#[must_use]
pub enum Repeated<R> {
    /// A produced result passed the acceptance check.
    Accepted(R),
    /// Every attempt was rejected; this is the last result, still open.
    Exhausted(R),
}

impl<R> Repeated<R> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Repeated::Accepted(_))
    }

    pub fn into_inner(self) -> R {
        match self {
            Repeated::Accepted(result) | Repeated::Exhausted(result) => result,
        }
    }
}

/// Call `produce` until `accept` holds for its result, at most
/// `max_attempts` times (always at least once). Rejected results are
/// dropped before the next attempt, which closes whatever they own. Errors
/// from `produce` are returned immediately.
pub async fn repeat<R, E, F, Fut, A>(
    mut produce: F,
    accept: A,
    max_attempts: usize,
) -> Result<Repeated<R>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    A: Fn(&R) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = produce().await?;
        if accept(&result) {
            return Ok(Repeated::Accepted(result));
        }
        if attempt >= max_attempts {
            debug!(attempts = attempt, "Giving up, no acceptable result");
            return Ok(Repeated::Exhausted(result));
        }
        debug!(attempt, "Result rejected, retrying");
        drop(result);
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tracked {
        value: usize,
        closed: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn exhausted_after_max_attempts_closes_rejected() {
        let produced = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let outcome = repeat(
            || {
                let value = produced.fetch_add(1, Ordering::SeqCst) + 1;
                let closed = closed.clone();
                async move { Ok::<_, ()>(Tracked { value, closed }) }
            },
            |_| false,
            3,
        )
        .await
        .unwrap();

        assert_eq!(produced.load(Ordering::SeqCst), 3);
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert!(!outcome.is_accepted());
        let last = outcome.into_inner();
        assert_eq!(last.value, 3);
        drop(last);
        assert_eq!(closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_at_first_accepted() {
        let produced = Arc::new(AtomicUsize::new(0));
        let outcome = repeat(
            || {
                let n = produced.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<_, ()>(n) }
            },
            |n| *n == 2,
            5,
        )
        .await
        .unwrap();

        assert!(outcome.is_accepted());
        assert_eq!(outcome.into_inner(), 2);
        assert_eq!(produced.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn produce_error_propagates() {
        let result = repeat(|| async { Err::<u8, _>("boom") }, |_| true, 3).await;
        assert_eq!(result.unwrap_err(), "boom");
    }

    #[tokio::test]
    async fn zero_attempts_still_produces_once() {
        let outcome = repeat(|| async { Ok::<_, ()>(7) }, |_| false, 0).await.unwrap();
        assert!(matches!(outcome, Repeated::Exhausted(7)));
    }
}
