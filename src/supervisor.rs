//! Panic boundaries for broker tasks.
//!
//! Every task body runs inside [`catch_fault`]. A panic becomes a [`Fault`]
//! value that the caller either reports on its error channel (connection
//! tasks) or answers with a restart via [`restart_on_fault`] (acceptor,
//! event loop).

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::error;

/// A panic caught at a task boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub message: String,
}

impl Fault {
    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self { message }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Drive `fut` to completion, converting a panic into a [`Fault`].
///
/// State borrowed by `fut` is still usable after a fault; callers that
/// restart rely on that.
pub async fn catch_fault<F>(fut: F) -> Result<F::Output, Fault>
where
    F: Future,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(Fault::from_panic)
}

/// Run `body` against `state` until it returns without panicking.
///
/// After each fault `on_fault` sees the surviving state, then the next run
/// starts once `delay` has passed. Returns the number of runs.
pub async fn restart_on_fault<S, F, H>(
    task: &'static str,
    delay: Duration,
    state: &mut S,
    mut body: F,
    mut on_fault: H,
) -> usize
where
    F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, ()>,
    H: FnMut(&mut S, &Fault),
{
    let mut runs = 0;
    loop {
        runs += 1;
        match catch_fault(body(state)).await {
            Ok(()) => return runs,
            Err(fault) => {
                error!(task, error = %fault, "Caught panic, restarting");
                on_fault(state, &fault);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
