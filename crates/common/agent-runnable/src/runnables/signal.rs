//! Cooperative cancellation for runnable calls.

use std::future::Future;
use std::time::Duration;

use futures::future::{self, Either};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// An abort signal combining any number of cancellation tokens and an
/// optional deadline.
///
/// The signal fires as soon as any token is cancelled or the deadline
/// passes. Work is never interrupted forcefully: runnables consult the
/// signal between steps and before yielding chunks, and race their own
/// futures against [`AbortSignal::aborted`].
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    tokens: Vec<CancellationToken>,
    deadline: Option<(Instant, Duration)>,
}

impl AbortSignal {
    /// Create a signal together with the token that fires it.
    pub fn new() -> (Self, CancellationToken) {
        let token = CancellationToken::new();
        (Self::from_token(token.clone()), token)
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            tokens: vec![token],
            deadline: None,
        }
    }

    /// A signal that fires once `timeout` has elapsed from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            tokens: Vec::new(),
            deadline: Some((Instant::now() + timeout, timeout)),
        }
    }

    /// A signal firing when either input fires.
    pub fn any(left: &AbortSignal, right: &AbortSignal) -> Self {
        let mut tokens = left.tokens.clone();
        tokens.extend(right.tokens.iter().cloned());
        let deadline = match (left.deadline, right.deadline) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (a, b) => a.or(b),
        };
        Self { tokens, deadline }
    }

    pub fn is_aborted(&self) -> bool {
        self.check().is_err()
    }

    /// `Err(Cancelled)` or `Err(Timeout)` if the signal has fired.
    pub fn check(&self) -> Result<()> {
        if self.tokens.iter().any(CancellationToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        if let Some((deadline, timeout)) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(Error::Timeout(timeout));
        }
        Ok(())
    }

    /// Resolves with the abort reason once the signal fires.
    pub async fn aborted(&self) -> Error {
        let cancelled = async {
            if self.tokens.is_empty() {
                future::pending::<()>().await;
            }
            let waits = self
                .tokens
                .iter()
                .map(|token| Box::pin(token.cancelled()));
            future::select_all(waits).await;
        };
        let expired = async {
            match self.deadline {
                Some((deadline, _)) => tokio::time::sleep_until(deadline).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancelled => Error::Cancelled,
            _ = expired => Error::Timeout(self.deadline.map(|(_, t)| t).unwrap_or_default()),
        }
    }

    /// Run `work` unless the signal fires first.
    pub async fn guard<T, F>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let work = std::pin::pin!(work);
        let aborted = std::pin::pin!(self.aborted());
        match future::select(work, aborted).await {
            Either::Left((result, _)) => result,
            Either::Right((reason, _)) => Err(reason),
        }
    }
}

/// Check an optional signal.
pub fn check_signal(signal: Option<&AbortSignal>) -> Result<()> {
    signal.map_or(Ok(()), AbortSignal::check)
}
