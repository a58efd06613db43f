//! Timeouts and deadlines for every wait the engine performs.
//!
//! A [`Timeout`] combines two independent bounds:
//!
//! - a *timeout*, which bounds a single operation and applies afresh to each
//!   wait, and
//! - a *deadline*, an absolute instant that spans a whole job made of many
//!   operations (all retries and follow-ups of a call, for example).
//!
//! When both are set, the tighter one wins. If the deadline is the tighter
//! (or equal) bound and elapses, the wait fails with
//! [`ErrorKind::DeadlineExceeded`]; otherwise with [`ErrorKind::Timeout`].
//! An attached [`CancellationToken`] interrupts any wait with
//! [`ErrorKind::Interrupted`].
//!
//! Blocking code waits on a [`Condvar`] with
//! [`Timeout::wait_until_signaled`]; asynchronous code uses
//! [`Timeout::wait_until_notified`] or races an arbitrary future with
//! [`Timeout::run`].

use std::future::Future;
use std::sync::{Condvar, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{ErrorKind, Result};

/// Which bound elapsed first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    Timeout,
    Deadline,
}

impl From<Expiry> for ErrorKind {
    fn from(expiry: Expiry) -> Self {
        match expiry {
            Expiry::Timeout => ErrorKind::Timeout,
            Expiry::Deadline => ErrorKind::DeadlineExceeded,
        }
    }
}

/// A per-operation timeout combined with an optional job-wide deadline.
///
/// ```
/// use httpd_lib::Timeout;
/// use std::time::Duration;
///
/// let timeout = Timeout::new()
///     .with_timeout(Duration::from_secs(10))
///     .with_deadline(Duration::from_secs(30))
///     .unwrap();
/// assert!(timeout.has_deadline());
/// assert!(timeout.throw_if_reached().is_ok());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Timeout {
    /// Zero means no timeout
    timeout: Duration,
    deadline: Option<Instant>,
    cancellation: Option<CancellationToken>,
    /// Set only on [`Timeout::NONE`]
    noop: bool,
}

impl Timeout {
    /// A guard for call sites that never block. Its setters are ignored and
    /// its checks never fail.
    pub const NONE: Timeout = Timeout {
        timeout: Duration::ZERO,
        deadline: None,
        cancellation: None,
        noop: true,
    };

    /// A guard with neither a timeout nor a deadline
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound each wait by `timeout`. Zero means unbounded.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !self.noop {
            self.timeout = timeout;
        }
        self
    }

    /// Set a deadline `duration` from now.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Config`] if `duration` is zero.
    pub fn with_deadline(self, duration: Duration) -> Result<Self> {
        if duration.is_zero() {
            return Err(ErrorKind::Config(format!(
                "deadline must be positive, got {duration:?}"
            )));
        }
        Ok(self.with_deadline_at(Instant::now() + duration))
    }

    /// Set an absolute deadline. A deadline in the past fails the next check.
    #[must_use]
    pub fn with_deadline_at(mut self, deadline: Instant) -> Self {
        if !self.noop {
            self.deadline = Some(deadline);
        }
        self
    }

    /// Interrupt every wait as soon as `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        if !self.noop {
            self.cancellation = Some(token);
        }
        self
    }

    /// Remove the per-operation timeout
    #[must_use]
    pub fn clear_timeout(mut self) -> Self {
        self.timeout = Duration::ZERO;
        self
    }

    /// Remove the deadline
    #[must_use]
    pub fn clear_deadline(mut self) -> Self {
        self.deadline = None;
        self
    }

    /// A guard for one operation of this job: `timeout` replaces the
    /// per-operation bound, the deadline and cancellation are inherited.
    #[must_use]
    pub fn child(&self, timeout: Duration) -> Self {
        if self.noop {
            return Self::NONE;
        }
        Self {
            timeout,
            deadline: self.deadline,
            cancellation: self.cancellation.clone(),
            noop: false,
        }
    }

    /// The per-operation timeout, zero if unbounded
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The deadline, if one is set
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether a deadline is set
    #[must_use]
    pub const fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    /// Whether the attached cancellation token fired
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Fails if the job was cancelled or its deadline has passed.
    ///
    /// This does not detect a stalled operation; callers poll it between
    /// steps or race I/O with [`Timeout::run`].
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Interrupted`] on cancellation,
    /// [`ErrorKind::DeadlineExceeded`] if the deadline passed.
    pub fn throw_if_reached(&self) -> Result<()> {
        if self.noop {
            return Ok(());
        }
        if self.is_cancelled() {
            return Err(ErrorKind::Interrupted);
        }
        if let Some(deadline) = self.deadline
            && deadline <= Instant::now()
        {
            return Err(ErrorKind::DeadlineExceeded);
        }
        Ok(())
    }

    /// The wait bound at `now`, and which error is reported once it elapses.
    /// `None` means wait forever.
    fn bound(&self, now: Instant) -> Option<(Duration, Expiry)> {
        let remaining = self
            .deadline
            .map(|deadline| deadline.saturating_duration_since(now));
        match (remaining, self.timeout.is_zero()) {
            (None, true) => None,
            (None, false) => Some((self.timeout, Expiry::Timeout)),
            (Some(remaining), true) => Some((remaining, Expiry::Deadline)),
            (Some(remaining), false) if remaining <= self.timeout => {
                Some((remaining, Expiry::Deadline))
            }
            (Some(_), false) => Some((self.timeout, Expiry::Timeout)),
        }
    }

    /// Blocks the current thread on `condvar` until it is signaled or a
    /// bound elapses.
    ///
    /// `guard` must be the held lock associated with `condvar`; it is handed
    /// back re-acquired when the wait ends with a signal. Like any condition
    /// variable wait, this can return without the awaited condition being
    /// true, so callers loop on their predicate.
    ///
    /// Cancellation can only cut the wait short if whoever cancels also
    /// notifies `condvar`.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Timeout`] or [`ErrorKind::DeadlineExceeded`] if the full
    /// bound elapsed without a signal, [`ErrorKind::Interrupted`] if the
    /// cancellation token fired.
    pub fn wait_until_signaled<'a, T>(
        &self,
        condvar: &Condvar,
        guard: MutexGuard<'a, T>,
    ) -> Result<MutexGuard<'a, T>> {
        if self.is_cancelled() {
            return Err(ErrorKind::Interrupted);
        }

        let start = Instant::now();
        let Some((wait, expiry)) = self.bound(start) else {
            let guard = condvar
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
            return self.interrupted_or(guard);
        };
        if wait.is_zero() {
            return Err(expiry.into());
        }

        let (guard, result) = condvar
            .wait_timeout(guard, wait)
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            return Err(ErrorKind::Interrupted);
        }
        if result.timed_out() || start.elapsed() >= wait {
            return Err(expiry.into());
        }
        Ok(guard)
    }

    fn interrupted_or<G>(&self, guard: G) -> Result<G> {
        if self.is_cancelled() {
            Err(ErrorKind::Interrupted)
        } else {
            Ok(guard)
        }
    }

    /// Waits until `notify` is notified or a bound elapses.
    ///
    /// A permit stored by [`Notify::notify_one`] before the call completes
    /// the wait immediately.
    ///
    /// # Errors
    ///
    /// Same as [`Timeout::wait_until_signaled`].
    pub async fn wait_until_notified(&self, notify: &Notify) -> Result<()> {
        self.run(async {
            notify.notified().await;
            Ok(())
        })
        .await
    }

    /// Runs `future` to completion unless a bound elapses or the job is
    /// cancelled first. The losing future is dropped, which aborts any I/O
    /// it had in flight.
    ///
    /// # Errors
    ///
    /// Returns the future's own error, or the errors of
    /// [`Timeout::wait_until_signaled`].
    pub async fn run<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.noop {
            return future.await;
        }
        self.throw_if_reached()?;

        let cancelled = async {
            match &self.cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        match self.bound(Instant::now()) {
            None => tokio::select! {
                biased;
                () = cancelled => Err(ErrorKind::Interrupted),
                result = future => result,
            },
            Some((wait, expiry)) => tokio::select! {
                biased;
                () = cancelled => Err(ErrorKind::Interrupted),
                result = future => result,
                () = tokio::time::sleep(wait) => Err(expiry.into()),
            },
        }
    }
}
