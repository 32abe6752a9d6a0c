//! Reconnect loop around one follow session.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{FollowError, TransportError};

/// Reconnect delay bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// A session that lived at least this long resets the delay to `initial`.
    pub stability: Duration,
    /// Consecutive unstable sessions tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
            stability: Duration::from_secs(60),
            max_attempts: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    consecutive: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.initial,
            policy,
            consecutive: 0,
        }
    }

    /// Delay to wait before the next connect, given how long the session that
    /// just ended lasted. Doubles per unstable session, capped at `max`.
    pub fn next_delay(&mut self, session_lasted: Duration) -> Duration {
        if session_lasted >= self.policy.stability {
            self.current = self.policy.initial;
            self.consecutive = 0;
        }
        let delay = self.current.min(self.policy.max);
        self.current = self.current.saturating_mul(2).min(self.policy.max);
        self.consecutive += 1;
        delay
    }

    /// Unstable sessions since the last reset.
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn exhausted(&self) -> bool {
        self.consecutive > self.policy.max_attempts
    }
}

/// How a session ended when it did not hit a fatal error.
#[derive(Debug)]
pub enum SessionEnd {
    /// The cancellation token fired; stop without reconnecting.
    Cancelled,
    /// The connection dropped or could not be established.
    Disconnected(TransportError),
}

/// One reconnectable unit of work driven by [`ReconnectSupervisor`].
#[allow(async_fn_in_trait)]
pub trait Session {
    /// Connect and run until the connection ends. `attempt` is 0 for the
    /// first connect.
    async fn run_once(&mut self, attempt: u32, cancel: &CancellationToken) -> Result<SessionEnd, FollowError>;

    /// Wait out the reconnect delay. Sessions with timers of their own
    /// override this to keep servicing them.
    async fn backoff(&mut self, delay: Duration) -> Result<(), FollowError> {
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

/// Adapts an async closure to [`Session`].
struct FnSession<F>(F);

impl<F> Session for FnSession<F>
where
    F: AsyncFnMut(u32) -> Result<SessionEnd, FollowError>,
{
    async fn run_once(&mut self, attempt: u32, _cancel: &CancellationToken) -> Result<SessionEnd, FollowError> {
        (self.0)(attempt).await
    }
}

pub struct ReconnectSupervisor {
    backoff: Backoff,
}

impl ReconnectSupervisor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            backoff: Backoff::new(policy),
        }
    }

    /// Run `session` until it is cancelled or fails fatally, reconnecting
    /// after every disconnect. The session receives the reconnect attempt
    /// number (0 for the first connect).
    pub async fn run<F>(&mut self, cancel: &CancellationToken, session: F) -> Result<(), FollowError>
    where
        F: AsyncFnMut(u32) -> Result<SessionEnd, FollowError>,
    {
        self.run_session(cancel, &mut FnSession(session)).await
    }

    pub async fn run_session<S: Session>(
        &mut self,
        cancel: &CancellationToken,
        session: &mut S,
    ) -> Result<(), FollowError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let started = Instant::now();
            let err = match session.run_once(attempt, cancel).await? {
                SessionEnd::Cancelled => return Ok(()),
                SessionEnd::Disconnected(err) => err,
            };
            if cancel.is_cancelled() {
                return Ok(());
            }

            let delay = self.backoff.next_delay(started.elapsed());
            if self.backoff.exhausted() {
                return Err(FollowError::ReconnectExhausted {
                    attempts: self.backoff.consecutive() - 1,
                    last: err.to_string(),
                });
            }

            attempt += 1;
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "websocket disconnected, reconnecting"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("reconnect cancelled");
                    return Ok(());
                }
                waited = session.backoff(delay) => waited?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed() -> SessionEnd {
        SessionEnd::Disconnected(TransportError::Closed { reason: None })
    }

    #[test]
    fn delays_double_and_cap() {
        let mut b = Backoff::new(BackoffPolicy::default());
        let delays: Vec<u64> = (0..6)
            .map(|_| b.next_delay(Duration::ZERO).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn stable_session_resets_delay() {
        let mut b = Backoff::new(BackoffPolicy::default());
        b.next_delay(Duration::from_secs(1));
        b.next_delay(Duration::from_secs(1));
        assert_eq!(b.next_delay(Duration::from_secs(1)), Duration::from_secs(8));
        assert_eq!(b.next_delay(Duration::from_secs(61)), Duration::from_secs(2));
        assert_eq!(b.consecutive(), 1);
        assert_eq!(b.next_delay(Duration::ZERO), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_waits_between_short_sessions() {
        let cancel = CancellationToken::new();
        let mut supervisor = ReconnectSupervisor::new(BackoffPolicy::default());
        let mut starts: Vec<Instant> = Vec::new();
        let mut attempts_seen = Vec::new();

        supervisor
            .run(&cancel, async |attempt| {
                starts.push(Instant::now());
                attempts_seen.push(attempt);
                if starts.len() == 4 {
                    return Ok(SessionEnd::Cancelled);
                }
                Ok(closed())
            })
            .await
            .unwrap();

        let gaps: Vec<u64> = starts
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![2, 4, 8]);
        assert_eq!(attempts_seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn long_session_resets_backoff() {
        let cancel = CancellationToken::new();
        let mut supervisor = ReconnectSupervisor::new(BackoffPolicy::default());
        let mut starts: Vec<Instant> = Vec::new();

        supervisor
            .run(&cancel, async |_| {
                starts.push(Instant::now());
                match starts.len() {
                    // Two quick failures push the delay to 8s
                    1 | 2 => Ok(closed()),
                    // Then a session that outlives the stability threshold
                    3 => {
                        tokio::time::sleep(Duration::from_secs(90)).await;
                        Ok(closed())
                    }
                    _ => Ok(SessionEnd::Cancelled),
                }
            })
            .await
            .unwrap();

        let gap = starts[3] - starts[2];
        assert_eq!(gap, Duration::from_secs(92));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let cancel = CancellationToken::new();
        let policy = BackoffPolicy {
            max_attempts: 2,
            ..BackoffPolicy::default()
        };
        let mut supervisor = ReconnectSupervisor::new(policy);
        let mut calls = 0;

        let err = supervisor
            .run(&cancel, async |_| {
                calls += 1;
                Ok(closed())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, FollowError::ReconnectExhausted { attempts: 2, .. }));
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_backoff_sleep() {
        let cancel = CancellationToken::new();
        let mut supervisor = ReconnectSupervisor::new(BackoffPolicy::default());
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let mut calls = 0;
        supervisor
            .run(&cancel, async |_| {
                calls += 1;
                Ok(closed())
            })
            .await
            .unwrap();

        assert_eq!(calls, 1);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[derive(Default)]
    struct Counting {
        runs: u32,
        waited: Vec<Duration>,
    }

    impl Session for Counting {
        async fn run_once(&mut self, _attempt: u32, _cancel: &CancellationToken) -> Result<SessionEnd, FollowError> {
            self.runs += 1;
            if self.runs == 3 {
                return Ok(SessionEnd::Cancelled);
            }
            Ok(closed())
        }

        async fn backoff(&mut self, delay: Duration) -> Result<(), FollowError> {
            self.waited.push(delay);
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn session_waits_out_its_own_backoff() {
        let cancel = CancellationToken::new();
        let mut supervisor = ReconnectSupervisor::new(BackoffPolicy::default());
        let mut session = Counting::default();
        supervisor.run_session(&cancel, &mut session).await.unwrap();
        assert_eq!(session.runs, 3);
        assert_eq!(session.waited, vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[tokio::test]
    async fn fatal_error_stops_immediately() {
        let cancel = CancellationToken::new();
        let mut supervisor = ReconnectSupervisor::new(BackoffPolicy::default());
        let err = supervisor
            .run(&cancel, async |_| Err(FollowError::Emit(crate::error::EmitError::Closed)))
            .await
            .unwrap_err();
        assert!(matches!(err, FollowError::Emit(_)));
    }
}
