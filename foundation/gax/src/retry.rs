use std::future::Future;
use std::iter::Take;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cancel::{bounded, CancellationToken};
use crate::grpc::{Code, Status};

/// Exponential backoff with multiplicative jitter.
///
/// `next()` returns the current delay envelope scaled by a random factor in
/// `[1 - jitter, 1 + jitter]`, then grows the envelope by `multiplier` up to
/// `max_delay`. The iterator never ends; bound it with `Iterator::take`
/// (see [`RetrySetting::strategy`]).
#[derive(Debug)]
pub struct ExponentialBackoff {
    /// initial is the initial value of the delay envelope.
    pub initial: Duration,

    /// max_delay is the maximum value of the delay envelope.
    pub max_delay: Duration,

    /// multiplier is the factor by which the envelope grows per attempt.
    pub multiplier: f64,

    /// jitter is the half-width of the random scaling factor.
    pub jitter: f64,

    current: Duration,
    attempts: usize,
    rng: StdRng,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max_delay: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            max_delay,
            multiplier,
            jitter,
            current: initial,
            attempts: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Replaces the RNG with one seeded from `seed` so delay sequences are
    /// reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Number of delays handed out since creation or the last `reset`.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Restores the envelope to `initial` and zeroes the attempt counter.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(60), 1.5, 0.2)
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let envelope = self.current.min(self.max_delay);
        let scale = if self.jitter > 0.0 {
            1.0 + self.rng.gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        let delay = envelope.mul_f64(scale.max(0.0));

        self.current = envelope.mul_f64(self.multiplier).min(self.max_delay);
        self.attempts += 1;
        Some(delay)
    }
}

pub trait TryAs<T> {
    fn try_as(&self) -> Option<&T>;
}

impl TryAs<Status> for Status {
    fn try_as(&self) -> Option<&Status> {
        Some(self)
    }
}

pub trait Condition<E> {
    fn should_retry(&mut self, error: &E) -> bool;
}

/// Retries when the error carries one of the configured status codes.
pub struct CodeCondition {
    codes: Vec<Code>,
}

impl CodeCondition {
    pub fn new(codes: Vec<Code>) -> Self {
        Self { codes }
    }
}

impl<E> Condition<E> for CodeCondition
where
    E: TryAs<Status>,
{
    fn should_retry(&mut self, error: &E) -> bool {
        match error.try_as() {
            Some(status) => self.codes.iter().any(|code| *code == status.code()),
            None => false,
        }
    }
}

pub trait Retry<E: TryAs<Status>, C: Condition<E>> {
    fn strategy(&self) -> Take<ExponentialBackoff>;
    fn condition(&self) -> C;
    fn notify(error: &E, duration: Duration) {
        if let Some(status) = error.try_as() {
            tracing::trace!("retry fn, error: {:?}, duration: {:?}", status, duration);
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetrySetting {
    pub initial: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    /// Seed for the jitter RNG. `None` seeds from entropy.
    pub seed: Option<u64>,
    pub take: usize,
    pub codes: Vec<Code>,
}

impl<E> Retry<E, CodeCondition> for RetrySetting
where
    E: TryAs<Status>,
{
    fn strategy(&self) -> Take<ExponentialBackoff> {
        let mut backoff = ExponentialBackoff::new(self.initial, self.max_delay, self.multiplier, self.jitter);
        if let Some(seed) = self.seed {
            backoff = backoff.with_seed(seed);
        }
        backoff.take(self.take)
    }

    fn condition(&self) -> CodeCondition {
        CodeCondition::new(self.codes.clone())
    }
}

impl Default for RetrySetting {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 1.5,
            jitter: 0.2,
            seed: None,
            take: 5,
            codes: vec![Code::Unavailable],
        }
    }
}

/// Invokes `f` until it succeeds, the condition rejects the error, or the
/// retry strategy is exhausted. Cancellation is raced against the whole loop.
pub async fn invoke<A, R, RT, C, E>(
    cancel: Option<CancellationToken>,
    retry: Option<RT>,
    mut f: impl FnMut() -> A,
) -> Result<R, E>
where
    E: TryAs<Status> + From<Status>,
    A: Future<Output = Result<R, E>>,
    C: Condition<E>,
    RT: Retry<E, C> + Default,
{
    let fn_loop = async {
        let retry = retry.unwrap_or_default();
        let mut strategy = retry.strategy();
        let mut condition = retry.condition();
        loop {
            let error = match f().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !condition.should_retry(&error) {
                return Err(error);
            }
            match strategy.next() {
                None => return Err(error),
                Some(duration) => {
                    RT::notify(&error, duration);
                    tokio::time::sleep(duration).await
                }
            }
        }
    };

    bounded(cancel, None, fn_loop).await
}

/// Repeats retries when the specified error is detected.
/// The argument specified by 'v' can be reused for each retry.
pub async fn invoke_fn<R, V, A, RT, C, E>(
    cancel: Option<CancellationToken>,
    retry: Option<RT>,
    mut f: impl FnMut(V) -> A,
    mut v: V,
) -> Result<R, E>
where
    E: TryAs<Status> + From<Status>,
    A: Future<Output = Result<R, (E, V)>>,
    C: Condition<E>,
    RT: Retry<E, C> + Default,
{
    let fn_loop = async {
        let retry = retry.unwrap_or_default();
        let mut strategy = retry.strategy();
        let mut condition = retry.condition();
        loop {
            let error = match f(v).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    v = err.1;
                    err.0
                }
            };
            if !condition.should_retry(&error) {
                return Err(error);
            }
            match strategy.next() {
                None => return Err(error),
                Some(duration) => {
                    RT::notify(&error, duration);
                    tokio::time::sleep(duration).await
                }
            }
        }
    };

    bounded(cancel, None, fn_loop).await
}
