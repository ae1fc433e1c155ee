//! Device authentication (biometric/PIN) in front of auth-gated keystore reads.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    Denied,
    Cancelled,
    Unavailable(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::Denied => write!(f, "Device authentication was denied"),
            AuthError::Cancelled => write!(f, "Device authentication was cancelled"),
            AuthError::Unavailable(reason) => {
                write!(f, "Device authentication unavailable: {}", reason)
            }
        }
    }
}

impl Error for AuthError {}

/// Lets a caller abandon a pending prompt, e.g. when the app is backgrounded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Platform prompt. Implementations block until the user answers and should
/// return `AuthError::Cancelled` promptly once `cancel` fires.
pub trait DeviceAuthenticator: Send + Sync {
    fn authenticate(&self, reason: &str, cancel: &CancelToken) -> Result<(), AuthError>;
}

/// Grants every request. For tests and hosts with no biometric hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAllow;

impl DeviceAuthenticator for AlwaysAllow {
    fn authenticate(&self, _reason: &str, cancel: &CancelToken) -> Result<(), AuthError> {
        if cancel.is_cancelled() {
            return Err(AuthError::Cancelled);
        }
        Ok(())
    }
}

/// Serialises prompts so parallel reads of gated keys share a single prompt
/// cycle. Callers that queued behind a running prompt take its outcome, and
/// a successful prompt also covers later requests for `validity`.
pub struct AuthGate {
    authenticator: Arc<dyn DeviceAuthenticator>,
    validity: Duration,
    state: Mutex<GateState>,
    /// Number of prompts that have finished.
    completed: AtomicU64,
}

#[derive(Default)]
struct GateState {
    last_success: Option<Instant>,
    last_outcome: Option<Result<(), AuthError>>,
}

impl AuthGate {
    pub fn new(authenticator: Arc<dyn DeviceAuthenticator>, validity: Duration) -> Self {
        AuthGate {
            authenticator,
            validity,
            state: Mutex::new(GateState::default()),
            completed: AtomicU64::new(0),
        }
    }

    pub fn authorize(&self, reason: &str, cancel: &CancelToken) -> Result<(), AuthError> {
        let seen = self.completed.load(Ordering::SeqCst);

        // Held across the prompt, so concurrent callers queue here
        let mut state = self
            .state
            .lock()
            .map_err(|_| AuthError::Unavailable("auth state lock poisoned".to_string()))?;

        if let Some(at) = state.last_success {
            if at.elapsed() < self.validity {
                return Ok(());
            }
        }

        if self.completed.load(Ordering::SeqCst) != seen {
            // A prompt ran while this caller waited. A cancellation belonged
            // to the other caller's token, so only grants and denials carry over.
            match &state.last_outcome {
                Some(Ok(())) => return Ok(()),
                Some(Err(AuthError::Denied)) => return Err(AuthError::Denied),
                _ => {}
            }
        }

        if cancel.is_cancelled() {
            return Err(AuthError::Cancelled);
        }

        log::debug!("Requesting device authentication: {}", reason);
        let outcome = self.authenticator.authenticate(reason, cancel);
        if outcome.is_ok() {
            state.last_success = Some(Instant::now());
        }
        state.last_outcome = Some(outcome.clone());
        self.completed.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = &outcome {
            log::warn!("Device authentication failed: {}", e);
        }
        outcome
    }

    /// Forgets the last successful prompt so the next gated read prompts again.
    pub fn lock(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.last_success = None;
            state.last_outcome = None;
        }
    }
}

impl fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGate")
            .field("validity", &self.validity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    struct CountingAuthenticator {
        prompts: AtomicUsize,
        delay: Duration,
        answer: Result<(), AuthError>,
    }

    impl CountingAuthenticator {
        fn new(answer: Result<(), AuthError>) -> Self {
            CountingAuthenticator {
                prompts: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
                answer,
            }
        }
    }

    impl DeviceAuthenticator for CountingAuthenticator {
        fn authenticate(&self, _reason: &str, _cancel: &CancelToken) -> Result<(), AuthError> {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.answer.clone()
        }
    }

    #[test]
    fn parallel_requests_share_one_prompt() {
        let authenticator = Arc::new(CountingAuthenticator {
            delay: Duration::from_millis(50),
            ..CountingAuthenticator::new(Ok(()))
        });
        let gate = Arc::new(AuthGate::new(authenticator.clone(), Duration::from_secs(30)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                thread::spawn(move || gate.authorize("read wallet", &CancelToken::new()))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(authenticator.prompts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_validity_prompts_for_each_sequential_request() {
        let authenticator = Arc::new(CountingAuthenticator::new(Ok(())));
        let gate = AuthGate::new(authenticator.clone(), Duration::ZERO);
        gate.authorize("a", &CancelToken::new()).unwrap();
        gate.authorize("b", &CancelToken::new()).unwrap();
        assert_eq!(authenticator.prompts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zero_validity_still_shares_a_running_prompt() {
        let authenticator = Arc::new(CountingAuthenticator {
            delay: Duration::from_millis(200),
            ..CountingAuthenticator::new(Ok(()))
        });
        let gate = Arc::new(AuthGate::new(authenticator.clone(), Duration::ZERO));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    gate.authorize("read wallet", &CancelToken::new())
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(authenticator.prompts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queued_callers_share_a_denial() {
        let authenticator = Arc::new(CountingAuthenticator {
            delay: Duration::from_millis(200),
            ..CountingAuthenticator::new(Err(AuthError::Denied))
        });
        let gate = Arc::new(AuthGate::new(authenticator.clone(), Duration::from_secs(30)));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    gate.authorize("read wallet", &CancelToken::new())
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Err(AuthError::Denied));
        }

        assert_eq!(authenticator.prompts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lock_forces_a_new_prompt() {
        let authenticator = Arc::new(CountingAuthenticator::new(Ok(())));
        let gate = AuthGate::new(authenticator.clone(), Duration::from_secs(30));
        gate.authorize("a", &CancelToken::new()).unwrap();
        gate.lock();
        gate.authorize("b", &CancelToken::new()).unwrap();
        assert_eq!(authenticator.prompts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn denial_is_not_remembered_as_success() {
        let authenticator = Arc::new(CountingAuthenticator::new(Err(AuthError::Denied)));
        let gate = AuthGate::new(authenticator.clone(), Duration::from_secs(30));
        assert_eq!(gate.authorize("a", &CancelToken::new()), Err(AuthError::Denied));
        assert_eq!(gate.authorize("a", &CancelToken::new()), Err(AuthError::Denied));
        assert_eq!(authenticator.prompts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancelled_token_skips_the_prompt() {
        let authenticator = Arc::new(CountingAuthenticator::new(Ok(())));
        let gate = AuthGate::new(authenticator.clone(), Duration::from_secs(30));
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(gate.authorize("a", &cancel), Err(AuthError::Cancelled));
        assert_eq!(authenticator.prompts.load(Ordering::SeqCst), 0);
    }
}
