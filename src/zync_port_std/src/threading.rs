//! Per-thread suspension primitive.
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use zync_kernel::PendStatus;

/// A binary wakeup token. `park` consumes the token, blocking until one is
/// deposited by `unpark` or the deadline passes. Depositing a token while
/// nobody is parked makes the next `park` return immediately, so a wakeup
/// delivered between the kernel's queue manipulation and the actual
/// suspension is not lost.
pub(crate) struct Parker {
    token: Mutex<bool>,
    condvar: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            token: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn park(&self, deadline: Option<Instant>) -> PendStatus {
        let mut token = self
            .token
            .lock()
            .expect("parker mutex poisoned");

        loop {
            if *token {
                *token = false;
                return PendStatus::Woken;
            }

            match deadline {
                None => {
                    token = self
                        .condvar
                        .wait(token)
                        .expect("parker mutex poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return PendStatus::TimedOut;
                    }
                    let (guard, _) = self
                        .condvar
                        .wait_timeout(token, deadline - now)
                        .expect("parker mutex poisoned");
                    token = guard;
                }
            }
        }
    }

    pub(crate) fn unpark(&self) {
        let mut token = self
            .token
            .lock()
            .expect("parker mutex poisoned");
        *token = true;
        drop(token);
        self.condvar.notify_one();
    }
}
