//! Rolling inactivity deadline for a single streaming call.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};

/// Single-shot deadline that is pushed forward on every stream event.
///
/// Owned by the stream loop of exactly one call and dropped when that call
/// returns, so it never outlives the request it guards.
#[derive(Debug)]
pub struct InactivityTimer {
    window: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl InactivityTimer {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: Box::pin(tokio::time::sleep(window)),
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Reschedule the deadline to one full window from now.
    pub fn touch(&mut self) {
        let next = Instant::now() + self.window;
        self.deadline.as_mut().reset(next);
    }

    /// Resolves once the window elapses without a [`touch`](Self::touch).
    pub async fn expired(&mut self) {
        self.deadline.as_mut().await;
    }
}
