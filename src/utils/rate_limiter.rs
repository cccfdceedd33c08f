/// Sliding-window limiter for historical data pacing
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        RateLimiter {
            max_requests,
            window,
            issued: Mutex::new(VecDeque::with_capacity(max_requests as usize)),
        }
    }

    /// Try to take a slot, returns true if successful
    pub async fn try_acquire(&self) -> bool {
        let mut issued = self.issued.lock().await;
        let now = Instant::now();
        Self::expire(&mut issued, now, self.window);

        if issued.len() < self.max_requests as usize {
            issued.push_back(now);
            true
        } else {
            false
        }
    }

    /// Wait until a slot is free, then take it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut issued = self.issued.lock().await;
                let now = Instant::now();
                Self::expire(&mut issued, now, self.window);

                if issued.len() < self.max_requests as usize {
                    issued.push_back(now);
                    return;
                }

                // Oldest entry leaves the window first
                match issued.front() {
                    Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };

            debug!("Pacing limit reached, waiting {:?}", wait);
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Slots available right now
    pub async fn available(&self) -> u32 {
        let mut issued = self.issued.lock().await;
        Self::expire(&mut issued, Instant::now(), self.window);
        self.max_requests.saturating_sub(issued.len() as u32)
    }

    fn expire(issued: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = issued.front() {
            if now.duration_since(*oldest) >= window {
                issued.pop_front();
            } else {
                break;
            }
        }
    }
}
