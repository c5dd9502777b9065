//! Session keep-alive loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::Transport;

/// Keep-alive timing.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
    /// Time between keep-alives.
    pub interval: Duration,
    /// Reply deadline for one keep-alive.
    pub timeout: Duration,
    /// Consecutive misses that mark the session dead.
    pub max_missed: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            max_missed: 4,
        }
    }
}

/// Send keep-alives on `transport` until `done` fires or too many go
/// unanswered.
///
/// Returns `Some(missed)` when the session is considered dead and `None`
/// when stopped through `done`. A reply resets the miss counter.
pub async fn run(
    transport: Arc<dyn Transport>,
    config: KeepaliveConfig,
    done: CancellationToken,
) -> Option<u32> {
    let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            () = done.cancelled() => return None,
            _ = ticker.tick() => {}
        }

        let reply = tokio::select! {
            () = done.cancelled() => return None,
            reply = timeout(config.timeout, transport.keepalive()) => reply,
        };

        match reply {
            Ok(Ok(())) => {
                if missed > 0 {
                    debug!(missed, "Keep-alive answered again");
                }
                missed = 0;
                continue;
            }
            Ok(Err(e)) => debug!(error = %e, "Keep-alive failed"),
            Err(_) => debug!(timeout_ms = timeout_ms(config.timeout), "Keep-alive timed out"),
        }

        missed += 1;
        warn!(missed, max_missed = config.max_missed, "Keep-alive missed");
        if missed >= config.max_missed {
            return Some(missed);
        }
    }
}

fn timeout_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
