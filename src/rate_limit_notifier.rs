use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const NOTIFY_INTERVAL: Duration = Duration::from_secs(300);

static RATE_LIMIT_NOTIFIER: Lazy<RateLimitNotifier> =
    Lazy::new(|| RateLimitNotifier::new(NOTIFY_INTERVAL));

/// Reports a throttled venue call. Repeats for the same context are
/// folded into a counter and reported at most once per interval.
pub fn notify_rate_limit(context: &str, detail: &str) {
    RATE_LIMIT_NOTIFIER.notify(context, detail);
}

/// Whether a rate limit has ever been reported for `context`.
pub fn was_reported(context: &str) -> bool {
    RATE_LIMIT_NOTIFIER.has_seen(context)
}

struct RateLimitNotifier {
    interval: Duration,
    last_sent: Mutex<HashMap<String, (Instant, u64)>>,
}

impl RateLimitNotifier {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn has_seen(&self, context: &str) -> bool {
        self.last_sent
            .lock()
            .map(|last_sent| last_sent.contains_key(context))
            .unwrap_or(false)
    }

    /// Returns true when a warning was emitted.
    fn notify(&self, context: &str, detail: &str) -> bool {
        let Ok(mut last_sent) = self.last_sent.lock() else {
            log::warn!("[RATE_LIMIT] {} (detail: {})", context, detail);
            return true;
        };
        let now = Instant::now();
        match last_sent.get(context).copied() {
            Some((sent_at, suppressed)) if now.duration_since(sent_at) < self.interval => {
                last_sent.insert(context.to_string(), (sent_at, suppressed + 1));
                log::debug!("[RATE_LIMIT] {} (suppressed: {})", context, detail);
                false
            }
            previous => {
                let suppressed = previous.map(|(_, s)| s).unwrap_or(0);
                log::warn!(
                    "[RATE_LIMIT] rate limit hit while {} (detail: {}, {} similar since last report)",
                    context,
                    detail,
                    suppressed
                );
                last_sent.insert(context.to_string(), (now, 0));
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_within_interval_are_suppressed() {
        let notifier = RateLimitNotifier::new(Duration::from_secs(3600));
        assert!(notifier.notify("alpha:get_tickers", "429"));
        assert!(!notifier.notify("alpha:get_tickers", "429"));
        assert!(notifier.notify("beta:get_tickers", "429"));
        assert!(notifier.has_seen("alpha:get_tickers"));
        assert!(!notifier.has_seen("gamma:get_tickers"));
    }

    #[test]
    fn zero_interval_reports_every_time() {
        let notifier = RateLimitNotifier::new(Duration::ZERO);
        assert!(notifier.notify("alpha:place_limit_order", "slow down"));
        assert!(notifier.notify("alpha:place_limit_order", "slow down"));
    }
}
