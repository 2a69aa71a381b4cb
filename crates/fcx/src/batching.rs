//! 🎚️ Adaptive batching: when to flush, and how big the next batch should be.
//!
//! Pure functions over numbers. No clocks, no queues, no I/O: the index worker passes in what it
//! observed and gets a decision back. That makes the rules testable without a single sleep.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Deserialize;

/// 🔧 The `[batching]` config section.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BatchingConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub save_interval_ms: u64,
    pub high_queue: usize,
    pub very_high_queue: usize,
    pub target_processing_ms: u64,
    pub idle_sleep_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 10,
            max_batch_size: 500,
            save_interval_ms: 10_000,
            high_queue: 500,
            very_high_queue: 2_000,
            target_processing_ms: 5_000,
            idle_sleep_ms: 1_000,
        }
    }
}

impl BatchingConfig {
    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }

    pub fn target_processing(&self) -> Duration {
        Duration::from_millis(self.target_processing_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    /// 🔒 Keeps `n` inside `[min, max]`. Written with max/min so a misconfigured
    /// `min > max` degrades to `max` instead of panicking like `clamp` would.
    pub fn bound(&self, n: usize) -> usize {
        n.max(self.min_batch_size).min(self.max_batch_size).max(1)
    }
}

/// 🚿 Should this batch go out now? Any one condition is enough; an empty batch never goes.
pub fn should_flush(
    batch_len: usize,
    queue_len: usize,
    since_last_flush: Duration,
    cfg: &BatchingConfig,
) -> bool {
    if batch_len == 0 {
        return false;
    }
    let interval = cfg.save_interval();
    let full = batch_len >= cfg.max_batch_size;
    let waited_long_enough = batch_len >= cfg.min_batch_size && since_last_flush >= interval;
    let queue_on_fire = queue_len > cfg.very_high_queue && batch_len >= cfg.min_batch_size;
    let queue_warm = queue_len > cfg.high_queue
        && batch_len >= cfg.min_batch_size / 2
        && since_last_flush >= interval / 2;

    full || waited_long_enough || queue_on_fire || queue_warm
}

/// 📐 Next target batch size from the current one, the queue length, and recent flush timings.
pub fn calculate_optimal_batch_size(
    current: usize,
    queue_len: usize,
    avg_processing: Option<Duration>,
    cfg: &BatchingConfig,
) -> usize {
    let mut size = current as f64;

    // -- 📈 queue pressure
    if queue_len > 1_000 {
        size *= (queue_len as f64 / 1_000.0).min(1.5);
    } else if queue_len > 100 {
        size *= 1.2;
    } else if queue_len < 10 {
        size *= 0.9;
    }

    // -- ⏱️ processing time feedback, damped so one slow flush doesn't halve everything forever
    if let Some(avg) = avg_processing {
        let target = cfg.target_processing().as_secs_f64();
        let avg = avg.as_secs_f64();
        if target > 0.0 {
            let before = size;
            if avg > target {
                let overrun = (avg - target) / target;
                let factor = (1.0 - 0.5 * overrun).max(0.5);
                size = (size * factor).max(before * 0.5);
            } else if avg < 0.7 * target {
                let slack = (target - avg) / target;
                let factor = (1.0 + 0.5 * slack).min(1.5);
                size *= factor;
            }
        }
    }

    cfg.bound(size.round() as usize)
}

/// 🧮 Rolling window of the last few flush durations.
#[derive(Debug, Default, Clone)]
pub struct ProcessingTimes {
    samples: VecDeque<Duration>,
}

impl ProcessingTimes {
    pub const WINDOW: usize = 10;

    pub fn record(&mut self, elapsed: Duration) {
        if self.samples.len() == Self::WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// 💤 How long a worker naps after draining nothing. Busy queue, short nap.
pub fn idle_backoff(queue_len: usize, batch_pending: bool, cfg: &BatchingConfig) -> Duration {
    let long = cfg.idle_sleep();
    if queue_len > 0 || batch_pending {
        // -- something is around, don't wander off for a whole second
        (long / 10).max(Duration::from_millis(1))
    } else {
        long
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BatchingConfig {
        BatchingConfig::default()
    }

    #[test]
    fn the_one_where_an_empty_batch_never_flushes() {
        let cfg = cfg();
        for queue_len in [0, 501, 2_001, 1_000_000] {
            for elapsed in [Duration::ZERO, Duration::from_secs(3_600)] {
                assert!(!should_flush(0, queue_len, elapsed, &cfg));
            }
        }
        let tiny = BatchingConfig {
            min_batch_size: 0,
            max_batch_size: 0,
            ..cfg
        };
        assert!(!should_flush(0, 0, Duration::from_secs(60), &tiny));
    }

    #[test]
    fn the_one_where_each_flush_condition_stands_on_its_own() {
        let cfg = cfg();
        let zero = Duration::ZERO;
        // -- full
        assert!(should_flush(500, 0, zero, &cfg));
        // -- min reached, interval passed
        assert!(should_flush(10, 0, Duration::from_secs(10), &cfg));
        assert!(!should_flush(10, 0, Duration::from_secs(9), &cfg));
        // -- queue very high
        assert!(should_flush(10, 2_001, zero, &cfg));
        assert!(!should_flush(9, 2_001, zero, &cfg));
        // -- queue high, half of min, half of interval
        assert!(should_flush(5, 501, Duration::from_secs(5), &cfg));
        assert!(!should_flush(5, 500, Duration::from_secs(5), &cfg));
        assert!(!should_flush(4, 501, Duration::from_secs(5), &cfg));
    }

    #[test]
    fn the_one_where_a_huge_queue_bumps_fifty_to_seventy_five() {
        let cfg = cfg();
        assert_eq!(calculate_optimal_batch_size(50, 3_000, None, &cfg), 75);
        assert_eq!(calculate_optimal_batch_size(400, 3_000, None, &cfg), 500);
    }

    #[test]
    fn the_one_where_queue_pressure_nudges_the_size() {
        let cfg = cfg();
        assert_eq!(calculate_optimal_batch_size(100, 1_200, None, &cfg), 120);
        assert_eq!(calculate_optimal_batch_size(100, 500, None, &cfg), 120);
        assert_eq!(calculate_optimal_batch_size(100, 50, None, &cfg), 100);
        assert_eq!(calculate_optimal_batch_size(100, 0, None, &cfg), 90);
    }

    #[test]
    fn the_one_where_slow_flushes_shrink_but_never_below_half() {
        let cfg = cfg();
        // -- 7.5s vs 5s target: overrun 0.5, factor 0.75
        assert_eq!(
            calculate_optimal_batch_size(200, 50, Some(Duration::from_millis(7_500)), &cfg),
            150
        );
        // -- absurdly slow: floored at half
        assert_eq!(
            calculate_optimal_batch_size(200, 50, Some(Duration::from_secs(600)), &cfg),
            100
        );
        // -- fast: 1s vs 5s, slack 0.8, factor 1.4
        assert_eq!(
            calculate_optimal_batch_size(100, 50, Some(Duration::from_secs(1)), &cfg),
            140
        );
        // -- inside the comfort zone: untouched
        assert_eq!(
            calculate_optimal_batch_size(100, 50, Some(Duration::from_secs(4)), &cfg),
            100
        );
    }

    #[test]
    fn the_one_where_every_answer_lands_inside_the_bounds() {
        let cfg = cfg();
        let timings = [
            None,
            Some(Duration::ZERO),
            Some(Duration::from_secs(2)),
            Some(Duration::from_secs(5)),
            Some(Duration::from_secs(60)),
        ];
        for current in [0, 1, 9, 10, 11, 250, 499, 500, 501, 10_000] {
            for queue_len in [0, 5, 10, 99, 101, 1_000, 1_001, 5_000, 1_000_000] {
                for avg in timings {
                    let size = calculate_optimal_batch_size(current, queue_len, avg, &cfg);
                    assert!(
                        (cfg.min_batch_size..=cfg.max_batch_size).contains(&size),
                        "current={current} queue={queue_len} avg={avg:?} gave {size}"
                    );
                }
            }
        }
    }

    #[test]
    fn the_one_where_the_window_only_remembers_ten_flushes() {
        let mut times = ProcessingTimes::default();
        assert_eq!(times.average(), None);
        for _ in 0..10 {
            times.record(Duration::from_secs(100));
        }
        for _ in 0..10 {
            times.record(Duration::from_secs(1));
        }
        assert_eq!(times.len(), ProcessingTimes::WINDOW);
        assert_eq!(times.average(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn the_one_where_idle_naps_are_shorter_when_work_is_near() {
        let cfg = cfg();
        assert_eq!(idle_backoff(0, false, &cfg), Duration::from_secs(1));
        assert_eq!(idle_backoff(3, false, &cfg), Duration::from_millis(100));
        assert_eq!(idle_backoff(0, true, &cfg), Duration::from_millis(100));
    }
}
