//! Adaptive per-key sampler: counters/gauges/timers that exceed a
//! rolling-window observation threshold switch into "sampling mode" and are
//! reported as periodic reduced summaries instead of being forwarded
//! line-for-line.
//!
//! There is no equivalent of this in the original C tree (`sampling.c` only
//! ever implemented the simpler counter/gauge mean+rate path, never the
//! timer reservoir below); the reservoir algorithm below is this module's
//! own contract.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::proto::MetricType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleResult {
    /// The bucket is in sampling mode; the caller must NOT forward the line
    /// directly — it has been folded into the rolling summary.
    Sampling,
    /// The bucket is not (yet) sampling; the caller should forward the line.
    NotSampling,
}

struct Bucket {
    sampling: bool,
    last_window_count: u64,
    last_modified_at: u64,
    sum: f64,
    count: f64,
    metric_type: MetricType,
    reservoir_index: usize,
    upper: f64,
    lower: f64,
    upper_sample_rate: f64,
    lower_sample_rate: f64,
    reservoir: Vec<f64>,
}

impl Bucket {
    fn new(metric_type: MetricType, capacity: usize, now: u64) -> Self {
        Bucket {
            sampling: false,
            last_window_count: 0,
            last_modified_at: now,
            sum: 0.0,
            count: 0.0,
            metric_type,
            reservoir_index: 0,
            upper: f64::MIN,
            lower: f64::MAX,
            upper_sample_rate: 1.0,
            lower_sample_rate: 1.0,
            reservoir: vec![f64::NAN; capacity],
        }
    }

    fn reset_accumulators(&mut self) {
        self.sum = 0.0;
        self.count = 0.0;
        self.upper = f64::MIN;
        self.lower = f64::MAX;
        for slot in self.reservoir.iter_mut() {
            *slot = f64::NAN;
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Keyed table of rolling-window sample buckets. Cheap to clone: shares the
/// underlying map and RNG via internal locking.
pub struct Sampler {
    threshold: u64,
    window_seconds: u32,
    reservoir_capacity: usize,
    ttl_seconds: u64,
    expiry_period_seconds: u64,
    map: DashMap<Vec<u8>, Mutex<Bucket>>,
    rng: Mutex<fastrand::Rng>,
    next_flush_at: AtomicU64,
    next_ttl_at: AtomicU64,
}

impl Sampler {
    pub fn new(
        threshold: u32,
        window_seconds: u32,
        reservoir_size: u32,
        ttl_seconds: u64,
        expiry_period_seconds: u64,
    ) -> Self {
        let seed = now_unix() ^ (std::process::id() as u64).rotate_left(17);
        let now = now_unix();
        Sampler {
            threshold: threshold as u64,
            window_seconds,
            reservoir_capacity: reservoir_size.max(threshold) as usize,
            ttl_seconds,
            expiry_period_seconds,
            map: DashMap::new(),
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
            next_flush_at: AtomicU64::new(now + window_seconds.max(1) as u64),
            next_ttl_at: AtomicU64::new(now + expiry_period_seconds.max(1)),
        }
    }

    /// True at most once per `window_seconds`, when called with a
    /// monotonically non-decreasing `now`; advances the internal due-time on
    /// each positive answer. Lets a single supervisor tick (coarser than any
    /// one sampler's window) drive flushes for many samplers with different
    /// window lengths.
    pub fn due_for_flush(&self, now: u64) -> bool {
        let next = self.next_flush_at.load(Ordering::Relaxed);
        if now >= next {
            self.next_flush_at
                .store(now + self.window_seconds.max(1) as u64, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Same idea as `due_for_flush`, gated on the TTL sweep's own period and
    /// a no-op while the TTL feature is disabled (`ttl_seconds == 0`).
    pub fn due_for_ttl_sweep(&self, now: u64) -> bool {
        if self.ttl_seconds == 0 {
            return false;
        }
        let next = self.next_ttl_at.load(Ordering::Relaxed);
        if now >= next {
            self.next_ttl_at
                .store(now + self.expiry_period_seconds.max(1), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn bucket_entry(&self, key: &[u8], metric_type: MetricType) -> dashmap::mapref::one::Ref<'_, Vec<u8>, Mutex<Bucket>> {
        if !self.map.contains_key(key) {
            self.map
                .entry(key.to_vec())
                .or_insert_with(|| Mutex::new(Bucket::new(metric_type, self.reservoir_capacity, now_unix())));
        }
        self.map.get(key).expect("entry just inserted")
    }

    /// `value` is the already-parsed numeric value, `rate` the pre-sampling
    /// probability (1.0 if unspecified).
    pub fn consider_counter(&self, key: &[u8], value: f64, rate: f64) -> SampleResult {
        self.observe(key, MetricType::Counter, value, rate)
    }

    pub fn consider_gauge(&self, key: &[u8], value: f64, rate: f64) -> SampleResult {
        self.observe(key, MetricType::Gauge, value, rate)
    }

    pub fn consider_timer(&self, key: &[u8], value: f64, rate: f64) -> SampleResult {
        self.observe(key, MetricType::Timer, value, rate)
    }

    fn observe(&self, key: &[u8], metric_type: MetricType, value: f64, rate: f64) -> SampleResult {
        let entry = self.bucket_entry(key, metric_type);
        let mut bucket = entry.lock();
        bucket.last_modified_at = now_unix();
        bucket.last_window_count += 1;

        if !bucket.sampling && bucket.last_window_count > self.threshold {
            bucket.sampling = true;
        }

        if !bucket.sampling {
            return SampleResult::NotSampling;
        }

        let weight = if rate > 0.0 && rate < 1.0 { 1.0 / rate } else { 1.0 };
        bucket.sum += value / if rate > 0.0 { rate } else { 1.0 };
        bucket.count += weight;

        if metric_type == MetricType::Timer {
            self.observe_timer_extremes(&mut bucket, value, rate);
        }

        SampleResult::Sampling
    }

    fn observe_timer_extremes(&self, bucket: &mut Bucket, value: f64, rate: f64) {
        if value > bucket.upper {
            if bucket.upper != f64::MIN {
                self.push_reservoir(bucket, bucket.upper);
            }
            bucket.upper = value;
            bucket.upper_sample_rate = rate;
            return;
        }
        if value < bucket.lower {
            if bucket.lower != f64::MAX {
                self.push_reservoir(bucket, bucket.lower);
            }
            bucket.lower = value;
            bucket.lower_sample_rate = rate;
            return;
        }

        self.push_reservoir(bucket, value);
    }

    fn push_reservoir(&self, bucket: &mut Bucket, value: f64) {
        if bucket.reservoir_index < bucket.reservoir.len() {
            let idx = bucket.reservoir_index;
            bucket.reservoir[idx] = value;
            bucket.reservoir_index += 1;
        } else {
            let window = bucket.last_window_count.max(1);
            let k = self.rng.lock().usize(0..window as usize);
            if k < self.reservoir_capacity {
                bucket.reservoir[k] = value;
            }
        }
    }

    /// End-of-window sweep: exit sampling mode for buckets that didn't clear
    /// the threshold this window, then zero every bucket's window counter.
    /// Call `flush` first so a bucket exiting this window still gets its
    /// final summary emitted before its `sampling` flag drops.
    pub fn update_flags(&self) {
        for entry in self.map.iter() {
            let mut bucket = entry.value().lock();
            if bucket.sampling && bucket.last_window_count <= self.threshold {
                bucket.sampling = false;
                bucket.reservoir_index = 0;
            }
            bucket.last_window_count = 0;
        }
    }

    /// Emit reduced summary lines for every bucket currently in sampling
    /// mode with at least one observation this window, then reset its
    /// accumulators. Call this before `update_flags`, so a bucket that is
    /// about to exit sampling mode still gets this window's summary out.
    pub fn flush(&self, mut emit: impl FnMut(String)) {
        for entry in self.map.iter() {
            let key = entry.key();
            let mut bucket = entry.value().lock();
            if !bucket.sampling || bucket.count <= 0.0 {
                continue;
            }
            let name = String::from_utf8_lossy(key);
            match bucket.metric_type {
                MetricType::Counter => {
                    emit(format!("{}:{}|c@{}\n", name, bucket.sum / bucket.count, 1.0 / bucket.count));
                }
                MetricType::Gauge => {
                    emit(format!("{}:{}|g\n", name, bucket.sum / bucket.count));
                }
                MetricType::Timer => {
                    emit(format!("{}:{}|ms@{}\n", name, bucket.upper, bucket.upper_sample_rate));
                    emit(format!("{}:{}|ms@{}\n", name, bucket.lower, bucket.lower_sample_rate));
                    let non_nan = bucket.reservoir.iter().filter(|v| !v.is_nan()).count();
                    if non_nan > 0 {
                        let rate = non_nan as f64 / bucket.count;
                        for v in bucket.reservoir.clone().iter().filter(|v| !v.is_nan()) {
                            emit(format!("{}:{}|ms@{}\n", name, v, rate));
                        }
                    }
                }
                _ => {}
            }
            bucket.reset_accumulators();
        }
    }

    /// Delete buckets that are idle (not sampling, and untouched longer than
    /// `ttl_seconds`). No-op when the TTL is disabled (0).
    pub fn sweep_ttl(&self) {
        if self.ttl_seconds == 0 {
            return;
        }
        let now = now_unix();
        let ttl = self.ttl_seconds;
        self.map.retain(|_, bucket| {
            let b = bucket.lock();
            b.sampling || now.saturating_sub(b.last_modified_at) <= ttl
        });
    }

    pub fn window_seconds(&self) -> u32 {
        self.window_seconds
    }

    /// How often the optional TTL sweep should run; meaningless when
    /// `ttl_seconds` is 0 (TTL disabled).
    pub fn expiry_period_seconds(&self) -> u64 {
        self.expiry_period_seconds
    }

    pub fn ttl_enabled(&self) -> bool {
        self.ttl_seconds > 0
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stays_not_sampling_under_threshold() {
        let s = Sampler::new(5, 10, 5, 0, 60);
        for _ in 0..5 {
            assert_eq!(s.consider_counter(b"foo", 1.0, 1.0), SampleResult::NotSampling);
        }
    }

    #[test]
    fn flips_to_sampling_over_threshold() {
        let s = Sampler::new(3, 10, 5, 0, 60);
        for _ in 0..3 {
            assert_eq!(s.consider_counter(b"foo", 1.0, 1.0), SampleResult::NotSampling);
        }
        assert_eq!(s.consider_counter(b"foo", 1.0, 1.0), SampleResult::Sampling);
    }

    #[test]
    fn flush_emits_reduced_counter_summary() {
        // threshold=2: observations 1..=5 all value 10, rate 1.0.
        let s = Sampler::new(2, 10, 5, 0, 60);
        for _ in 0..5 {
            s.consider_counter(b"foo", 10.0, 1.0);
        }
        let mut lines = vec![];
        s.flush(|l| lines.push(l));
        s.update_flags();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("foo:10"));
        assert!(lines[0].contains("|c@"));
    }

    #[test]
    fn flush_still_emits_the_window_a_bucket_drops_below_threshold_in() {
        let s = Sampler::new(10, 10, 5, 0, 60);
        for _ in 0..20 {
            s.consider_counter(b"foo", 1.0, 1.0);
        }
        // This window's traffic (20) accrued while sampling, even though it's
        // about to fall to 2 next window; flushing before update_flags must
        // still see `sampling == true` and emit the summary.
        let mut lines = vec![];
        s.flush(|l| lines.push(l));
        s.update_flags();
        assert!(!lines.is_empty());

        // Next window: only 2 observations, below threshold. The bucket is
        // still `sampling` until update_flags runs, so this window's summary
        // must still come out — this is the window the old flush-after-
        // update_flags ordering used to lose silently.
        s.consider_counter(b"foo", 1.0, 1.0);
        s.consider_counter(b"foo", 1.0, 1.0);
        let mut lines2 = vec![];
        s.flush(|l| lines2.push(l));
        s.update_flags();
        assert!(!lines2.is_empty(), "the window a bucket drops out in must still flush");

        // A third window, now that sampling mode has actually been exited,
        // produces no summary at all.
        let mut lines3 = vec![];
        s.flush(|l| lines3.push(l));
        assert!(lines3.is_empty(), "bucket should have exited sampling mode");
    }

    #[test]
    fn timer_tracks_upper_and_lower() {
        let s = Sampler::new(1, 10, 4, 0, 60);
        s.consider_timer(b"t", 5.0, 1.0);
        s.consider_timer(b"t", 10.0, 1.0); // flips to sampling on 2nd obs
        s.consider_timer(b"t", 50.0, 1.0); // new upper
        s.consider_timer(b"t", 1.0, 1.0); // new lower
        s.update_flags();
        let mut lines = vec![];
        s.flush(|l| lines.push(l));
        assert!(lines.iter().any(|l| l.starts_with("t:50")));
        assert!(lines.iter().any(|l| l.starts_with("t:1")));
    }

    #[test]
    fn ttl_sweep_removes_idle_non_sampling_buckets() {
        let s = Sampler::new(100, 10, 5, 1, 60);
        s.consider_counter(b"idle", 1.0, 1.0);
        {
            let entry = s.map.get(&b"idle".to_vec()).unwrap();
            entry.lock().last_modified_at = 0;
        }
        s.sweep_ttl();
        assert!(s.is_empty());
    }

    #[test]
    fn ttl_sweep_never_evicts_sampling_buckets() {
        let s = Sampler::new(0, 10, 5, 1, 60);
        s.consider_counter(b"hot", 1.0, 1.0); // threshold 0: flips immediately
        {
            let entry = s.map.get(&b"hot".to_vec()).unwrap();
            entry.lock().last_modified_at = 0;
        }
        s.sweep_ttl();
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn due_for_flush_fires_once_per_window_and_advances() {
        let s = Sampler::new(1, 10, 5, 0, 60);
        assert!(!s.due_for_flush(0));
        assert!(s.due_for_flush(10));
        assert!(!s.due_for_flush(11));
        assert!(s.due_for_flush(20));
    }

    #[test]
    fn due_for_ttl_sweep_disabled_when_ttl_is_zero() {
        let s = Sampler::new(1, 10, 5, 0, 5);
        assert!(!s.due_for_ttl_sweep(1_000_000));
    }

    #[test]
    fn due_for_ttl_sweep_fires_per_expiry_period() {
        let s = Sampler::new(1, 10, 5, 30, 5);
        assert!(!s.due_for_ttl_sweep(0));
        assert!(s.due_for_ttl_sweep(5));
        assert!(!s.due_for_ttl_sweep(6));
        assert!(s.due_for_ttl_sweep(10));
    }
}
