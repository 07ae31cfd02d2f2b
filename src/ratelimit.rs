use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const SHARD_COUNT: usize = 16;

/// Capacity and refill rate of one bucket tier.
#[derive(Debug, Clone, Copy)]
pub struct RateSettings {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

/// Emitted when a request is rejected; `scope` names the tier that ran dry
/// ("ip" or "trigger") and feeds the `rate_limit_hit_total{scope}` counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitExceeded {
    pub scope: &'static str,
    pub retry_after_secs: u64,
}

struct Bucket {
    tokens: f64,
    updated_at: Instant,
}

impl Bucket {
    fn full(settings: &RateSettings, now: Instant) -> Self {
        Self { tokens: settings.capacity, updated_at: now }
    }

    fn refill(&mut self, settings: &RateSettings, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * settings.refill_per_sec).min(settings.capacity);
        self.updated_at = now;
    }
}

struct Shard {
    buckets: HashMap<String, Bucket>,
    last_sweep: Instant,
}

struct Tier {
    shards: Vec<Mutex<Shard>>,
    settings: RateSettings,
}

impl Tier {
    fn new(settings: RateSettings) -> Self {
        let now = Instant::now();
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(Shard { buckets: HashMap::new(), last_sweep: now }))
            .collect();
        Self { shards, settings }
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Seconds until one token becomes available at the current fill level.
    fn retry_after(&self, tokens: f64) -> u64 {
        let deficit = (1.0 - tokens).max(0.0);
        (deficit / self.settings.refill_per_sec).ceil().max(1.0) as u64
    }

    /// Drop buckets that have been continuously full and idle. A bucket
    /// untouched for the whole interval has long since refilled to
    /// capacity, so idleness for `interval` implies fullness throughout
    /// the trailing part of it.
    fn sweep(&self, shard: &mut Shard, interval: Duration, now: Instant) {
        if now.saturating_duration_since(shard.last_sweep) < interval {
            return;
        }
        shard.last_sweep = now;
        let capacity = self.settings.capacity;
        let refill = self.settings.refill_per_sec;
        shard.buckets.retain(|_, bucket| {
            let elapsed = now.saturating_duration_since(bucket.updated_at);
            let refilled =
                (bucket.tokens + elapsed.as_secs_f64() * refill).min(capacity);
            !(elapsed >= interval && refilled >= capacity)
        });
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().buckets.len()).sum()
    }
}

/// Two-tier token-bucket admission control for the ingestion endpoint.
///
/// A request consumes one token from its source-IP bucket and one from its
/// trigger bucket; both must be available or nothing is consumed. Buckets
/// are created lazily and evicted once full and idle, so memory stays
/// proportional to the set of recently active keys.
pub struct AdmissionController {
    global: Tier,
    per_trigger: Tier,
    eviction_idle: Duration,
}

impl AdmissionController {
    pub fn new(global: RateSettings, per_trigger: RateSettings, eviction_idle: Duration) -> Self {
        Self { global: Tier::new(global), per_trigger: Tier::new(per_trigger), eviction_idle }
    }

    pub fn admit(&self, ip: &str, trigger_id: &str) -> Result<(), RateLimitExceeded> {
        self.admit_at(ip, trigger_id, Instant::now())
    }

    /// Admission with an explicit clock, so tests can model refill without
    /// sleeping. Lock order is always global tier then trigger tier.
    fn admit_at(&self, ip: &str, trigger_id: &str, now: Instant) -> Result<(), RateLimitExceeded> {
        let mut global_shard = self.global.shard_for(ip).lock();
        self.global.sweep(&mut global_shard, self.eviction_idle, now);
        let global_settings = self.global.settings;
        let global_bucket = global_shard
            .buckets
            .entry(ip.to_string())
            .or_insert_with(|| Bucket::full(&global_settings, now));
        global_bucket.refill(&global_settings, now);
        if global_bucket.tokens < 1.0 {
            let retry = self.global.retry_after(global_bucket.tokens);
            return Err(RateLimitExceeded { scope: "ip", retry_after_secs: retry });
        }

        let mut trigger_shard = self.per_trigger.shard_for(trigger_id).lock();
        self.per_trigger.sweep(&mut trigger_shard, self.eviction_idle, now);
        let trigger_settings = self.per_trigger.settings;
        let trigger_bucket = trigger_shard
            .buckets
            .entry(trigger_id.to_string())
            .or_insert_with(|| Bucket::full(&trigger_settings, now));
        trigger_bucket.refill(&trigger_settings, now);
        if trigger_bucket.tokens < 1.0 {
            // The IP token is not consumed on a trigger-tier rejection.
            let retry = self.per_trigger.retry_after(trigger_bucket.tokens);
            return Err(RateLimitExceeded { scope: "trigger", retry_after_secs: retry });
        }

        global_bucket.tokens -= 1.0;
        trigger_bucket.tokens -= 1.0;
        Ok(())
    }
}
