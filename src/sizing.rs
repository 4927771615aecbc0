//! Worker-count model: Allen–Cunneen approximation of a G/G/c queue.
//!
//! Every function here is pure; the controller feeds it observed rates and
//! applies the answer through `WorkerPool::tune`, which enforces the
//! configured bounds and slew limit.
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::duration;
use crate::window::WindowSnapshot;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SizingError {
    #[error("invalid sizing input: {0}")]
    InvalidInput(&'static str),
    #[error("unstable at {c_max} workers: offered load {offered_load:.2} needs more servers")]
    Unstable { c_max: usize, offered_load: f64 },
    #[error("service time {service_secs:.3}s alone exceeds the target {target_secs:.3}s")]
    SloUnreachable { service_secs: f64, target_secs: f64 },
}

/// Traffic description for one pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Load {
    /// λ, jobs per second.
    pub arrival_rate: f64,
    /// μ, completions per second per worker.
    pub service_rate: f64,
    /// Coefficient of variation of inter-arrival times.
    pub ca: f64,
    /// Coefficient of variation of service times.
    pub cs: f64,
}

impl Load {
    pub fn new(arrival_rate: f64, service_time: Duration) -> Self {
        Self {
            arrival_rate,
            service_rate: 1.0 / service_time.as_secs_f64().max(f64::MIN_POSITIVE),
            ca: 1.0,
            cs: 1.0,
        }
    }

    fn validate(&self) -> Result<(), SizingError> {
        if !self.arrival_rate.is_finite() || self.arrival_rate < 0.0 {
            return Err(SizingError::InvalidInput("arrival rate must be finite and >= 0"));
        }
        if !self.service_rate.is_finite() || self.service_rate <= 0.0 {
            return Err(SizingError::InvalidInput("service rate must be finite and > 0"));
        }
        if !(self.ca.is_finite() && self.cs.is_finite()) || self.ca < 0.0 || self.cs < 0.0 {
            return Err(SizingError::InvalidInput("variability coefficients must be >= 0"));
        }
        Ok(())
    }

    /// a = λ/μ, in Erlangs.
    pub fn offered_load(&self) -> f64 {
        self.arrival_rate / self.service_rate
    }

    fn variability(&self) -> f64 {
        (self.ca * self.ca + self.cs * self.cs) / 2.0
    }
}

/// Erlang-B blocking for `c` servers, computed with the stable recurrence.
fn erlang_b(c: usize, a: f64) -> f64 {
    let mut b = 1.0;
    for k in 1..=c {
        b = a * b / (k as f64 + a * b);
    }
    b
}

/// Erlang-C from an already computed Erlang-B value. Requires a < c.
fn erlang_c_from_b(c: usize, a: f64, b: f64) -> f64 {
    let c = c as f64;
    c * b / (c - a * (1.0 - b))
}

/// P(wait > 0) for an M/M/c queue with offered load `a`. Returns 1.0 when unstable.
pub fn erlang_c(c: usize, a: f64) -> f64 {
    if c == 0 || a >= c as f64 {
        return 1.0;
    }
    if a <= 0.0 {
        return 0.0;
    }
    erlang_c_from_b(c, a, erlang_b(c, a))
}

fn wait_with(c: usize, load: &Load, pw: f64) -> f64 {
    let c_mu = c as f64 * load.service_rate;
    let wq = pw / (c_mu - load.arrival_rate) * load.variability();
    wq + 1.0 / load.service_rate
}

/// Predicted time in system W = Wq + 1/μ, in seconds.
pub fn predicted_wait(c: usize, load: &Load) -> Result<f64, SizingError> {
    load.validate()?;
    let a = load.offered_load();
    if c == 0 || a >= c as f64 {
        return Err(SizingError::Unstable {
            c_max: c,
            offered_load: a,
        });
    }
    Ok(wait_with(c, load, erlang_c(c, a)))
}

/// Smallest c in 1..=c_max whose predicted wait meets `target`.
///
/// Stable but still too slow at `c_max` returns `c_max`. The search walks
/// Erlang-B forward once, so the cost is O(c_max).
pub fn find_c_for_slo(load: &Load, target: Duration, c_max: usize) -> Result<usize, SizingError> {
    load.validate()?;
    let target_secs = target.as_secs_f64();
    let service_secs = 1.0 / load.service_rate;
    if service_secs > target_secs {
        return Err(SizingError::SloUnreachable {
            service_secs,
            target_secs,
        });
    }
    search(load, c_max, |c, pw| wait_with(c, load, pw) <= target_secs)
}

/// Like [`find_c_for_slo`] but budgets only the queueing delay Wq.
pub fn find_c_for_queue_wait(load: &Load, target: Duration, c_max: usize) -> Result<usize, SizingError> {
    load.validate()?;
    let target_secs = target.as_secs_f64();
    let service_secs = 1.0 / load.service_rate;
    search(load, c_max, |c, pw| wait_with(c, load, pw) - service_secs <= target_secs)
}

fn search(load: &Load, c_max: usize, meets: impl Fn(usize, f64) -> bool) -> Result<usize, SizingError> {
    let a = load.offered_load();
    if a <= 0.0 {
        return Ok(1);
    }
    let mut b = 1.0;
    for c in 1..=c_max {
        b = a * b / (c as f64 + a * b);
        if a >= c as f64 {
            continue;
        }
        if meets(c, erlang_c_from_b(c, a, b)) {
            return Ok(c);
        }
    }
    if a >= c_max as f64 {
        Err(SizingError::Unstable {
            c_max,
            offered_load: a,
        })
    } else {
        Ok(c_max)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SizingConfig {
    /// τ: assumed service time until a pool has completed work.
    #[serde(with = "duration::serde_str")]
    pub service_time: Duration,
    /// Fraction added to λ before the search.
    pub headroom: f64,
    pub ca: f64,
    pub cs: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            service_time: Duration::from_millis(50),
            headroom: 0.15,
            ca: 1.0,
            cs: 1.0,
        }
    }
}

/// What the controller observed for one pipeline since the last sizing pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct Observation {
    /// Enqueue rate measured on the ring.
    pub arrival_rate: f64,
    /// Rate implied by the manifest, used until traffic shows up.
    pub seeded_rate: f64,
    /// Per-job service time in micros, from the pool.
    pub service: WindowSnapshot,
}

#[derive(Debug, Clone, Default)]
pub struct SizingModel {
    config: SizingConfig,
}

impl SizingModel {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Turns an observation into a model input, filling gaps with configured defaults.
    pub fn load_for(&self, obs: &Observation) -> Load {
        let lambda = if obs.arrival_rate > 0.0 {
            obs.arrival_rate
        } else {
            obs.seeded_rate
        };
        let mut load = Load::new(lambda * (1.0 + self.config.headroom), self.config.service_time);
        load.ca = self.config.ca;
        load.cs = self.config.cs;
        if let Some(mean_us) = obs.service.mean().filter(|m| *m > 0.0) {
            load.service_rate = 1_000_000.0 / mean_us;
            if let Some(cv) = obs.service.coefficient_of_variation() {
                load.cs = cv;
            }
        }
        load
    }

    /// Worker target for a pool, before clamping and slew.
    ///
    /// When service time alone exceeds `target` the model sizes for the
    /// queueing delay instead, so slow probes do not pin pools at the cap.
    pub fn target(&self, obs: &Observation, target: Duration, c_max: usize) -> Result<usize, SizingError> {
        let load = self.load_for(obs);
        match find_c_for_slo(&load, target, c_max) {
            Err(SizingError::SloUnreachable { .. }) => find_c_for_queue_wait(&load, target, c_max),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s6() -> Load {
        Load::new(1000.0, Duration::from_millis(20))
    }

    #[test]
    fn erlang_c_known_values() {
        // a = 2, c = 3: C = 4/9.
        assert!((erlang_c(3, 2.0) - 4.0 / 9.0).abs() < 1e-12);
        assert_eq!(erlang_c(1, 0.0), 0.0);
        assert_eq!(erlang_c(2, 2.0), 1.0);
    }

    #[test]
    fn s6_minimum_c_meets_target() {
        let load = s6();
        let target = Duration::from_millis(100);
        let c = find_c_for_slo(&load, target, 10_000).unwrap();
        assert!(c > 20, "offered load is 20 Erlangs, got c = {c}");
        assert!(predicted_wait(c, &load).unwrap() <= 0.1);
        match predicted_wait(c - 1, &load) {
            Ok(w) => assert!(w > 0.1),
            Err(SizingError::Unstable { .. }) => {}
            Err(e) => panic!("unexpected error {e}"),
        }
        assert_eq!(find_c_for_slo(&load, target, 10_000).unwrap(), c);
    }

    #[test]
    fn predicted_wait_decreases_with_c() {
        let load = s6();
        let mut previous = f64::INFINITY;
        for c in 21..60 {
            let w = predicted_wait(c, &load).unwrap();
            assert!(w <= previous);
            previous = w;
        }
        assert!(previous >= 0.02);
    }

    #[test]
    fn unstable_at_cap_is_an_error() {
        let load = s6();
        let err = find_c_for_slo(&load, Duration::from_millis(100), 20).unwrap_err();
        assert!(matches!(err, SizingError::Unstable { c_max: 20, .. }));
    }

    #[test]
    fn stable_but_slow_at_cap_returns_cap() {
        let load = s6();
        assert_eq!(find_c_for_slo(&load, Duration::from_millis(21), 21).unwrap(), 21);
    }

    #[test]
    fn target_below_service_time_is_unreachable() {
        let load = s6();
        assert!(matches!(
            find_c_for_slo(&load, Duration::from_millis(10), 100),
            Err(SizingError::SloUnreachable { .. })
        ));
    }

    #[test]
    fn invalid_input_is_rejected() {
        let mut load = s6();
        load.arrival_rate = f64::NAN;
        assert!(matches!(predicted_wait(30, &load), Err(SizingError::InvalidInput(_))));
    }

    #[test]
    fn model_uses_seed_and_headroom_without_traffic() {
        let model = SizingModel::new(SizingConfig {
            service_time: Duration::from_millis(20),
            ..SizingConfig::default()
        });
        let obs = Observation {
            seeded_rate: 1000.0,
            ..Observation::default()
        };
        let load = model.load_for(&obs);
        assert!((load.arrival_rate - 1150.0).abs() < 1e-9);
        assert!((load.service_rate - 50.0).abs() < 1e-9);
        let c = model.target(&obs, Duration::from_millis(100), 10_000).unwrap();
        assert!(c > 23);
    }

    #[test]
    fn slow_service_sizes_for_queueing_delay() {
        let model = SizingModel::new(SizingConfig {
            service_time: Duration::from_secs(1),
            headroom: 0.0,
            ..SizingConfig::default()
        });
        let obs = Observation {
            seeded_rate: 10.0,
            ..Observation::default()
        };
        let c = model.target(&obs, Duration::from_millis(100), 1000).unwrap();
        assert!(c > 10 && c < 1000);
    }

    #[test]
    fn idle_pool_needs_one_worker() {
        let model = SizingModel::default();
        assert_eq!(model.target(&Observation::default(), Duration::from_millis(100), 50).unwrap(), 1);
    }
}
