use serde::Deserialize;
use std::collections::VecDeque;

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct VarDiffConfig {
    /// Desired average time between shares, in seconds.
    pub target_time: f64,
    /// Minimum time between two retargets, in seconds.
    pub retarget_time: f64,
    /// Allowed deviation from `target_time`, as a percentage of it.
    pub variance_percent: f64,
    pub min_diff: f64,
    pub max_diff: Option<f64>,
    /// Largest absolute change applied by a single retarget.
    pub max_delta: Option<f64>,
}

impl Default for VarDiffConfig {
    fn default() -> Self {
        Self {
            target_time: 15.0,
            retarget_time: 90.0,
            variance_percent: 30.0,
            min_diff: 1000.0,
            max_diff: None,
            max_delta: None,
        }
    }
}

impl VarDiffConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |name: &'static str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::invalid(name, v))
            }
        };
        positive("vardiff.target_time", self.target_time)?;
        positive("vardiff.min_diff", self.min_diff)?;
        if !(self.retarget_time.is_finite() && self.retarget_time >= 0.0) {
            return Err(ConfigError::invalid("vardiff.retarget_time", self.retarget_time));
        }
        if !(self.variance_percent.is_finite() && (0.0..100.0).contains(&self.variance_percent)) {
            return Err(ConfigError::invalid("vardiff.variance_percent", self.variance_percent));
        }
        if let Some(max) = self.max_diff {
            if !(max.is_finite() && max >= self.min_diff) {
                return Err(ConfigError::invalid("vardiff.max_diff", max));
            }
        }
        if let Some(delta) = self.max_delta {
            positive("vardiff.max_delta", delta)?;
        }
        Ok(())
    }
}

/// Fixed-capacity ring of recent inter-share intervals.
#[derive(Debug, Clone)]
struct IntervalBuffer {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl IntervalBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, interval: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(interval);
    }

    fn sum(&self) -> f64 {
        self.samples.iter().sum()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Per-connection vardiff state. Timestamps are seconds on any monotonic
/// scale shared by all calls for the same context.
#[derive(Debug, Clone)]
pub struct VarDiffContext {
    last_ts: Option<f64>,
    last_retarget: f64,
    last_update: Option<f64>,
    intervals: IntervalBuffer,
}

impl VarDiffContext {
    pub fn new() -> Self {
        Self {
            last_ts: None,
            last_retarget: 0.0,
            last_update: None,
            intervals: IntervalBuffer::new(VarDiffManager::BUFFER_SIZE),
        }
    }

    /// Number of buffered intervals.
    pub fn samples(&self) -> usize {
        self.intervals.len()
    }

    pub fn last_share_at(&self) -> Option<f64> {
        self.last_ts
    }

    /// Time of the last retarget that changed difficulty.
    pub fn last_update(&self) -> Option<f64> {
        self.last_update
    }
}

impl Default for VarDiffContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Stateless retarget algorithm; every connection shares one instance.
#[derive(Debug, Clone)]
pub struct VarDiffManager {
    cfg: VarDiffConfig,
    t_min: f64,
    t_max: f64,
}

impl VarDiffManager {
    pub const BUFFER_SIZE: usize = 10;

    /// Floor for the averaged interval, keeps the ratio finite.
    const MIN_AVERAGE: f64 = 0.001;

    pub fn new(cfg: VarDiffConfig) -> Self {
        let variance = cfg.target_time * cfg.variance_percent / 100.0;
        Self {
            cfg,
            t_min: cfg.target_time - variance,
            t_max: cfg.target_time + variance,
        }
    }

    pub fn config(&self) -> &VarDiffConfig {
        &self.cfg
    }

    /// Feed one observation into `ctx`.
    ///
    /// Called for every submitted share (`is_idle_update == false`) and from
    /// the connection's idle timer (`true`), which only looks at the time
    /// elapsed since the last share without recording it. Returns the new
    /// difficulty when a retarget changes it.
    pub fn update(
        &self,
        ctx: &mut VarDiffContext,
        difficulty: f64,
        is_idle_update: bool,
        now: f64,
    ) -> Option<f64> {
        let Some(last_ts) = ctx.last_ts else {
            ctx.last_ts = Some(now);
            ctx.last_retarget = now;
            return None;
        };

        let since_last = (now - last_ts).max(0.0);
        let avg = (ctx.intervals.sum() + since_last) / (ctx.intervals.len() + 1) as f64;

        if !is_idle_update {
            ctx.intervals.push(since_last);
            ctx.last_ts = Some(now);
        }

        if now - ctx.last_retarget < self.cfg.retarget_time
            || (avg >= self.t_min && avg <= self.t_max)
        {
            return None;
        }

        let mut new_diff = difficulty * self.cfg.target_time / avg.max(Self::MIN_AVERAGE);

        if let Some(max_delta) = self.cfg.max_delta {
            let delta = new_diff - difficulty;
            if delta.abs() > max_delta {
                new_diff = difficulty + max_delta.copysign(delta);
            }
        }

        new_diff = new_diff.max(self.cfg.min_diff);
        if let Some(max_diff) = self.cfg.max_diff {
            new_diff = new_diff.min(max_diff);
        }

        if !new_diff.is_finite() || new_diff == difficulty {
            return None;
        }

        ctx.last_retarget = now;
        ctx.last_update = Some(now);
        ctx.intervals.clear();
        Some(new_diff)
    }
}
