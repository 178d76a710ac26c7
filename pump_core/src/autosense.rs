//! Insulin sensitivity detection from recent glucose history.
//!
//! The analysis is pure: [`analyze`] reduces a glucose series to time-weighted
//! high/low ratios, and [`compute_factor`] turns those into a scale factor.
//! [`AutosenseEngine::run`] gathers the series, applies the result to the
//! persisted state and manages the autosense-owned schedule override.

use crate::config::AutosenseCfg;
use crate::context::PumpContext;
use crate::error::{PumpError, PumpResult};
use crate::freshness::span;
use chrono::{DateTime, Utc};
use pump_config::ScheduleOverride;
use pump_traits::{GlucoseEffect, GlucoseEffectVelocity, GlucoseSample, StoreError};
use std::thread;

/// Weight of the time-high ratio.
const HIGH_RATIO_WEIGHT: f64 = 0.5;
/// mg/dL above threshold at which the current-glucose boost reaches its weight.
const CURRENT_BOOST_SPAN: f64 = 220.0;
/// mg/dL above threshold at which the mean-glucose boost reaches its weight.
const MEAN_BOOST_SPAN: f64 = 100.0;
const BOOST_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlucoseStats {
    pub samples: usize,
    pub analyzed: chrono::Duration,
    pub time_high: chrono::Duration,
    pub time_low: chrono::Duration,
    pub mean: f64,
    pub current: f64,
}

impl GlucoseStats {
    fn ratio(&self, part: chrono::Duration) -> f64 {
        let total = self.analyzed.num_milliseconds();
        if total <= 0 {
            return 0.0;
        }
        part.num_milliseconds() as f64 / total as f64
    }

    pub fn high_ratio(&self) -> f64 {
        self.ratio(self.time_high)
    }

    pub fn low_ratio(&self) -> f64 {
        self.ratio(self.time_low)
    }
}

/// Reduce an ascending glucose series. Each sample outside the range is
/// credited with the time since the sample before it.
pub fn analyze(samples: &[GlucoseSample], cfg: &AutosenseCfg) -> Option<GlucoseStats> {
    let first = samples.first()?;
    let last = samples.last()?;
    let mut time_high = chrono::Duration::zero();
    let mut time_low = chrono::Duration::zero();
    let mut sum = 0.0;
    let mut prev = first.at;
    for s in samples {
        let interval = s.at - prev;
        if s.mg_dl > cfg.high_threshold {
            time_high += interval;
        }
        if s.mg_dl < cfg.low_threshold {
            time_low += interval;
        }
        prev = s.at;
        sum += s.mg_dl;
    }
    Some(GlucoseStats {
        samples: samples.len(),
        analyzed: last.at - first.at,
        time_high,
        time_low,
        mean: sum / samples.len() as f64,
        current: last.mg_dl,
    })
}

pub fn has_enough_data(stats: &GlucoseStats, cfg: &AutosenseCfg) -> bool {
    stats.samples >= cfg.min_samples && stats.analyzed > span(cfg.lookback) / 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// Too much time low: scale down.
    Low,
    /// Too much time high: scale up, with recency and trailing boosts.
    High,
    /// Neither: decay the previous factor toward 1.0.
    Decay,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Factor {
    pub branch: Branch,
    /// Clamped, unrounded.
    pub value: f64,
    /// What schedule overrides carry.
    pub rounded: f64,
}

pub fn round_tenth(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

pub fn compute_factor(stats: &GlucoseStats, previous: f64, cfg: &AutosenseCfg) -> Factor {
    let low_ratio = stats.low_ratio();
    let high_ratio = stats.high_ratio();
    let (branch, raw) = if low_ratio > cfg.low_trigger_ratio {
        (Branch::Low, 1.0 - low_ratio)
    } else if high_ratio > cfg.high_trigger_ratio {
        let mut f = 1.0 + high_ratio * HIGH_RATIO_WEIGHT;
        if stats.current > cfg.high_threshold {
            f += (stats.current - cfg.high_threshold) / CURRENT_BOOST_SPAN * BOOST_WEIGHT;
        }
        if stats.mean > cfg.high_threshold {
            f += (stats.mean - cfg.high_threshold) / MEAN_BOOST_SPAN * BOOST_WEIGHT;
        }
        (Branch::High, f)
    } else {
        (Branch::Decay, 1.0 + (previous - 1.0) * cfg.decay)
    };
    let value = raw.clamp(cfg.min_factor, cfg.max_factor);
    Factor {
        branch,
        value,
        rounded: round_tenth(value),
    }
}

/// What happened to the schedule override on a run.
#[derive(Debug, Clone, PartialEq)]
pub enum OverrideAction {
    Installed(ScheduleOverride),
    Cleared,
    Unchanged,
    /// A user-set override is active; autosense leaves it alone.
    KeptManual,
    Disabled,
    /// Disabled recently; installs resume after the suspend interval.
    Suspended,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutosenseOutcome {
    TooSoon { last_run: DateTime<Utc> },
    InsufficientData { samples: usize, analyzed_secs: i64 },
    Applied {
        stats: GlucoseStats,
        factor: Factor,
        action: OverrideAction,
    },
}

#[derive(Debug, Clone)]
struct Series {
    glucose: Vec<GlucoseSample>,
    insulin_effects: Vec<GlucoseEffect>,
    counteraction: Vec<GlucoseEffectVelocity>,
    carb_effects: Vec<GlucoseEffect>,
    cob_points: usize,
    iob_points: usize,
}

fn missing(series: &str, e: &StoreError) -> PumpError {
    PumpError::MissingData(format!("{series}: {e}"))
}

#[derive(Debug, Clone)]
pub struct AutosenseEngine {
    cfg: AutosenseCfg,
}

impl AutosenseEngine {
    pub fn new(cfg: AutosenseCfg) -> Self {
        Self { cfg }
    }

    pub fn cfg(&self) -> &AutosenseCfg {
        &self.cfg
    }

    /// Insulin effects and counteraction first (the latter needs the former),
    /// then the four remaining series in parallel.
    fn fetch(ctx: &PumpContext, start: DateTime<Utc>, end: DateTime<Utc>) -> PumpResult<Series> {
        let stores = &ctx.stores;
        let insulin_effects = stores
            .dose
            .insulin_effects(start, end)
            .map_err(|e| missing("insulin effects", &e))?;
        let counteraction = stores
            .glucose
            .counteraction_effects(start, end, &insulin_effects)
            .map_err(|e| missing("counteraction effects", &e))?;

        let velocities = counteraction.as_slice();
        let (cob, carb_effects, iob, glucose) = thread::scope(|s| {
            let cob = s.spawn(|| stores.carb.carbs_on_board(start, end, Some(velocities)));
            let carb = s.spawn(|| stores.carb.carb_effects(start, end, Some(velocities)));
            let iob = s.spawn(|| stores.dose.insulin_on_board(start, end));
            let glucose = s.spawn(|| stores.glucose.glucose_samples(start, end));
            (cob.join(), carb.join(), iob.join(), glucose.join())
        });
        let joined = |name: &str| PumpError::MissingData(format!("{name}: fetch panicked"));
        let cob = cob.map_err(|_| joined("carbs on board"))?;
        let carb_effects = carb_effects.map_err(|_| joined("carb effects"))?;
        let iob = iob.map_err(|_| joined("insulin on board"))?;
        let glucose = glucose.map_err(|_| joined("glucose samples"))?;

        let mut glucose = glucose.map_err(|e| missing("glucose samples", &e))?;
        glucose.sort_by_key(|g| g.at);
        Ok(Series {
            glucose,
            insulin_effects,
            counteraction,
            carb_effects: carb_effects.map_err(|e| missing("carb effects", &e))?,
            cob_points: cob.map_err(|e| missing("carbs on board", &e))?.len(),
            iob_points: iob.map_err(|e| missing("insulin on board", &e))?.len(),
        })
    }

    fn log_series(series: &Series) {
        tracing::debug!(
            glucose = series.glucose.len(),
            insulin_effects = series.insulin_effects.len(),
            counteraction = series.counteraction.len(),
            carb_effects = series.carb_effects.len(),
            cob = series.cob_points,
            iob = series.iob_points,
            "autosense inputs"
        );
        for g in &series.glucose {
            tracing::trace!(at = %g.at, mg_dl = g.mg_dl, "glucose");
        }
        for v in &series.counteraction {
            let per_interval = (v.end - v.start).num_seconds() as f64 * v.mg_dl_per_min / 60.0;
            tracing::trace!(start = %v.start, end = %v.end, rate = v.mg_dl_per_min, per_interval, "counteraction");
        }
    }

    pub fn run(&self, ctx: &PumpContext) -> PumpResult<AutosenseOutcome> {
        let now = ctx.now();
        let state = ctx.settings.autosense();
        if let Some(last_run) = state.last_run
            && (now - last_run).abs() < span(self.cfg.interval)
        {
            tracing::debug!(%last_run, "autosense ran recently; skipping");
            return Ok(AutosenseOutcome::TooSoon { last_run });
        }

        let start = now - span(self.cfg.lookback);
        tracing::info!(%start, end = %now, "autosense running");
        let series = Self::fetch(ctx, start, now)?;
        Self::log_series(&series);

        let Some(stats) = analyze(&series.glucose, &self.cfg).filter(|s| has_enough_data(s, &self.cfg))
        else {
            let (samples, analyzed_secs) = analyze(&series.glucose, &self.cfg)
                .map_or((0, 0), |s| (s.samples, s.analyzed.num_seconds()));
            tracing::warn!(samples, analyzed_secs, "too little glucose data for autosense");
            return Ok(AutosenseOutcome::InsufficientData {
                samples,
                analyzed_secs,
            });
        };

        let factor = compute_factor(&stats, state.factor, &self.cfg);
        tracing::info!(
            samples = stats.samples,
            analyzed_secs = stats.analyzed.num_seconds(),
            high_ratio = stats.high_ratio(),
            low_ratio = stats.low_ratio(),
            mean = stats.mean,
            current = stats.current,
            old = state.factor,
            new = factor.value,
            rounded = factor.rounded,
            branch = ?factor.branch,
            "autosense result"
        );

        let enabled = self.cfg.enabled;
        let duration = self.cfg.interval * 2;
        let suspend = span(self.cfg.suspend_interval);
        let action = ctx.settings.update(|s| {
            s.autosense.last_run = Some(now);
            s.autosense.factor = factor.value;

            if let Some(o) = &s.active_override
                && !o.is_autosense()
                && o.is_active(now)
            {
                return OverrideAction::KeptManual;
            }
            if (factor.rounded - 1.0).abs() < f64::EPSILON {
                if s.active_override.as_ref().is_some_and(ScheduleOverride::is_autosense) {
                    s.active_override = None;
                    return OverrideAction::Cleared;
                }
                return OverrideAction::Unchanged;
            }
            if !(enabled && s.autosense.enabled) {
                return OverrideAction::Disabled;
            }
            if s.autosense.suspended_at.is_some_and(|t| (now - t).abs() <= suspend) {
                return OverrideAction::Suspended;
            }
            let o = ScheduleOverride::autosense(factor.rounded, now, duration);
            s.active_override = Some(o.clone());
            OverrideAction::Installed(o)
        })?;
        tracing::info!(?action, "autosense override");

        Ok(AutosenseOutcome::Applied {
            stats,
            factor,
            action,
        })
    }
}
