//! Pattern Analyzer
//!
//! Scores a user's recent activity for bot-like behaviour. Two signals:
//!
//! - **Timing regularity**: inter-event intervals that are nearly identical
//!   (robotic cadence) or mostly a few seconds apart (bursts) lower the score.
//! - **Velocity**: today's volume against the average of the previous days.
//!
//! Analysis is pure; callers fetch the activity log and pass it in.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ActivityEntry;

#[derive(Debug, Clone)]
pub struct PatternConfig {
    /// Most recent entries used for timing analysis
    pub timing_sample: usize,
    /// Fewer intervals than this gives a neutral timing score
    pub min_intervals: usize,
    /// Coefficient of variation below which cadence is considered robotic
    pub robotic_cv_threshold: f64,
    /// Intervals shorter than this count as burst intervals
    pub burst_interval_secs: f64,
    /// Share of burst intervals above which activity is considered bursty
    pub burst_fraction_threshold: f64,
    /// Days in the velocity baseline
    pub baseline_days: i64,
    /// Daily baseline floor so a quiet history does not inflate the ratio
    pub min_baseline: f64,
    /// Today/baseline ratio above which a rapid increase is flagged
    pub rapid_increase_ratio: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            timing_sample: 30,
            min_intervals: 5,
            robotic_cv_threshold: 0.15,
            burst_interval_secs: 3.0,
            burst_fraction_threshold: 0.3,
            baseline_days: 7,
            min_baseline: 5.0,
            rapid_increase_ratio: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingAnalysis {
    pub score: f64,
    pub intervals: usize,
    pub coefficient_of_variation: Option<f64>,
    pub burst_fraction: Option<f64>,
    pub robotic: bool,
    pub bursty: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VelocityAnalysis {
    pub score: f64,
    pub today: usize,
    pub baseline_daily_average: f64,
    pub ratio: f64,
    pub rapid_increase: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternAnalysis {
    pub timing: TimingAnalysis,
    pub velocity: VelocityAnalysis,
}

#[derive(Debug, Clone, Default)]
pub struct PatternAnalyzer {
    config: PatternConfig,
}

impl PatternAnalyzer {
    pub fn new(config: PatternConfig) -> Self {
        Self { config }
    }

    /// Analyze entries in any order
    pub fn analyze(&self, entries: &[ActivityEntry], now: DateTime<Utc>) -> PatternAnalysis {
        PatternAnalysis {
            timing: self.analyze_timing(entries),
            velocity: self.analyze_velocity(entries, now),
        }
    }

    pub fn analyze_timing(&self, entries: &[ActivityEntry]) -> TimingAnalysis {
        let mut times: Vec<DateTime<Utc>> = entries.iter().map(|e| e.at).collect();
        times.sort_unstable_by(|a, b| b.cmp(a));
        times.truncate(self.config.timing_sample);
        times.reverse();

        let intervals: Vec<f64> = times
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).num_milliseconds() as f64 / 1000.0)
            .collect();

        if intervals.len() < self.config.min_intervals {
            return TimingAnalysis {
                score: 100.0,
                intervals: intervals.len(),
                coefficient_of_variation: None,
                burst_fraction: None,
                robotic: false,
                bursty: false,
            };
        }

        let n = intervals.len() as f64;
        let mean = intervals.iter().sum::<f64>() / n;
        let variance = intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / n;
        let cv = if mean > 0.0 { variance.sqrt() / mean } else { 0.0 };

        let bursts = intervals
            .iter()
            .filter(|i| **i < self.config.burst_interval_secs)
            .count();
        let burst_fraction = bursts as f64 / n;

        let robotic = cv < self.config.robotic_cv_threshold;
        let bursty = burst_fraction > self.config.burst_fraction_threshold;

        let mut penalty = 0.0;
        if robotic {
            // 30 at the threshold, 70 for perfectly even spacing
            penalty += 30.0 + 40.0 * (1.0 - cv / self.config.robotic_cv_threshold);
        }
        if bursty {
            penalty += 60.0 * burst_fraction;
        }

        TimingAnalysis {
            score: clamp_score(100.0 - penalty),
            intervals: intervals.len(),
            coefficient_of_variation: Some(cv),
            burst_fraction: Some(burst_fraction),
            robotic,
            bursty,
        }
    }

    pub fn analyze_velocity(&self, entries: &[ActivityEntry], now: DateTime<Utc>) -> VelocityAnalysis {
        let ts = now.timestamp();
        let today_start = DateTime::from_timestamp(ts - ts.rem_euclid(86_400), 0).unwrap_or(now);
        let baseline_start = today_start - Duration::days(self.config.baseline_days);

        let today = entries.iter().filter(|e| e.at >= today_start).count();
        let previous = entries
            .iter()
            .filter(|e| e.at >= baseline_start && e.at < today_start)
            .count();

        let baseline = previous as f64 / self.config.baseline_days.max(1) as f64;
        let ratio = today as f64 / baseline.max(self.config.min_baseline);

        VelocityAnalysis {
            score: velocity_score(ratio),
            today,
            baseline_daily_average: baseline,
            ratio,
            rapid_increase: ratio > self.config.rapid_increase_ratio,
        }
    }
}

/// 100 up to 1.5x baseline, 60 at 2x, 20 at 3x, floored at 10
fn velocity_score(ratio: f64) -> f64 {
    let score = if ratio <= 1.5 {
        100.0
    } else if ratio <= 2.0 {
        100.0 - (ratio - 1.5) * 80.0
    } else if ratio <= 3.0 {
        60.0 - (ratio - 2.0) * 40.0
    } else {
        20.0 - (ratio - 3.0) * 10.0
    };
    score.max(10.0)
}

pub(crate) fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 100.0)
}
