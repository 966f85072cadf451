//! Job schedules.
//!
//! A schedule is either a fixed interval (`every 15m`, aligned to the Unix
//! epoch so every process computes the same occurrences) or a 6/7-field
//! cron expression (`0 */10 * * * *`).

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use sync_harness_core::models::SourceType;

use crate::config::Config;
use crate::queue::TaskKind;

#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Every(Duration),
    Cron {
        expr: String,
        schedule: Box<cron::Schedule>,
    },
}

impl FromStr for ScheduleSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("every ") {
            return Ok(ScheduleSpec::Every(parse_interval(rest.trim())?));
        }
        let schedule = cron::Schedule::from_str(s)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("'{}' is neither 'every <n><s|m|h|d>' nor a cron expression", s))?;
        Ok(ScheduleSpec::Cron {
            expr: s.to_string(),
            schedule: Box::new(schedule),
        })
    }
}

fn parse_interval(text: &str) -> Result<Duration> {
    let (digits, unit) = text.split_at(text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len()));
    let n: i64 = digits
        .parse()
        .with_context(|| format!("invalid interval '{}'", text))?;
    if n <= 0 {
        bail!("interval must be positive: '{}'", text);
    }
    Ok(match unit.trim() {
        "s" => Duration::seconds(n),
        "m" => Duration::minutes(n),
        "h" => Duration::hours(n),
        "d" => Duration::days(n),
        other => bail!("unknown interval unit '{}' (use s, m, h, or d)", other),
    })
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::Every(d) => write!(f, "every {}s", d.num_seconds()),
            ScheduleSpec::Cron { expr, .. } => f.write_str(expr),
        }
    }
}

impl ScheduleSpec {
    /// First occurrence strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScheduleSpec::Every(d) => {
                let step = d.num_milliseconds();
                let now = t.timestamp_millis();
                let next = (now.div_euclid(step) + 1) * step;
                Utc.timestamp_millis_opt(next).single()
            }
            ScheduleSpec::Cron { schedule, .. } => schedule.after(&t).next(),
        }
    }

    /// Latest occurrence at or before `t`.
    pub fn most_recent_at_or_before(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScheduleSpec::Every(d) => {
                let step = d.num_milliseconds();
                let floor = t.timestamp_millis().div_euclid(step) * step;
                Utc.timestamp_millis_opt(floor).single()
            }
            ScheduleSpec::Cron { schedule, .. } => {
                // Scan forward from progressively earlier starting points.
                for lookback in [
                    Duration::hours(1),
                    Duration::days(1),
                    Duration::days(32),
                    Duration::days(366),
                    Duration::days(366 * 5),
                ] {
                    let latest = schedule
                        .after(&(t - lookback - Duration::seconds(1)))
                        .take_while(|occ| *occ <= t)
                        .last();
                    if latest.is_some() {
                        return latest;
                    }
                }
                None
            }
        }
    }

    /// Nominal spacing between occurrences around `t`.
    pub fn period_near(&self, t: DateTime<Utc>) -> Option<Duration> {
        let prev = self.most_recent_at_or_before(t)?;
        let next = self.next_after(prev)?;
        Some(next - prev)
    }
}

/// A recurring unit of work known to the scheduler.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub name: String,
    pub kind: TaskKind,
    pub schedule: ScheduleSpec,
    /// Jobs that feed the index are recovered after downtime.
    pub feeds_index: bool,
}

pub fn ingest_job_name(source_type: SourceType) -> String {
    format!("ingest:{}", source_type)
}

pub const RETENTION_SWEEP_JOB: &str = "retention_sweep";

/// One ingest job per configured source, plus the cache retention sweep.
pub fn jobs_from_config(config: &Config) -> Result<Vec<JobDefinition>> {
    let mut jobs = Vec::with_capacity(config.sources.len() + 1);
    for (source_type, source) in &config.sources {
        jobs.push(JobDefinition {
            name: ingest_job_name(*source_type),
            kind: TaskKind::Ingest(*source_type),
            schedule: source.schedule.parse()?,
            feeds_index: true,
        });
    }
    jobs.push(JobDefinition {
        name: RETENTION_SWEEP_JOB.to_string(),
        kind: TaskKind::RetentionSweep,
        schedule: config.cache.sweep_schedule.parse()?,
        feeds_index: false,
    });
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn parses_intervals() {
        assert!(matches!(
            "every 15m".parse::<ScheduleSpec>().unwrap(),
            ScheduleSpec::Every(d) if d == Duration::minutes(15)
        ));
        assert!("every 0m".parse::<ScheduleSpec>().is_err());
        assert!("every 5y".parse::<ScheduleSpec>().is_err());
        assert!("whenever".parse::<ScheduleSpec>().is_err());
    }

    #[test]
    fn intervals_align_to_epoch() {
        let spec: ScheduleSpec = "every 15m".parse().unwrap();
        let t = at(900 * 10 + 7);
        assert_eq!(spec.most_recent_at_or_before(t), Some(at(9000)));
        assert_eq!(spec.next_after(t), Some(at(9900)));
        assert_eq!(spec.most_recent_at_or_before(at(9000)), Some(at(9000)));
        assert_eq!(spec.next_after(at(9000)), Some(at(9900)));
    }

    #[test]
    fn cron_occurrences() {
        let spec: ScheduleSpec = "0 0 * * * *".parse().unwrap();
        let t = at(3600 * 5 + 120);
        assert_eq!(spec.most_recent_at_or_before(t), Some(at(3600 * 5)));
        assert_eq!(spec.next_after(t), Some(at(3600 * 6)));
        assert_eq!(spec.most_recent_at_or_before(at(3600 * 5)), Some(at(3600 * 5)));
        assert_eq!(spec.period_near(t), Some(Duration::hours(1)));
    }
}
