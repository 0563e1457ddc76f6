//! Post-hoc grouping of a session's samples into fixed time buckets.
//!
//! Everything here is a pure function of the samples passed in: the same
//! input always yields the same buckets, and nothing is written back.

use crate::model::{ActivityType, Sample};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

pub fn default_granularity() -> TimeDelta {
    TimeDelta::hours(1)
}

const LABEL_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineBucket {
    /// UTC start of the window, `YYYY-MM-DD HH:MM`.
    pub label: String,
    pub start: DateTime<Utc>,
    pub samples: Vec<Sample>,
    pub dominant_activity: ActivityType,
    pub dominant_app: String,
}

/// Group `samples` (in capture order) into buckets of `granularity`.
///
/// The dominant activity and application are picked independently: highest
/// count wins, ties go to whichever value showed up first. Buckets without any
/// analysis fall back to `other` and an empty application.
pub fn aggregate(samples: &[Sample], granularity: TimeDelta) -> Vec<TimelineBucket> {
    let mut buckets: BTreeMap<DateTime<Utc>, Vec<Sample>> = BTreeMap::new();
    for sample in samples {
        buckets
            .entry(bucket_start(sample.captured_at, granularity))
            .or_default()
            .push(sample.clone());
    }

    buckets
        .into_iter()
        .map(|(start, samples)| {
            let analyses = || samples.iter().filter_map(|s| s.analysis.as_ref());
            let dominant_activity =
                dominant(analyses().map(|a| a.activity_type)).unwrap_or_default();
            let dominant_app = dominant(analyses().map(|a| a.app_name.as_str()))
                .map(str::to_string)
                .unwrap_or_default();
            TimelineBucket {
                label: start.format(LABEL_FORMAT).to_string(),
                start,
                samples,
                dominant_activity,
                dominant_app,
            }
        })
        .collect()
}

fn bucket_start(at: DateTime<Utc>, granularity: TimeDelta) -> DateTime<Utc> {
    at.duration_trunc(granularity).unwrap_or(at)
}

/// Most frequent value; on a tie the one seen first wins.
pub fn dominant<T: PartialEq>(values: impl IntoIterator<Item = T>) -> Option<T> {
    let mut counts: Vec<(T, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((value, 1)),
        }
    }

    let mut best: Option<(T, usize)> = None;
    for (value, count) in counts {
        if best.as_ref().is_none_or(|(_, top)| count > *top) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActivityShare {
    pub duration_minutes: f64,
    pub percentage: f64,
}

/// Time spent per activity, crediting each analyzed sample with one capture
/// interval. Percentages are of the analyzed time and sum to 100.
pub fn activity_breakdown(
    samples: &[Sample],
    interval: Duration,
) -> BTreeMap<ActivityType, ActivityShare> {
    let mut counts: BTreeMap<ActivityType, u64> = BTreeMap::new();
    for analysis in samples.iter().filter_map(|s| s.analysis.as_ref()) {
        *counts.entry(analysis.activity_type).or_default() += 1;
    }

    let total: u64 = counts.values().sum();
    let minutes_per_sample = interval.as_secs_f64() / 60.0;
    counts
        .into_iter()
        .map(|(activity, count)| {
            let share = ActivityShare {
                duration_minutes: count as f64 * minutes_per_sample,
                percentage: count as f64 * 100.0 / total as f64,
            };
            (activity, share)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{activity_breakdown, aggregate, default_granularity, dominant};
    use crate::model::{ActivityType, Analysis, NewAnalysis, Sample, SampleLocator};
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use std::time::Duration;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 6, hour, minute, 0).unwrap()
    }

    fn sample(n: usize, captured_at: DateTime<Utc>, analysis: Option<(ActivityType, &str)>) -> Sample {
        let id = format!("sample-{n}");
        Sample {
            id: id.clone(),
            session_id: "s1".to_string(),
            captured_at,
            locator: SampleLocator::new(format!("loc-{n}")),
            fingerprint: None,
            analysis: analysis.map(|(activity_type, app)| {
                Analysis::from_new(
                    format!("analysis-{n}"),
                    id,
                    captured_at,
                    NewAnalysis {
                        app_name: app.to_string(),
                        activity_type,
                        description: String::new(),
                        detailed_content: None,
                        tags: Vec::new(),
                        confidence: 0.9,
                        raw_response: None,
                    },
                )
            }),
        }
    }

    #[test]
    fn empty_session_has_no_buckets() {
        assert!(aggregate(&[], default_granularity()).is_empty());
    }

    #[test]
    fn ties_go_to_first_appearance() {
        let samples = vec![
            sample(1, at(9, 0), Some((ActivityType::Coding, "Editor"))),
            sample(2, at(9, 5), Some((ActivityType::Browsing, "Browser"))),
            sample(3, at(9, 10), Some((ActivityType::Browsing, "Browser"))),
            sample(4, at(9, 15), Some((ActivityType::Coding, "Editor"))),
        ];

        let buckets = aggregate(&samples, default_granularity());
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].dominant_activity, ActivityType::Coding);
        assert_eq!(buckets[0].dominant_app, "Editor");
    }

    #[test]
    fn activity_and_app_are_picked_independently() {
        let samples = vec![
            sample(1, at(9, 0), Some((ActivityType::Browsing, "Editor"))),
            sample(2, at(9, 1), Some((ActivityType::Coding, "Editor"))),
            sample(3, at(9, 2), Some((ActivityType::Coding, "Browser"))),
        ];

        let buckets = aggregate(&samples, default_granularity());
        assert_eq!(buckets[0].dominant_activity, ActivityType::Coding);
        assert_eq!(buckets[0].dominant_app, "Editor");
    }

    #[test]
    fn buckets_are_sorted_and_keep_capture_order() {
        let samples = vec![
            sample(1, at(10, 59), Some((ActivityType::Meeting, "Call"))),
            sample(2, at(11, 0), None),
            sample(3, at(9, 30), Some((ActivityType::Design, "Canvas"))),
            sample(4, at(10, 1), Some((ActivityType::Meeting, "Call"))),
        ];

        let buckets = aggregate(&samples, default_granularity());
        let labels: Vec<_> = buckets.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["2026-05-06 09:00", "2026-05-06 10:00", "2026-05-06 11:00"]);

        let ten_oclock: Vec<_> = buckets[1].samples.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ten_oclock, vec!["sample-1", "sample-4"]);
    }

    #[test]
    fn unanalyzed_bucket_defaults_to_other() {
        let buckets = aggregate(&[sample(1, at(8, 0), None)], default_granularity());
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].dominant_activity, ActivityType::Other);
        assert_eq!(buckets[0].dominant_app, "");
        assert_eq!(buckets[0].samples.len(), 1);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let samples = vec![
            sample(1, at(9, 0), Some((ActivityType::Coding, "Editor"))),
            sample(2, at(13, 0), Some((ActivityType::Communication, "Chat"))),
        ];
        let first = serde_json::to_vec(&aggregate(&samples, default_granularity())).expect("json");
        let second = serde_json::to_vec(&aggregate(&samples, default_granularity())).expect("json");
        assert_eq!(first, second);
    }

    #[test]
    fn granularity_is_configurable() {
        let samples = vec![
            sample(1, at(9, 0), None),
            sample(2, at(9, 14), None),
            sample(3, at(9, 15), None),
        ];
        let buckets = aggregate(&samples, TimeDelta::minutes(15));
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[1].label, "2026-05-06 09:15");
    }

    #[test]
    fn dominant_of_nothing_is_none() {
        assert_eq!(dominant(Vec::<u8>::new()), None);
        assert_eq!(dominant([3, 1, 1, 3]), Some(3));
    }

    #[test]
    fn breakdown_credits_one_interval_per_analyzed_sample() {
        let samples = vec![
            sample(1, at(9, 0), Some((ActivityType::Coding, "Editor"))),
            sample(2, at(9, 1), Some((ActivityType::Coding, "Editor"))),
            sample(3, at(9, 2), Some((ActivityType::Browsing, "Browser"))),
            sample(4, at(9, 3), None),
        ];

        let breakdown = activity_breakdown(&samples, Duration::from_secs(30));
        let coding = breakdown[&ActivityType::Coding];
        assert!((coding.duration_minutes - 1.0).abs() < 1e-9);
        assert!((coding.percentage - 200.0 / 3.0).abs() < 1e-9);
        assert!(!breakdown.contains_key(&ActivityType::Other));
    }
}
