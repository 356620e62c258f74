//! Block-to-block feedback scenarios.
//!
//! A scenario is picked from the change in accuracy (percentage points) and
//! average reaction time (ms) between the current and the previous block.
//! Faster responses are "short", slower ones "long".

use serde::{Deserialize, Serialize};

use crate::core::format::round_to;

pub const ACCURACY_CHANGE: f64 = 2.0;
pub const ACCURACY_STRONG_CHANGE: f64 = 5.0;
pub const RT_CHANGE_MS: f64 = 30.0;
pub const RT_STRONG_CHANGE_MS: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKey {
    Synergy,
    Fatigue,
    ShortAccUp,
    ShortAccDown,
    ShortSame,
    LongAccUp,
    LongAccDown,
    LongSame,
    SameAccUp,
    SameAccDown,
    SameSame,
}

impl ScenarioKey {
    pub const ALL: [ScenarioKey; 11] = [
        ScenarioKey::Synergy,
        ScenarioKey::Fatigue,
        ScenarioKey::ShortAccUp,
        ScenarioKey::ShortAccDown,
        ScenarioKey::ShortSame,
        ScenarioKey::LongAccUp,
        ScenarioKey::LongAccDown,
        ScenarioKey::LongSame,
        ScenarioKey::SameAccUp,
        ScenarioKey::SameAccDown,
        ScenarioKey::SameSame,
    ];

    /// Key used when there is no previous block to compare against.
    pub const NEUTRAL: ScenarioKey = ScenarioKey::SameSame;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synergy => "synergy",
            Self::Fatigue => "fatigue",
            Self::ShortAccUp => "short_acc_up",
            Self::ShortAccDown => "short_acc_down",
            Self::ShortSame => "short_same",
            Self::LongAccUp => "long_acc_up",
            Self::LongAccDown => "long_acc_down",
            Self::LongSame => "long_same",
            Self::SameAccUp => "same_acc_up",
            Self::SameAccDown => "same_acc_down",
            Self::SameSame => "same_same",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == raw)
    }

    fn from_buckets(rt: Trend, accuracy: Trend) -> Self {
        use Trend::*;
        match (rt, accuracy) {
            (Improved, Improved) => Self::ShortAccUp,
            (Improved, Declined) => Self::ShortAccDown,
            (Improved, Steady) => Self::ShortSame,
            (Declined, Improved) => Self::LongAccUp,
            (Declined, Declined) => Self::LongAccDown,
            (Declined, Steady) => Self::LongSame,
            (Steady, Improved) => Self::SameAccUp,
            (Steady, Declined) => Self::SameAccDown,
            (Steady, Steady) => Self::SameSame,
        }
    }
}

impl std::fmt::Display for ScenarioKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two block metrics the classifier compares.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockPerformance {
    pub accuracy: f64,
    #[serde(rename = "averageRT")]
    pub average_rt: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trend {
    Improved,
    Declined,
    Steady,
}

fn trend(improvement: f64, threshold: f64) -> Trend {
    if improvement >= threshold {
        Trend::Improved
    } else if improvement <= -threshold {
        Trend::Declined
    } else {
        Trend::Steady
    }
}

pub fn classify(current: &BlockPerformance, previous: Option<&BlockPerformance>) -> ScenarioKey {
    let Some(previous) = previous else {
        return ScenarioKey::NEUTRAL;
    };

    // Inputs carry two decimals; the raw f64 difference can land just under a threshold.
    let acc_diff = round_to(current.accuracy - previous.accuracy, 2);
    // Positive means slower.
    let rt_diff = round_to(current.average_rt - previous.average_rt, 2);

    let strong_rt_improve = rt_diff <= -RT_STRONG_CHANGE_MS;
    let strong_rt_decline = rt_diff >= RT_STRONG_CHANGE_MS;
    let strong_acc_improve = acc_diff >= ACCURACY_STRONG_CHANGE;
    let strong_acc_decline = acc_diff <= -ACCURACY_STRONG_CHANGE;

    if strong_rt_improve && strong_acc_improve {
        return ScenarioKey::Synergy;
    }
    if strong_rt_decline && strong_acc_decline {
        return ScenarioKey::Fatigue;
    }

    ScenarioKey::from_buckets(trend(-rt_diff, RT_CHANGE_MS), trend(acc_diff, ACCURACY_CHANGE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perf(accuracy: f64, average_rt: f64) -> BlockPerformance {
        BlockPerformance {
            accuracy,
            average_rt,
        }
    }

    /// Classify a pair of deltas against a fixed baseline block.
    fn delta(acc_diff: f64, rt_diff: f64) -> ScenarioKey {
        let previous = perf(80.0, 700.0);
        classify(&perf(80.0 + acc_diff, 700.0 + rt_diff), Some(&previous))
    }

    #[test]
    fn first_block_is_neutral() {
        assert_eq!(classify(&perf(10.0, 2000.0), None), ScenarioKey::SameSame);
    }

    #[test]
    fn strong_overrides_preempt_the_grid() {
        assert_eq!(delta(5.0, -80.0), ScenarioKey::Synergy);
        assert_eq!(delta(12.0, -300.0), ScenarioKey::Synergy);
        assert_eq!(delta(-5.0, 80.0), ScenarioKey::Fatigue);
        // Strong in one dimension only falls through to the grid.
        assert_eq!(delta(4.9, -80.0), ScenarioKey::ShortAccUp);
        assert_eq!(delta(-5.0, 79.9), ScenarioKey::LongAccDown);
    }

    #[test]
    fn grid_covers_every_bucket_pair() {
        assert_eq!(delta(3.0, -50.0), ScenarioKey::ShortAccUp);
        assert_eq!(delta(-2.0, -30.0), ScenarioKey::ShortAccDown);
        assert_eq!(delta(1.9, -30.0), ScenarioKey::ShortSame);
        assert_eq!(delta(2.0, 30.0), ScenarioKey::LongAccUp);
        assert_eq!(delta(-3.0, 45.0), ScenarioKey::LongAccDown);
        assert_eq!(delta(0.0, 100.0), ScenarioKey::LongSame);
        assert_eq!(delta(2.0, 29.9), ScenarioKey::SameAccUp);
        assert_eq!(delta(-2.5, -29.0), ScenarioKey::SameAccDown);
        assert_eq!(delta(0.0, 0.0), ScenarioKey::SameSame);
        assert_eq!(delta(-1.9, 29.9), ScenarioKey::SameSame);
    }

    #[test]
    fn two_decimal_accuracies_hit_thresholds_exactly() {
        // 8/60 -> 11/60 correct is a five point gain.
        assert_eq!(
            classify(&perf(18.33, 620.0), Some(&perf(13.33, 700.0))),
            ScenarioKey::Synergy
        );
        assert_eq!(
            classify(&perf(65.38, 700.0), Some(&perf(60.38, 700.0))),
            ScenarioKey::SameAccUp
        );
        assert_eq!(
            classify(&perf(30.19, 780.0), Some(&perf(35.19, 700.0))),
            ScenarioKey::Fatigue
        );
        assert_eq!(
            classify(&perf(64.71, 700.0), Some(&perf(62.71, 700.0))),
            ScenarioKey::SameAccUp
        );
        assert_eq!(
            classify(&perf(62.71, 700.0), Some(&perf(64.71, 700.0))),
            ScenarioKey::SameAccDown
        );
    }

    #[test]
    fn classification_is_total_over_a_boundary_grid() {
        let acc_points = [-6.0, -5.0, -4.9, -2.0, -1.9, 0.0, 1.9, 2.0, 4.9, 5.0, 6.0];
        let rt_points = [-90.0, -80.0, -79.9, -30.0, -29.9, 0.0, 29.9, 30.0, 79.9, 80.0, 90.0];
        for acc in acc_points {
            for rt in rt_points {
                let key = delta(acc, rt);
                assert_eq!(delta(acc, rt), key, "non-deterministic at ({acc}, {rt})");
                assert!(ScenarioKey::ALL.contains(&key));
            }
        }
    }

    #[test]
    fn keys_round_trip_through_their_names() {
        for key in ScenarioKey::ALL {
            assert_eq!(ScenarioKey::parse(key.as_str()), Some(key));
            assert_eq!(serde_json::to_string(&key).unwrap(), format!("\"{key}\""));
        }
        assert_eq!(ScenarioKey::parse("meh"), None);
    }
}
