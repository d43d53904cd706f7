//! Line grammar for quality-search output.
//!
//! Each line is tried against an ordered list of rules; the first match
//! produces a [`SearchEvent`]. Anything unmatched is [`SearchEvent::Ignored`].

use regex::{Captures, Regex};
use std::sync::LazyLock;

const NUM: &str = r"\d+(?:\.\d+)?";

const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = MIB * 1024.0;
const TIB: f64 = GIB * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    MB,
    GB,
    TB,
}

impl SizeUnit {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "MB" => Some(SizeUnit::MB),
            "GB" => Some(SizeUnit::GB),
            "TB" => Some(SizeUnit::TB),
            _ => None,
        }
    }

    pub fn bytes(&self, value: f64) -> u64 {
        let factor = match self {
            SizeUnit::MB => MIB,
            SizeUnit::GB => GIB,
            SizeUnit::TB => TIB,
        };
        (value * factor).round() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
}

impl TimeUnit {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "seconds" | "second" => Some(TimeUnit::Seconds),
            "minutes" | "minute" => Some(TimeUnit::Minutes),
            "hours" | "hour" => Some(TimeUnit::Hours),
            _ => None,
        }
    }

    pub fn seconds(&self, value: f64) -> f64 {
        match self {
            TimeUnit::Seconds => value,
            TimeUnit::Minutes => value * 60.0,
            TimeUnit::Hours => value * 3600.0,
        }
    }
}

/// One recognized line of quality-search output.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchEvent {
    Sample {
        crf: f64,
        score: f64,
        percent: f64,
    },
    Eta {
        crf: f64,
        score: f64,
        size: f64,
        unit: SizeUnit,
        percent: f64,
        time: f64,
        time_unit: TimeUnit,
    },
    Success {
        crf: f64,
    },
    NoSuitableCrf,
    Ignored,
}

impl SearchEvent {
    /// Predicted size in bytes for `Eta` events.
    pub fn predicted_bytes(&self) -> Option<u64> {
        match self {
            SearchEvent::Eta { size, unit, .. } => Some(unit.bytes(*size)),
            _ => None,
        }
    }

    /// Predicted encode time in seconds for `Eta` events.
    pub fn predicted_seconds(&self) -> Option<f64> {
        match self {
            SearchEvent::Eta {
                time, time_unit, ..
            } => Some(time_unit.seconds(*time)),
            _ => None,
        }
    }
}

struct LineRule {
    pattern: Regex,
    build: fn(&Captures<'_>) -> Option<SearchEvent>,
}

fn rule(pattern: &str, build: fn(&Captures<'_>) -> Option<SearchEvent>) -> LineRule {
    LineRule {
        pattern: Regex::new(pattern).expect("valid regex"),
        build,
    }
}

fn num(caps: &Captures<'_>, name: &str) -> Option<f64> {
    caps.name(name)?.as_str().parse().ok()
}

static GRAMMAR: LazyLock<Vec<LineRule>> = LazyLock::new(|| {
    vec![
        rule(r"Failed to find a suitable crf", |_| {
            Some(SearchEvent::NoSuitableCrf)
        }),
        rule(&format!(r"\bcrf (?P<crf>{NUM}) successful"), |caps| {
            Some(SearchEvent::Success {
                crf: num(caps, "crf")?,
            })
        }),
        rule(
            &format!(
                r"\bcrf (?P<crf>{NUM}) VMAF (?P<score>{NUM}) predicted video stream size (?P<size>{NUM}) (?P<unit>MB|GB|TB) \((?P<percent>{NUM})%\) taking (?P<time>{NUM}) (?P<time_unit>seconds?|minutes?|hours?)"
            ),
            |caps| {
                Some(SearchEvent::Eta {
                    crf: num(caps, "crf")?,
                    score: num(caps, "score")?,
                    size: num(caps, "size")?,
                    unit: SizeUnit::parse(caps.name("unit")?.as_str())?,
                    percent: num(caps, "percent")?,
                    time: num(caps, "time")?,
                    time_unit: TimeUnit::parse(caps.name("time_unit")?.as_str())?,
                })
            },
        ),
        rule(
            &format!(
                r"\bsample \d+/\d+ crf (?P<crf>{NUM}) VMAF (?P<score>{NUM}) \((?P<percent>{NUM})%\)"
            ),
            |caps| {
                Some(SearchEvent::Sample {
                    crf: num(caps, "crf")?,
                    score: num(caps, "score")?,
                    percent: num(caps, "percent")?,
                })
            },
        ),
    ]
});

/// Classify one output line.
pub fn parse_line(line: &str) -> SearchEvent {
    let line = line.trim();
    for rule in GRAMMAR.iter() {
        if let Some(caps) = rule.pattern.captures(line) {
            if let Some(event) = (rule.build)(&caps) {
                return event;
            }
        }
    }
    SearchEvent::Ignored
}
