//! Topic schema of the fleet bus.
//!
//! Topics are slash-joined segments rooted at the fleet tag, e.g.
//! `pioreactor/<unit>/<experiment>/throughput_calculating/media_throughput`.
//! A pattern segment `+` matches exactly one concrete segment; there is no
//! multi-segment wildcard, so a pattern only matches topics of its own length.

use crate::error::TopicError;
use std::fmt;

pub const FLEET_TAG: &str = "pioreactor";
pub const SEPARATOR: char = '/';
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Segment layout of the telemetry topic.
pub const UNIT_POSITION: usize = 1;

pub const THROUGHPUT_SUBSYSTEM: &str = "throughput_calculating";
pub const LOGS_SUBSYSTEM: &str = "logs";
pub const DOSING_SUBSYSTEM: [&str; 2] = ["dosing_control", "dosing_automation"];
pub const SET_ACTION: &str = "set";

/// A concrete topic. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    segments: Vec<String>,
}

impl Topic {
    /// Builds a topic from concrete segments, rejecting anything that would
    /// change the segment count once joined.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, TopicError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for (position, segment) in segments.iter().enumerate() {
            validate_segment(position, segment)?;
        }
        Ok(Self { segments })
    }

    /// Splits a topic as received from the bus. No validation: whatever the
    /// broker delivered is what gets matched.
    pub fn parse(raw: &str) -> Self {
        Self {
            segments: raw.split(SEPARATOR).map(str::to_string).collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn segment(&self, position: usize) -> Option<&str> {
        self.segments.get(position).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

fn validate_segment(position: usize, segment: &str) -> Result<(), TopicError> {
    if segment.is_empty() {
        return Err(TopicError::EmptySegment { position });
    }
    if segment.contains(['/', '+', '#']) {
        return Err(TopicError::ReservedCharacter {
            segment: segment.to_string(),
        });
    }
    Ok(())
}

/// One segment of a subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatternSegment {
    Literal(String),
    Wildcard,
}

/// Subscription pattern, e.g. `pioreactor/+/+/logs/+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    segments: Vec<PatternSegment>,
}

/// Result of a successful match: the topic plus the values bound by each `+`,
/// by position. Wildcards are not named; callers know the pattern layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMatch {
    topic: Topic,
    bound: Vec<(usize, String)>,
}

impl TopicMatch {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Concrete segment at `position` in the matched topic.
    pub fn segment(&self, position: usize) -> Option<&str> {
        self.topic.segment(position)
    }

    /// Value bound by the `index`-th wildcard of the pattern.
    pub fn wildcard(&self, index: usize) -> Option<&str> {
        self.bound.get(index).map(|(_, value)| value.as_str())
    }
}

impl TopicPattern {
    pub fn parse(raw: &str) -> Self {
        let segments = raw
            .split(SEPARATOR)
            .map(|s| {
                if s == SINGLE_LEVEL_WILDCARD {
                    PatternSegment::Wildcard
                } else {
                    PatternSegment::Literal(s.to_string())
                }
            })
            .collect();
        Self { segments }
    }

    pub fn segments(&self) -> &[PatternSegment] {
        &self.segments
    }

    pub fn matches(&self, topic: &Topic) -> bool {
        self.segments.len() == topic.len()
            && self
                .segments
                .iter()
                .zip(topic.segments())
                .all(|(pattern, concrete)| match pattern {
                    PatternSegment::Wildcard => true,
                    PatternSegment::Literal(literal) => literal == concrete,
                })
    }

    /// Matches and binds wildcard values in one pass.
    pub fn capture(&self, topic: &Topic) -> Option<TopicMatch> {
        if !self.matches(topic) {
            return None;
        }
        let bound = self
            .segments
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, PatternSegment::Wildcard))
            .map(|(position, _)| (position, topic.segments()[position].clone()))
            .collect();
        Some(TopicMatch {
            topic: topic.clone(),
            bound,
        })
    }

    /// `pioreactor/+/<experiment>/throughput_calculating/+`
    pub fn throughput(experiment: &str) -> Self {
        Self::parse(&format!(
            "{FLEET_TAG}/+/{experiment}/{THROUGHPUT_SUBSYSTEM}/+"
        ))
    }

    /// `pioreactor/+/<experiment>/logs/+`
    pub fn logs(experiment: &str) -> Self {
        Self::parse(&format!("{FLEET_TAG}/+/{experiment}/{LOGS_SUBSYSTEM}/+"))
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self
            .segments
            .iter()
            .map(|s| match s {
                PatternSegment::Wildcard => SINGLE_LEVEL_WILDCARD,
                PatternSegment::Literal(l) => l.as_str(),
            })
            .collect();
        f.write_str(&joined.join("/"))
    }
}

/// `pioreactor/<unit>/<experiment>/<subsystem...>/<action>`. The literal path
/// is shared with the device side and must not drift.
pub fn command_topic(
    unit: &str,
    experiment: &str,
    subsystem: &[String],
    action: &str,
) -> Result<Topic, TopicError> {
    let mut segments = Vec::with_capacity(subsystem.len() + 4);
    segments.push(FLEET_TAG.to_string());
    segments.push(unit.to_string());
    segments.push(experiment.to_string());
    segments.extend(subsystem.iter().cloned());
    segments.push(action.to_string());
    Topic::from_segments(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_exactly_one_segment() {
        let pattern = TopicPattern::parse("pioreactor/+/+/logs/+");
        let topic = Topic::parse("pioreactor/unit3/expA/logs/app");

        let m = pattern.capture(&topic).expect("should match");
        assert_eq!(m.segment(UNIT_POSITION), Some("unit3"));
        assert_eq!(m.wildcard(0), Some("unit3"));
        assert_eq!(m.wildcard(1), Some("expA"));
        assert_eq!(m.wildcard(2), Some("app"));
    }

    #[test]
    fn segment_count_must_match() {
        let pattern = TopicPattern::parse("pioreactor/+/+/logs/+");
        assert!(!pattern.matches(&Topic::parse("pioreactor/unit3/logs/app")));
        assert!(!pattern.matches(&Topic::parse("pioreactor/unit3/expA/logs/app/extra")));
    }

    #[test]
    fn literals_must_match_exactly() {
        let pattern = TopicPattern::throughput("expA");
        assert!(pattern.matches(&Topic::parse(
            "pioreactor/u1/expA/throughput_calculating/media_throughput"
        )));
        assert!(!pattern.matches(&Topic::parse(
            "pioreactor/u1/expB/throughput_calculating/media_throughput"
        )));
    }

    #[test]
    fn command_topic_is_slash_joined() {
        let subsystem: Vec<String> = DOSING_SUBSYSTEM.iter().map(|s| s.to_string()).collect();
        let topic = command_topic("u1", "expA", &subsystem, SET_ACTION).unwrap();
        assert_eq!(
            topic.to_string(),
            "pioreactor/u1/expA/dosing_control/dosing_automation/set"
        );
    }

    #[test]
    fn reserved_characters_are_rejected() {
        assert_eq!(
            Topic::from_segments(["pioreactor", "u1", "exp/A"]),
            Err(TopicError::ReservedCharacter {
                segment: "exp/A".into()
            })
        );
        assert_eq!(
            Topic::from_segments(["pioreactor", "", "expA"]),
            Err(TopicError::EmptySegment { position: 1 })
        );
        assert!(Topic::from_segments(["pioreactor", "u+1"]).is_err());
    }

    #[test]
    fn pattern_display_round_trips() {
        assert_eq!(
            TopicPattern::logs("expA").to_string(),
            "pioreactor/+/expA/logs/+"
        );
    }
}
