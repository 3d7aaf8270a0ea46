//! Execution telemetry: per-segment timing across the tool-calling loop.
//!
//! Every model round-trip and every tool invocation is recorded as one
//! [`TimeSegment`]. Aggregates (model time, tools time, first response time,
//! iteration count) are derived from the segments so the numbers can never
//! drift apart.

use chrono::{DateTime, Utc};

use super::provider::{ProviderTiming, SegmentKind, TimeSegment};

/// Accumulates timing for one request. Created at request start, finished
/// exactly once; `snapshot()` provides the partial block attached to errors.
#[derive(Debug)]
pub struct ExecutionTimer {
    started: DateTime<Utc>,
    segments: Vec<TimeSegment>,
    iterations: u32,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            started: Utc::now(),
            segments: Vec::new(),
            iterations: 0,
        }
    }

    /// Record one model round-trip. Bumps the iteration counter.
    pub fn record_model(&mut self, name: &str, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.iterations += 1;
        self.push(SegmentKind::Model, name, start, end);
    }

    /// Record one tool invocation.
    pub fn record_tool(&mut self, name: &str, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.push(SegmentKind::Tool, name, start, end);
    }

    fn push(&mut self, kind: SegmentKind, name: &str, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.segments.push(TimeSegment {
            kind,
            name: name.to_string(),
            start_time: start,
            end_time: end,
            duration: (end - start).num_milliseconds(),
        });
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Timing block as of now. Used both for the final report and for the
    /// partial block carried by errors.
    pub fn snapshot(&self) -> ProviderTiming {
        self.snapshot_at(Utc::now())
    }

    fn snapshot_at(&self, end: DateTime<Utc>) -> ProviderTiming {
        let model_time = self.total_for(SegmentKind::Model);
        let tools_time = self.total_for(SegmentKind::Tool);
        let first_response_time = self
            .segments
            .iter()
            .find(|s| s.kind == SegmentKind::Model)
            .map(|s| (s.end_time - self.started).num_milliseconds());

        ProviderTiming {
            start_time: self.started,
            end_time: end,
            duration: (end - self.started).num_milliseconds(),
            model_time,
            tools_time,
            first_response_time,
            iterations: self.iterations,
            time_segments: self.segments.clone(),
        }
    }

    fn total_for(&self, kind: SegmentKind) -> i64 {
        self.segments
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.duration)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ts(base: DateTime<Utc>, offset_ms: i64) -> DateTime<Utc> {
        base + Duration::milliseconds(offset_ms)
    }

    #[test]
    fn test_segments_accumulate_in_order() {
        let mut timer = ExecutionTimer::start();
        let base = timer.started;

        timer.record_model("gpt-4o", ts(base, 0), ts(base, 100));
        timer.record_tool("search", ts(base, 100), ts(base, 180));
        timer.record_model("gpt-4o", ts(base, 180), ts(base, 300));

        let timing = timer.snapshot();
        assert_eq!(timing.iterations, 2);
        assert_eq!(timing.model_time, 220);
        assert_eq!(timing.tools_time, 80);
        assert_eq!(timing.first_response_time, Some(100));
        assert_eq!(timing.time_segments.len(), 3);

        // Consecutive segments never overlap
        for pair in timing.time_segments.windows(2) {
            assert!(pair[0].end_time <= pair[1].start_time);
        }
    }

    #[test]
    fn test_snapshot_before_any_segment() {
        let timer = ExecutionTimer::start();
        let timing = timer.snapshot();
        assert_eq!(timing.iterations, 0);
        assert_eq!(timing.model_time, 0);
        assert_eq!(timing.tools_time, 0);
        assert!(timing.first_response_time.is_none());
        assert!(timing.time_segments.is_empty());
    }

    #[test]
    fn test_first_response_is_initial_model_segment() {
        let mut timer = ExecutionTimer::start();
        let base = timer.started;
        timer.record_tool("early", ts(base, 0), ts(base, 10));
        timer.record_model("m", ts(base, 10), ts(base, 50));
        timer.record_model("m", ts(base, 60), ts(base, 90));

        let timing = timer.snapshot();
        assert_eq!(timing.first_response_time, Some(50));
    }
}
