//! Execution Timeline
//!
//! Tracks step start/end times of a flow run for generating
//! run reports and Gantt charts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::execution::{ExecutionResult, StepStatus};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step completed successfully
    Completed,
    /// Step failed
    Failed,
    /// Step was skipped (condition false or failure absorbed)
    Skipped,
}

impl EventType {
    fn is_terminal(self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEvent {
    /// Name of the step
    pub step: String,
    /// Type of event
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

/// Tracks the execution timeline of a flow run.
///
/// Records when each step starts and how it ends, enabling
/// Gantt charts and timing reports. Steps of a parallel group
/// overlap on the chart.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: DateTime<Utc>,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Utc::now(),
        }
    }

    /// Records an event for a step at the current time.
    pub fn add_event(&mut self, step: impl Into<String>, event_type: EventType) {
        self.add_event_at(step, event_type, Utc::now());
    }

    /// Records an event with an explicit timestamp.
    pub fn add_event_at(
        &mut self,
        step: impl Into<String>,
        event_type: EventType,
        timestamp: DateTime<Utc>,
    ) {
        self.events.push(TimelineEvent {
            step: step.into(),
            event_type,
            timestamp,
        });
    }

    /// Records the start and terminal events of a resolved step.
    pub fn record(&mut self, result: &ExecutionResult) {
        let terminal = match result.status {
            StepStatus::Success => EventType::Completed,
            StepStatus::Failed => EventType::Failed,
            StepStatus::Skipped => EventType::Skipped,
        };
        if result.attempts > 0 {
            self.add_event_at(&result.step, EventType::Started, result.started_at);
        }
        self.add_event_at(&result.step, terminal, result.finished_at);
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// When the timeline was created.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Milliseconds from timeline creation to the last event.
    pub fn elapsed_ms(&self) -> i64 {
        self.events
            .iter()
            .map(|e| self.offset_ms(e.timestamp))
            .max()
            .unwrap_or(0)
    }

    fn offset_ms(&self, timestamp: DateTime<Utc>) -> i64 {
        (timestamp - self.start_time).num_milliseconds().max(0)
    }

    /// Start and end offsets (ms) of every step that was actually invoked.
    fn spans(&self) -> HashMap<String, (i64, i64)> {
        let mut spans: HashMap<String, (i64, i64)> = HashMap::new();
        let mut started: HashMap<&str, i64> = HashMap::new();

        for event in &self.events {
            let offset = self.offset_ms(event.timestamp);
            if event.event_type.is_terminal() {
                if let Some(start) = started.get(event.step.as_str()) {
                    spans.insert(event.step.clone(), (*start, offset));
                }
            } else {
                started.insert(&event.step, offset);
            }
        }

        spans
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each invoked step is shown as a bar indicating when it ran
    /// relative to the total run time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed_ms();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut sorted_steps: Vec<_> = self.spans().into_iter().collect();
        sorted_steps.sort_by_key(|(step, (start, _))| (*start, step.clone()));

        for (step, (start, end)) in sorted_steps {
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{:16} |{:50}| ({} ms)\n",
                truncate(&step, 16),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns step durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, i64> {
        self.spans()
            .into_iter()
            .map(|(step, (start, end))| (step, end - start))
            .collect()
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::StepDescriptor;
    use chrono::Duration;

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.events.is_empty());
        assert_eq!(timeline.elapsed_ms(), 0);
    }

    #[test]
    fn test_get_durations() {
        let mut timeline = ExecutionTimeline::new();
        let t0 = timeline.started_at();
        timeline.add_event_at("triage", EventType::Started, t0);
        timeline.add_event_at("triage", EventType::Completed, t0 + Duration::milliseconds(50));

        let durations = timeline.get_durations();
        assert_eq!(durations.get("triage"), Some(&50));
    }

    #[test]
    fn test_skipped_without_start_has_no_duration() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("arbitration", EventType::Skipped);

        assert_eq!(timeline.get_events().len(), 1);
        assert!(timeline.get_durations().is_empty());
    }

    #[test]
    fn test_record_condition_false_result() {
        let mut timeline = ExecutionTimeline::new();
        let result = ExecutionResult::condition_false(&StepDescriptor::agent("arbitration"));
        timeline.record(&result);

        let events = timeline.get_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Skipped);
    }

    #[test]
    fn test_gantt_chart_shows_overlap() {
        let mut timeline = ExecutionTimeline::new();
        let t0 = timeline.started_at();
        let ms = Duration::milliseconds;

        timeline.add_event_at("specialist_a", EventType::Started, t0);
        timeline.add_event_at("specialist_b", EventType::Started, t0);
        timeline.add_event_at("specialist_b", EventType::Completed, t0 + ms(80));
        timeline.add_event_at("specialist_a", EventType::Failed, t0 + ms(100));

        let chart = timeline.gantt_chart();
        assert!(chart.contains("specialist_a"));
        assert!(chart.contains("specialist_b"));
        assert!(chart.contains("(100 ms)"));
        assert!(chart.contains("Total: 100 ms"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let timeline = ExecutionTimeline::new();
        let chart = timeline.gantt_chart();
        assert!(chart.contains("Timeline"));
        assert!(!chart.contains("Total"));
    }

    #[test]
    fn test_truncate_long_names() {
        assert_eq!(truncate("triage", 16), "triage");
        assert_eq!(truncate("a_very_long_step_name", 10), "a_very_...");
    }
}
