// Parameters - Declarative automation timelines
//
// Every gain change in the engine is a time-scheduled event against the shared
// AudioClock. The render path only ever *reads* a timeline (value_at), the
// control path only ever *writes* it. Cancelling and re-scheduling is
// last-writer-wins.

#[derive(Debug, Clone, Copy, PartialEq)]
enum AutomationKind {
    SetValue,
    LinearRamp,
    ExponentialRamp,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct AutomationEvent {
    time: f64,
    value: f32,
    kind: AutomationKind,
}

/// Automation timeline for one parameter
///
/// Semantics follow the usual audio-graph conventions:
/// - a ramp interpolates from the value at the previous event to its own value
/// - an exponential ramp cannot start from (or reach) a non-positive value;
///   in that case the previous value is held until the ramp end
#[derive(Debug, Clone)]
pub struct AudioParam {
    default_value: f32,
    events: Vec<AutomationEvent>,
}

impl AudioParam {
    pub fn new(default_value: f32) -> Self {
        Self {
            default_value,
            events: Vec::new(),
        }
    }

    /// Insert keeping events sorted; events sharing a time keep insertion order
    fn insert(&mut self, event: AutomationEvent) {
        let index = self.events.partition_point(|e| e.time <= event.time);
        self.events.insert(index, event);
    }

    pub fn set_value_at_time(&mut self, value: f32, time: f64) {
        self.insert(AutomationEvent {
            time,
            value,
            kind: AutomationKind::SetValue,
        });
    }

    pub fn linear_ramp_to_value_at_time(&mut self, value: f32, end_time: f64) {
        self.insert(AutomationEvent {
            time: end_time,
            value,
            kind: AutomationKind::LinearRamp,
        });
    }

    pub fn exponential_ramp_to_value_at_time(&mut self, value: f32, end_time: f64) {
        self.insert(AutomationEvent {
            time: end_time,
            value,
            kind: AutomationKind::ExponentialRamp,
        });
    }

    /// Drop every event scheduled at or after `time`
    pub fn cancel_scheduled_values(&mut self, time: f64) {
        self.events.retain(|e| e.time < time);
    }

    /// Cancel everything from `time` on and hold the value the timeline had there
    ///
    /// A ramp still in flight at `time` is truncated so the curve before `time`
    /// stays untouched. Returns the held value.
    pub fn cancel_and_hold_at_time(&mut self, time: f64) -> f32 {
        let held = self.value_at(time);
        let pending_ramp = self
            .events
            .iter()
            .find(|e| e.time > time)
            .map(|e| e.kind)
            .filter(|kind| {
                matches!(
                    kind,
                    AutomationKind::LinearRamp | AutomationKind::ExponentialRamp
                )
            });

        self.cancel_scheduled_values(time);

        self.insert(AutomationEvent {
            time,
            value: held,
            kind: pending_ramp.unwrap_or(AutomationKind::SetValue),
        });
        held
    }

    /// Evaluate the timeline at `time` (seconds on the shared clock)
    pub fn value_at(&self, time: f64) -> f32 {
        let mut current = self.default_value as f64;
        let mut previous_time = 0.0_f64;

        for event in &self.events {
            if event.time > time {
                // Only a ramp ending in the future shapes the present
                let start = current;
                let span = event.time - previous_time;
                let progress = if span > 0.0 {
                    ((time - previous_time) / span).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                return match event.kind {
                    AutomationKind::LinearRamp => {
                        (start + (event.value as f64 - start) * progress) as f32
                    }
                    AutomationKind::ExponentialRamp => {
                        let end = event.value as f64;
                        if start <= 0.0 || end <= 0.0 {
                            start as f32
                        } else {
                            (start * (end / start).powf(progress)) as f32
                        }
                    }
                    AutomationKind::SetValue => current as f32,
                };
            }

            current = event.value as f64;
            previous_time = event.time;
        }

        current as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_value_without_events() {
        let param = AudioParam::new(0.7);
        assert_eq!(param.value_at(0.0), 0.7);
        assert_eq!(param.value_at(100.0), 0.7);
    }

    #[test]
    fn test_set_value_steps() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(0.5, 1.0);
        param.set_value_at_time(1.0, 2.0);

        assert_eq!(param.value_at(0.5), 0.0);
        assert_eq!(param.value_at(1.0), 0.5);
        assert_eq!(param.value_at(1.5), 0.5);
        assert_eq!(param.value_at(2.0), 1.0);
    }

    #[test]
    fn test_linear_ramp() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(0.0, 0.0);
        param.linear_ramp_to_value_at_time(0.8, 0.1);

        assert_eq!(param.value_at(0.0), 0.0);
        assert_relative_eq!(param.value_at(0.05), 0.4, epsilon = 1e-6);
        assert_eq!(param.value_at(0.1), 0.8);
        assert_eq!(param.value_at(5.0), 0.8);
    }

    #[test]
    fn test_exponential_ramp() {
        let mut param = AudioParam::new(1.0);
        param.set_value_at_time(1.0, 0.0);
        param.exponential_ramp_to_value_at_time(0.01, 1.0);

        // Geometric midpoint
        assert_relative_eq!(param.value_at(0.5), 0.1, epsilon = 1e-5);
        assert_relative_eq!(param.value_at(1.0), 0.01, epsilon = 1e-7);
    }

    #[test]
    fn test_exponential_ramp_from_zero_holds() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(0.0, 0.0);
        param.exponential_ramp_to_value_at_time(0.5, 1.0);

        assert_eq!(param.value_at(0.5), 0.0);
        assert_eq!(param.value_at(1.0), 0.5);
    }

    #[test]
    fn test_cancel_scheduled_values() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(0.0, 0.0);
        param.linear_ramp_to_value_at_time(1.0, 1.0);
        param.set_value_at_time(0.2, 2.0);

        param.cancel_scheduled_values(1.0);
        assert_eq!(param.value_at(0.5), 0.0);
        assert_eq!(param.value_at(3.0), 0.0);
    }

    #[test]
    fn test_cancel_and_hold_mid_ramp() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(0.0, 0.0);
        param.linear_ramp_to_value_at_time(1.0, 1.0);

        let held = param.cancel_and_hold_at_time(0.25);
        assert_relative_eq!(held, 0.25, epsilon = 1e-6);

        // Curve before the hold point is untouched
        assert_relative_eq!(param.value_at(0.1), 0.1, epsilon = 1e-6);
        // Value stays where it was cancelled
        assert_relative_eq!(param.value_at(0.9), 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_cancel_and_hold_then_release() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(0.0, 0.0);
        param.linear_ramp_to_value_at_time(0.8, 0.5);

        let held = param.cancel_and_hold_at_time(0.2);
        param.exponential_ramp_to_value_at_time(0.001, 0.28);
        param.set_value_at_time(0.0, 0.28);

        assert!(held > 0.0);
        assert_relative_eq!(param.value_at(0.2), held, epsilon = 1e-6);
        assert!(param.value_at(0.24) < held);
        assert_eq!(param.value_at(0.3), 0.0);
    }

    #[test]
    fn test_cancel_and_hold_after_last_event() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(0.6, 0.0);

        let held = param.cancel_and_hold_at_time(2.0);
        assert_eq!(held, 0.6);
        assert_eq!(param.value_at(1.0), 0.6);
        assert_eq!(param.value_at(3.0), 0.6);
    }
}
