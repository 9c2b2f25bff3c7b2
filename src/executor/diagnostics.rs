use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::chain::Chain;

/// Timing of a single step.
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub name: Box<str>,
    pub start: Instant,
    pub duration: Duration,
}

/// Execution metrics of one chain run.
///
/// Returned as part of every [`BuildResult`](crate::BuildResult).
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    /// Step ordinals mapped to their execution metrics.
    pub execution_times: BTreeMap<usize, StepExecution>,
}

impl Diagnostics {
    /// Sum of the time spent inside step actions.
    pub fn total(&self) -> Duration {
        self.execution_times.values().map(|exec| exec.duration).sum()
    }

    /// Time from the first step starting to the last step finishing. Lower
    /// than [`Diagnostics::total`] when steps ran in parallel.
    pub fn wall_time(&self) -> Duration {
        let start = self.execution_times.values().map(|exec| exec.start).min();
        let end = self
            .execution_times
            .values()
            .map(|exec| exec.start + exec.duration)
            .max();

        match (start, end) {
            (Some(start), Some(end)) => end.duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// The `n` slowest steps, slowest first.
    pub fn slowest(&self, n: usize) -> Vec<(usize, &StepExecution)> {
        let mut steps: Vec<_> = self
            .execution_times
            .iter()
            .map(|(ordinal, exec)| (*ordinal, exec))
            .collect();
        steps.sort_by(|a, b| b.1.duration.cmp(&a.1.duration).then(a.0.cmp(&b.0)));
        steps.truncate(n);
        steps
    }

    /// Renders the chain as a Mermaid diagram, color-coded by step duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Grey**: Did not run
    pub fn render_mermaid(&self, chain: &Chain) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let seconds = self
            .execution_times
            .values()
            .map(|exec| exec.duration.as_secs_f64());
        let mut min_time = seconds.clone().fold(f64::MAX, f64::min);
        let mut max_time = seconds.fold(f64::MIN, f64::max);

        if min_time > max_time {
            // nothing ran
            min_time = 0.0;
            max_time = 0.0;
        }

        // avoid dividing by zero when every step took the same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for step in chain.steps() {
            let name = step.name().replace('"', "\\\"");

            let (label, color) = match self.execution_times.get(&step.ordinal()) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", exec.duration), heat(t))
                }
                None => ("skipped".to_string(), "#D3D3D3".to_string()),
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", step.ordinal(), name, label);
            let _ = writeln!(f, "    style {} fill:{}", step.ordinal(), color);

            for dependency in step.dependencies() {
                let _ = writeln!(f, "    {} --> {}", dependency, step.ordinal());
            }
        }

        f
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn heat(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };
    format!("#{r:02X}{g:02X}00")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(name: &str, start: Instant, millis: u64) -> StepExecution {
        StepExecution {
            name: name.into(),
            start,
            duration: Duration::from_millis(millis),
        }
    }

    #[test]
    fn test_totals() {
        let now = Instant::now();
        let diagnostics = Diagnostics {
            execution_times: BTreeMap::from([
                (0, exec("a", now, 10)),
                (1, exec("b", now, 30)),
                (2, exec("c", now + Duration::from_millis(30), 5)),
            ]),
        };

        assert_eq!(diagnostics.total(), Duration::from_millis(45));
        assert_eq!(diagnostics.wall_time(), Duration::from_millis(35));

        let slowest = diagnostics.slowest(2);
        assert_eq!(slowest.len(), 2);
        assert_eq!(slowest[0].0, 1);
        assert_eq!(slowest[1].0, 0);
    }

    #[test]
    fn test_empty() {
        let diagnostics = Diagnostics::default();
        assert_eq!(diagnostics.total(), Duration::ZERO);
        assert_eq!(diagnostics.wall_time(), Duration::ZERO);
        assert!(diagnostics.slowest(3).is_empty());
    }

    #[test]
    fn test_heat() {
        assert_eq!(heat(0.0), "#00FF00");
        assert_eq!(heat(1.0), "#FF0000");
        assert_eq!(heat(7.0), "#FF0000");
    }
}
