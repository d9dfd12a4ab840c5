use std::collections::HashMap;
use std::fmt::{Display, Formatter, Write};
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;

use crate::graph::TargetGraph;

#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// What a single build did.
///
/// Returned by [`Builder::build`](crate::Builder::build).
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// The evaluated graph, absent when no target was requested.
    pub graph: Option<TargetGraph>,
    /// Targets that ran to completion, keyed by their graph node.
    pub execution_times: HashMap<NodeIndex, TaskExecution>,
    /// Targets found dirty before scheduling.
    pub dirty: usize,
    /// Commands that exited successfully.
    pub commands_run: usize,
    /// Most workers alive at the same time.
    pub peak_workers: usize,
    pub elapsed: Duration,
}

impl Diagnostics {
    /// Names of the targets that ran, in the order they started.
    pub fn executed(&self) -> Vec<&str> {
        let Some(graph) = &self.graph else {
            return Vec::new();
        };

        let mut ran: Vec<_> = self.execution_times.iter().collect();
        ran.sort_by_key(|(index, exec)| (exec.start, **index));
        ran.into_iter().map(|(&index, _)| graph[index].name()).collect()
    }

    /// Renders the target graph as a Mermaid diagram, color-coded by
    /// execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Clean (skipped)
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let Some(graph) = &self.graph else {
            return f;
        };

        let times = &self.execution_times;
        let min_time = times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold(f64::MAX, f64::min);
        let mut max_time = times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold(f64::MIN, f64::max);

        // Avoid divide by zero if all tasks took same time
        if (max_time - min_time).abs() < f64::EPSILON || times.is_empty() {
            max_time = min_time + 1.0;
        }

        for index in graph.graph.node_indices() {
            let node = &graph[index];
            if node.is_root() {
                continue;
            }
            let name = node.name().replace('"', "\\\"");

            let (label, color) = match times.get(&index) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", exec.duration), heat(t))
                }
                None => ("Clean".to_string(), "#ADD8E6".to_string()),
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color);
        }

        for edge in graph.graph.edge_indices() {
            if let Some((source, target)) = graph.graph.edge_endpoints(edge)
                && !graph[target].is_root()
            {
                let _ = writeln!(f, "    {} --> {}", source.index(), target.index());
            }
        }

        f
    }
}

/// Green (0.0) through yellow (0.5) to red (1.0).
fn heat(t: f64) -> String {
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };
    format!("#{r:02X}{g:02X}00")
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.execution_times.is_empty() {
            return write!(f, "Everything up to date ({:.2?})", self.elapsed);
        }

        write!(
            f,
            "Ran {} of {} dirty targets, {} commands, peak {} workers ({:.2?})",
            self.execution_times.len(),
            self.dirty,
            self.commands_run,
            self.peak_workers,
            self.elapsed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heat_endpoints() {
        assert_eq!(heat(0.0), "#00FF00");
        assert_eq!(heat(0.5), "#FFFF00");
        assert_eq!(heat(1.0), "#FF0000");
    }

    #[test]
    fn test_empty_summary() {
        let diagnostics = Diagnostics::default();
        assert!(diagnostics.to_string().starts_with("Everything up to date"));
        assert!(diagnostics.executed().is_empty());
        assert_eq!(diagnostics.render_mermaid(), "graph LR\n");
    }
}
