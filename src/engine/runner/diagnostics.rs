use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::cluster::Location;
use crate::core::{DatumId, Rank, TaskId};
use crate::engine::TaskState;
use crate::value::Key;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub name: Arc<str>,
    pub rank: Rank,
    /// All ranks held, `rank` first.
    pub ranks: Vec<Rank>,
    pub start: Instant,
    pub duration: Duration,
    /// Satisfied from the checkpoint store without running the body.
    pub cached: bool,
}

/// Run diagnostics and performance metrics.
///
/// Returned by [`Engine::run`](crate::Engine::run). Holds one
/// [`TaskExecution`] per completed task, the final task state counts, and the
/// dataflow graph between executed tasks: an edge `a -> b` means `b` waited on
/// a datum `a` promised to write.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub executions: HashMap<TaskId, TaskExecution>,
    pub states: BTreeMap<TaskState, usize>,
    pub elapsed: Duration,
    pub(crate) graph: Graph<TaskId, DatumId>,
}

impl Diagnostics {
    pub fn completed(&self) -> usize {
        self.states.get(&TaskState::Completed).copied().unwrap_or(0)
    }

    pub fn cached(&self) -> usize {
        self.executions.values().filter(|exec| exec.cached).count()
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by execution
    /// duration from green (fast) through yellow to red (slow). Checkpoint
    /// hits are light blue.
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = self.write_mermaid(&mut f);
        f
    }

    fn write_mermaid(&self, f: &mut String) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let ran = self.executions.values().filter(|exec| !exec.cached);
        let (min, max) = ran.fold((f64::MAX, f64::MIN), |(min, max), exec| {
            let secs = exec.duration.as_secs_f64();
            (min.min(secs), max.max(secs))
        });
        let (min, max) = if min > max { (0.0, 1.0) } else { (min, max) };
        let span = if (max - min).abs() < f64::EPSILON { 1.0 } else { max - min };

        for index in self.graph.node_indices() {
            let task = self.graph[index];
            let Some(exec) = self.executions.get(&task) else {
                continue;
            };
            let name = exec.name.replace('"', "\\\"");

            let (label, color) = if exec.cached {
                ("cached".to_string(), "#ADD8E6".to_string())
            } else {
                let t = (exec.duration.as_secs_f64() - min) / span;
                let (r, g) = if t < 0.5 {
                    ((255.0 * t * 2.0) as u8, 255)
                } else {
                    (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
                };
                let on = match exec.ranks.len() {
                    0 | 1 => exec.rank.to_string(),
                    n => format!("{} (+{})", exec.rank, n - 1),
                };
                (format!("{:.2?} on {on}", exec.duration), format!("#{r:02X}{g:02X}00"))
            };

            writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label)?;
            writeln!(f, "    style {} fill:{}", index.index(), color)?;
        }

        for edge in self.graph.edge_indices() {
            if let Some((source, target)) = self.graph.edge_endpoints(edge) {
                writeln!(
                    f,
                    "    {} -- \"{}\" --> {}",
                    source.index(),
                    self.graph[edge],
                    target.index()
                )?;
            }
        }

        Ok(())
    }

    pub(crate) fn build_graph(&mut self, tasks: &[(TaskId, Vec<DatumId>, Vec<DatumId>)]) {
        let mut nodes: HashMap<TaskId, NodeIndex> = HashMap::new();
        let mut producers: HashMap<DatumId, TaskId> = HashMap::new();

        for (task, _, outputs) in tasks {
            if self.executions.contains_key(task) {
                nodes.insert(*task, self.graph.add_node(*task));
                for output in outputs {
                    producers.insert(*output, *task);
                }
            }
        }

        for (task, inputs, _) in tasks {
            let Some(&target) = nodes.get(task) else {
                continue;
            };
            for input in inputs {
                if let Some(&source) = producers.get(input).and_then(|p| nodes.get(p)) {
                    self.graph.add_edge(source, target, *input);
                }
            }
        }
    }
}

/// Why a task has not run.
#[derive(Debug, Clone, PartialEq)]
pub enum Blocker {
    /// Waiting for a datum to close.
    Datum(DatumId),
    /// Waiting for a subscript path to be assigned and closed.
    Path(DatumId, Vec<Key>),
    /// Waiting for the named datum somewhere below a deep-wait root.
    Deep { root: DatumId, unclosed: DatumId },
    /// Queued with a hard location no rank can satisfy.
    LocationUnavailable(Location),
    /// Queued for a work type no rank serves.
    NoWorker(String),
    /// Queued, nothing known to prevent it from running.
    Queued,
}

impl Display for Blocker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Blocker::Datum(id) => write!(f, "waits on {id}"),
            Blocker::Path(root, path) => {
                write!(f, "waits on {root}")?;
                for key in path {
                    write!(f, "[{key}]")?;
                }
                Ok(())
            }
            Blocker::Deep { root, unclosed } => write!(f, "waits deep on {root} ({unclosed} open)"),
            Blocker::LocationUnavailable(location) => write!(f, "location unavailable: {location}"),
            Blocker::NoWorker(work_type) => write!(f, "no rank serves work type '{work_type}'"),
            Blocker::Queued => f.write_str("queued"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingTask {
    pub task: TaskId,
    pub name: Arc<str>,
    pub state: TaskState,
    pub blockers: Vec<Blocker>,
}

/// Every task left over when a run could make no further progress.
#[derive(Debug, Clone, Default)]
pub struct PendingReport {
    pub tasks: Vec<PendingTask>,
}

impl PendingReport {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Pending tasks with a hard location nobody can satisfy.
    pub fn unavailable(&self) -> impl Iterator<Item = &PendingTask> {
        self.tasks.iter().filter(|task| {
            task.blockers
                .iter()
                .any(|b| matches!(b, Blocker::LocationUnavailable(_)))
        })
    }
}

impl Display for PendingReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for task in &self.tasks {
            write!(f, "  {} '{}' [{}]", task.task, task.name, task.state)?;
            for (i, blocker) in task.blockers.iter().enumerate() {
                f.write_str(if i == 0 { ": " } else { ", " })?;
                write!(f, "{blocker}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
