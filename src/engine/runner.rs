mod diagnostics;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use tracing::Level;

use crate::cluster::Strictness;
use crate::core::{DatumId, Rank, TaskId};
use crate::engine::checkpoint::fingerprint;
use crate::engine::task::{Input, TaskContext, resolve_args};
use crate::engine::tracker::{TaskEntry, TaskState};
use crate::engine::Engine;
use crate::error::EngineError;

pub use diagnostics::{Blocker, Diagnostics, PendingReport, PendingTask, TaskExecution};

/// Completion report a worker sends back to the coordinator.
struct Done {
    task: TaskId,
    rank: Rank,
    ranks: Vec<Rank>,
    start: Instant,
    duration: Duration,
    result: Result<Outcome, EngineError>,
}

enum Outcome {
    Executed,
    Cached,
}

/// Drives the engine until no task can make progress.
///
/// The calling thread becomes the coordinator. It owns the busy flag of
/// every rank and is the only one pulling from the work queue:
/// 1. A pool with one thread per rank (plus one for the coordinator) is built.
/// 2. Every idle rank pulls its next task, which is spawned on the pool.
/// 3. The coordinator waits for a completion, marks the rank idle again and
///    goes back to 2. Tasks made ready by a completion are already queued by
///    the time it is reported, since listeners run on the thread doing the
///    write.
/// 4. When nothing is running and nothing can be pulled, the run is over:
///    successfully if every task completed, stalled otherwise.
///
/// The first failure stops all dispatching. Tasks still running are drained
/// and their failures reported alongside the first one.
pub(crate) fn run(engine: &Engine) -> Result<Diagnostics, EngineError> {
    let layout = engine.layout();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(layout.size() + 1)
        .thread_name(|i| format!("sluice-{i}"))
        .build()?;

    let run_span = tracing::span!(Level::INFO, "run", ranks = layout.size());
    let _enter = run_span.enter();
    tracing::info!(queued = engine.queue.len(), "run started");

    let started = Instant::now();
    let mut diagnostics = Diagnostics::default();
    let mut first: Option<EngineError> = None;
    let mut during_drain = Vec::new();
    let mut edges = Vec::new();

    let mut record = |err: EngineError, first: &mut Option<EngineError>| {
        tracing::error!("{err}");
        match first {
            None => *first = Some(err),
            Some(_) => during_drain.push(err),
        }
    };

    pool.scope(|s| {
        let (sender, receiver) = crossbeam_channel::unbounded::<Done>();
        let mut busy = vec![false; layout.size()];
        let mut in_flight = 0usize;

        loop {
            for err in engine.take_failures() {
                record(err, &mut first);
            }

            if first.is_none() {
                let now = Instant::now();
                for rank in layout.ranks() {
                    if busy[rank.0] {
                        continue;
                    }
                    let Some(task) = engine.queue.pull(rank, &busy, now) else {
                        continue;
                    };
                    let Some(entry) = engine.tracker.get(task) else {
                        continue;
                    };

                    // The queue only hands out a parallel task when enough
                    // ranks of its type are idle, this one included.
                    let helpers = engine
                        .queue
                        .idle_ranks(entry.spec.work_type, &busy)
                        .filter(|other| *other != rank)
                        .take(entry.spec.parallelism.saturating_sub(1));
                    let ranks: Vec<Rank> = std::iter::once(rank).chain(helpers).collect();
                    for held in &ranks {
                        busy[held.0] = true;
                    }
                    in_flight += 1;
                    entry.set_state(TaskState::Dispatched);

                    let sender = sender.clone();
                    s.spawn(move |_| {
                        let start = Instant::now();
                        let result = execute(engine, &entry, rank, &ranks);
                        let done = Done {
                            task: entry.id,
                            rank,
                            ranks,
                            start,
                            duration: start.elapsed(),
                            result,
                        };
                        // The coordinator outlives every worker.
                        let _ = sender.send(done);
                    });
                }
            }

            if in_flight == 0 {
                break;
            }

            let received = match engine.queue.next_soft_deadline(Instant::now()) {
                Some(deadline) if first.is_none() => receiver.recv_deadline(deadline),
                _ => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            let done = match received {
                Ok(done) => done,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            for rank in &done.ranks {
                busy[rank.0] = false;
            }
            in_flight -= 1;

            let Some(entry) = engine.tracker.get(done.task) else {
                continue;
            };
            match done.result {
                Ok(outcome) => {
                    entry.set_state(TaskState::Completed);
                    diagnostics.executions.insert(
                        done.task,
                        TaskExecution {
                            name: entry.spec.name.clone(),
                            rank: done.rank,
                            ranks: done.ranks,
                            start: done.start,
                            duration: done.duration,
                            cached: matches!(outcome, Outcome::Cached),
                        },
                    );
                    let inputs: Vec<DatumId> = entry.spec.inputs.iter().map(Input::root).collect();
                    edges.push((done.task, inputs, entry.spec.outputs.clone()));
                    engine.tracker.retire(done.task);
                }
                Err(err) => {
                    entry.set_state(TaskState::Failed);
                    record(err, &mut first);
                }
            }
        }
    });

    for err in engine.take_failures() {
        record(err, &mut first);
    }

    if let Some(checkpoints) = &engine.checkpoints
        && let Err(err) = checkpoints.flush()
    {
        record(err.into(), &mut first);
    }

    if let Some(first) = first {
        return Err(EngineError::Failed {
            first: Box::new(first),
            during_drain,
        });
    }

    let report = pending_report(engine);
    if !report.is_empty() {
        tracing::warn!(pending = report.len(), "run stalled");
        return Err(EngineError::Stalled(report));
    }

    diagnostics.elapsed = started.elapsed();
    diagnostics.states = engine.tracker.counts();
    diagnostics.build_graph(&edges);

    tracing::info!(
        completed = diagnostics.completed(),
        live = engine.tracker.len(),
        elapsed = ?diagnostics.elapsed,
        "run complete"
    );
    Ok(diagnostics)
}

/// Execute one task on `rank`, consulting the checkpoint store first when
/// the task asks for it.
fn execute(engine: &Engine, entry: &Arc<TaskEntry>, rank: Rank, ranks: &[Rank]) -> Result<Outcome, EngineError> {
    let spec = &entry.spec;
    let span = tracing::span!(Level::INFO, "task", name = %spec.name, %rank, ranks = ranks.len());
    let _enter = span.enter();

    let body = engine
        .bodies
        .get(&spec.body)
        .cloned()
        .ok_or_else(|| EngineError::UnknownBody(spec.body.to_string()))?;
    let args = resolve_args(engine, spec)?;

    let checkpoint = match &engine.checkpoints {
        Some(store) if spec.checkpoint => Some((store, fingerprint(&spec.body, &args)?)),
        _ => None,
    };
    // Held until the outputs are stored, so an identical task waits and hits.
    let _claim = checkpoint.as_ref().map(|(_, key)| engine.in_flight.claim(*key));

    if let Some((store, key)) = &checkpoint
        && let Some(outputs) = store.lookup(key)
    {
        if outputs.len() == spec.outputs.len() {
            tracing::debug!(key = %key.to_hex(), "checkpoint hit");
            for (id, value) in spec.outputs.iter().zip(outputs) {
                engine.write(*id, value)?;
            }
            return Ok(Outcome::Cached);
        }
        tracing::warn!(
            expected = spec.outputs.len(),
            found = outputs.len(),
            "checkpoint entry does not match the declared outputs, running the body"
        );
    }

    let mut context = TaskContext {
        engine,
        task: entry.id,
        spec,
        rank,
        ranks: ranks.to_vec(),
        args,
    };

    // A panicking body only owns its context; shared state is behind locks
    // that are never held across a call into the body.
    let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(&mut context))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };
            Err(anyhow::anyhow!(msg))
        }
    };

    if let Err(source) = result {
        return Err(if spec.assertion {
            EngineError::Assertion {
                task: spec.name.to_string(),
                message: format!("{source:#}"),
            }
        } else {
            EngineError::TaskFailed {
                task: spec.name.to_string(),
                source,
            }
        });
    }

    if let Some((store, key)) = checkpoint {
        let mut outputs = Vec::with_capacity(spec.outputs.len());
        for id in &spec.outputs {
            match engine.store().read(*id) {
                Ok(value) => outputs.push(value),
                Err(err) => {
                    tracing::debug!(output = %id, "not checkpointing: {err}");
                    return Ok(Outcome::Executed);
                }
            }
        }
        store.store(key, outputs)?;
    }

    Ok(Outcome::Executed)
}

/// Explain every task that has not been dispatched.
pub(crate) fn pending_report(engine: &Engine) -> PendingReport {
    let layout = engine.layout();
    let tasks = engine
        .tracker
        .unfinished()
        .into_iter()
        .map(|entry| {
            let spec = &entry.spec;
            let state = entry.state();
            let blockers = if state == TaskState::Ready {
                match &spec.location {
                    Some(location)
                        if location.strictness == Strictness::Hard
                            && !layout.can_place(location, spec.work_type) =>
                    {
                        vec![Blocker::LocationUnavailable(*location)]
                    }
                    _ if layout.workers_for(spec.work_type).is_empty() => {
                        vec![Blocker::NoWorker(layout.work_type_name(spec.work_type).to_string())]
                    }
                    _ => vec![Blocker::Queued],
                }
            } else {
                spec.inputs
                    .iter()
                    .filter_map(|input| input_blocker(engine, input))
                    .collect()
            };

            PendingTask {
                task: entry.id,
                name: spec.name.clone(),
                state,
                blockers,
            }
        })
        .collect();

    PendingReport { tasks }
}

fn input_blocker(engine: &Engine, input: &Input) -> Option<Blocker> {
    let store = engine.store();
    let closed = |id| store.is_closed(id).unwrap_or(false);
    match input {
        Input::Closed(id) => (!closed(*id)).then_some(Blocker::Datum(*id)),
        Input::Path(root, path) => match store.resolve(*root, path) {
            Ok(Some(id)) if closed(id) => None,
            _ => Some(Blocker::Path(*root, path.clone())),
        },
        Input::Deep(root) => first_unclosed(engine, *root).map(|unclosed| Blocker::Deep { root: *root, unclosed }),
    }
}

fn first_unclosed(engine: &Engine, root: DatumId) -> Option<DatumId> {
    let store = engine.store();
    let mut seen = HashSet::from([root]);
    let mut work = vec![root];
    while let Some(id) = work.pop() {
        if !store.is_closed(id).unwrap_or(false) {
            return Some(id);
        }
        for next in store.references(id).unwrap_or_default() {
            if seen.insert(next) {
                work.push(next);
            }
        }
    }
    None
}
