//! Ready-task queue with location-aware pulls.
//!
//! Entries live once in a slab. Heaps only hold slab keys, and a key whose
//! entry is gone (taken through another heap) is discarded when it surfaces.
//! That is what lets a soft-targeted task sit in both its target's heap and
//! the shared heap without ever being taken twice.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cluster::{Accuracy, Layout, Location, Strictness, WorkType};
use crate::core::{Rank, TaskId};
use crate::engine::tracker::TaskEntry;

/// Priority handicap of a soft-targeted task in the shared heap.
const SOFT_TARGET_PRIORITY_PENALTY: i64 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Item {
    priority: i64,
    seq: u64,
}

impl Ord for Item {
    fn cmp(&self, other: &Self) -> Ordering {
        // Highest priority first, then first come first served.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Item {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct Queued {
    task: TaskId,
    work_type: WorkType,
    location: Option<Location>,
    parallelism: usize,
    since: Instant,
}

#[derive(Default)]
struct Heaps {
    next_seq: u64,
    slab: HashMap<u64, Queued>,
    untargeted: HashMap<WorkType, BinaryHeap<Item>>,
    ranks: HashMap<(Rank, WorkType), BinaryHeap<Item>>,
    hosts: HashMap<(usize, WorkType), BinaryHeap<Item>>,
}

impl Heaps {
    /// Pop the best live entry of `heap`.
    fn pop_live(slab: &mut HashMap<u64, Queued>, heap: Option<&mut BinaryHeap<Item>>) -> Option<Queued> {
        let heap = heap?;
        while let Some(item) = heap.pop() {
            if let Some(entry) = slab.remove(&item.seq) {
                return Some(entry);
            }
        }
        None
    }
}

pub(crate) struct WorkQueue {
    layout: Layout,
    soft_wait: Duration,
    heaps: Mutex<Heaps>,
}

impl WorkQueue {
    pub(crate) fn new(layout: Layout, soft_wait: Duration) -> Self {
        Self {
            layout,
            soft_wait,
            heaps: Mutex::new(Heaps::default()),
        }
    }

    pub(crate) fn push(&self, entry: &TaskEntry) {
        let spec = &entry.spec;
        let priority = i64::from(spec.priority);

        if let Some(location) = &spec.location
            && location.strictness == Strictness::Hard
            && !self.layout.can_place(location, spec.work_type)
        {
            tracing::warn!(
                task = %entry.id,
                name = %spec.name,
                %location,
                "no rank can satisfy this location, the task will not run"
            );
        }

        let mut heaps = self.heaps.lock();
        let seq = heaps.next_seq;
        heaps.next_seq += 1;
        heaps.slab.insert(
            seq,
            Queued {
                task: entry.id,
                work_type: spec.work_type,
                location: spec.location,
                parallelism: spec.parallelism,
                since: Instant::now(),
            },
        );

        let Some(location) = spec.location else {
            heaps
                .untargeted
                .entry(spec.work_type)
                .or_default()
                .push(Item { priority, seq });
            return;
        };

        let item = Item { priority, seq };
        match (location.accuracy, self.layout.host_index(location.rank)) {
            (Accuracy::Node, Some(host)) => heaps.hosts.entry((host, spec.work_type)).or_default().push(item),
            _ => heaps
                .ranks
                .entry((location.rank, spec.work_type))
                .or_default()
                .push(item),
        }

        if location.strictness == Strictness::Soft {
            heaps.untargeted.entry(spec.work_type).or_default().push(Item {
                priority: priority - SOFT_TARGET_PRIORITY_PENALTY,
                seq,
            });
        }
    }

    /// Next task for an idle `rank`: work targeted at the rank, then at its
    /// host, then untargeted work. `busy` tells which ranks are executing.
    pub(crate) fn pull(&self, rank: Rank, busy: &[bool], now: Instant) -> Option<TaskId> {
        let work_type = self.layout.work_type_of(rank)?;
        let host = self.layout.host_index(rank)?;

        let mut heaps = self.heaps.lock();
        let Heaps {
            slab,
            untargeted,
            ranks,
            hosts,
            ..
        } = &mut *heaps;

        if let Some(entry) = Heaps::pop_live(slab, ranks.get_mut(&(rank, work_type))) {
            return Some(entry.task);
        }
        if let Some(entry) = Heaps::pop_live(slab, hosts.get_mut(&(host, work_type))) {
            return Some(entry.task);
        }

        let heap = untargeted.get_mut(&work_type)?;
        let mut skipped = Vec::new();
        let mut found = None;
        while let Some(item) = heap.pop() {
            let Some(entry) = slab.get(&item.seq) else {
                continue;
            };
            if self.may_take(entry, rank, busy, now) && self.has_room(entry, busy) {
                found = slab.remove(&item.seq).map(|entry| entry.task);
                break;
            }
            skipped.push(item);
        }
        heap.extend(skipped);
        found
    }

    /// Whether `rank` may take `entry` out of the shared heap.
    fn may_take(&self, entry: &Queued, rank: Rank, busy: &[bool], now: Instant) -> bool {
        let Some(location) = &entry.location else {
            return true;
        };

        let targets_us = match location.accuracy {
            Accuracy::Rank => location.rank == rank,
            Accuracy::Node => self.layout.host_index(location.rank) == self.layout.host_index(rank),
        };
        if targets_us {
            return true;
        }
        if !self.layout.can_place(location, entry.work_type) {
            return true;
        }

        let target_busy = match location.accuracy {
            Accuracy::Rank => busy.get(location.rank.0).copied().unwrap_or(true),
            Accuracy::Node => {
                let host = self.layout.host_index(location.rank);
                self.layout
                    .ranks()
                    .filter(|r| {
                        self.layout.host_index(*r) == host
                            && self.layout.work_type_of(*r) == Some(entry.work_type)
                    })
                    .all(|r| busy.get(r.0).copied().unwrap_or(true))
            }
        };
        target_busy && now.saturating_duration_since(entry.since) >= self.soft_wait
    }

    /// Whether enough ranks are idle to start `entry` together.
    fn has_room(&self, entry: &Queued, busy: &[bool]) -> bool {
        entry.parallelism <= 1
            || self.idle_ranks(entry.work_type, busy).count() >= entry.parallelism
    }

    pub(crate) fn idle_ranks<'a>(&'a self, work_type: WorkType, busy: &'a [bool]) -> impl Iterator<Item = Rank> + 'a {
        self.layout
            .ranks()
            .filter(move |r| self.layout.work_type_of(*r) == Some(work_type) && !busy.get(r.0).copied().unwrap_or(true))
    }

    /// Earliest future moment at which a waiting soft-targeted task may be
    /// taken by another rank.
    pub(crate) fn next_soft_deadline(&self, now: Instant) -> Option<Instant> {
        self.heaps
            .lock()
            .slab
            .values()
            .filter(|entry| matches!(entry.location, Some(l) if l.strictness == Strictness::Soft))
            .map(|entry| entry.since + self.soft_wait)
            .filter(|deadline| *deadline > now)
            .min()
    }

    pub(crate) fn len(&self) -> usize {
        self.heaps.lock().slab.len()
    }
}
