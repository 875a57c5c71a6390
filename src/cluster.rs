//! Cluster layout: which ranks exist, which host each runs on and which work
//! type it serves, plus task placement constraints.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::Rank;
use crate::error::ConfigError;

/// Dispatch class of a task. A task only ever runs on a rank serving its
/// work type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct WorkType(pub(crate) u32);

impl WorkType {
    /// Cheap control-flow continuations.
    pub const CONTROL: WorkType = WorkType(0);
    /// Substantive leaf computation.
    pub const WORK: WorkType = WorkType(1);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Strictness {
    /// Must run at the target.
    Hard,
    /// Prefer the target, run elsewhere if it is busy.
    Soft,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Accuracy {
    /// The target rank itself.
    Rank,
    /// Any rank on the target rank's host.
    Node,
}

/// Placement constraint of a task.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Location {
    pub rank: Rank,
    pub strictness: Strictness,
    pub accuracy: Accuracy,
}

impl Location {
    pub fn hard(rank: Rank) -> Self {
        Self {
            rank,
            strictness: Strictness::Hard,
            accuracy: Accuracy::Rank,
        }
    }

    pub fn soft(rank: Rank) -> Self {
        Self {
            rank,
            strictness: Strictness::Soft,
            accuracy: Accuracy::Rank,
        }
    }

    /// Widen the target from the rank to its whole host.
    pub fn node(mut self) -> Self {
        self.accuracy = Accuracy::Node;
        self
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let strictness = match self.strictness {
            Strictness::Hard => "hard",
            Strictness::Soft => "soft",
        };
        match self.accuracy {
            Accuracy::Rank => write!(f, "{strictness} {}", self.rank),
            Accuracy::Node => write!(f, "{strictness} host of {}", self.rank),
        }
    }
}

#[derive(Debug, Clone)]
struct RankInfo {
    host: usize,
    work_type: WorkType,
}

/// Location directory of a run.
#[derive(Debug, Clone)]
pub struct Layout {
    hosts: Vec<Arc<str>>,
    ranks: Vec<RankInfo>,
    work_types: Vec<Arc<str>>,
}

impl Layout {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut work_types: Vec<Arc<str>> = vec!["control".into(), "work".into()];
        for name in &config.work_types {
            if !work_types.iter().any(|known| **known == **name) {
                work_types.push(name.as_str().into());
            }
        }

        let mut hosts = Vec::new();
        let mut ranks = Vec::new();
        for (host, entry) in config.hosts.iter().enumerate() {
            hosts.push(Arc::from(entry.name.as_str()));
            for type_name in &entry.ranks {
                let index = work_types
                    .iter()
                    .position(|known| **known == **type_name)
                    .ok_or_else(|| ConfigError::UnknownWorkType(type_name.clone()))?;
                ranks.push(RankInfo {
                    host,
                    work_type: WorkType(index as u32),
                });
            }
        }

        if ranks.is_empty() {
            return Err(ConfigError::NoRanks);
        }

        Ok(Self {
            hosts,
            ranks,
            work_types,
        })
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn ranks(&self) -> impl Iterator<Item = Rank> + '_ {
        (0..self.ranks.len()).map(Rank)
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn work_type_count(&self) -> usize {
        self.work_types.len()
    }

    pub fn contains(&self, rank: Rank) -> bool {
        rank.0 < self.ranks.len()
    }

    /// Index of the host `rank` runs on.
    pub(crate) fn host_index(&self, rank: Rank) -> Option<usize> {
        self.ranks.get(rank.0).map(|info| info.host)
    }

    pub fn host_of(&self, rank: Rank) -> Option<&str> {
        self.host_index(rank).map(|host| &*self.hosts[host])
    }

    pub fn work_type_of(&self, rank: Rank) -> Option<WorkType> {
        self.ranks.get(rank.0).map(|info| info.work_type)
    }

    pub fn work_type(&self, name: &str) -> Option<WorkType> {
        self.work_types
            .iter()
            .position(|known| &**known == name)
            .map(|index| WorkType(index as u32))
    }

    pub fn work_type_name(&self, work_type: WorkType) -> &str {
        self.work_types
            .get(work_type.index())
            .map(|name| &**name)
            .unwrap_or("unknown")
    }

    /// All ranks on `host`, in rank order.
    pub fn ranks_on(&self, host: &str) -> Vec<Rank> {
        self.ranks()
            .filter(|rank| self.host_of(*rank) == Some(host))
            .collect()
    }

    /// First rank on `host`, the usual way of turning a hostname into a
    /// placement target.
    pub fn rank_for_host(&self, host: &str) -> Option<Rank> {
        self.ranks().find(|rank| self.host_of(*rank) == Some(host))
    }

    /// Ranks serving `work_type`.
    pub fn workers_for(&self, work_type: WorkType) -> Vec<Rank> {
        self.ranks()
            .filter(|rank| self.work_type_of(*rank) == Some(work_type))
            .collect()
    }

    /// Whether any rank can ever satisfy `location` for a task of `work_type`.
    pub fn can_place(&self, location: &Location, work_type: WorkType) -> bool {
        match location.accuracy {
            Accuracy::Rank => self.work_type_of(location.rank) == Some(work_type),
            Accuracy::Node => match self.host_index(location.rank) {
                Some(host) => self
                    .ranks
                    .iter()
                    .any(|info| info.host == host && info.work_type == work_type),
                None => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_hosts() -> Layout {
        let config = Config::from_json_str(
            r#"{
                "hosts": [
                    { "name": "a", "ranks": ["control", "work", "work"] },
                    { "name": "b", "ranks": ["work", "gpu"] }
                ],
                "work_types": ["gpu"]
            }"#,
        )
        .unwrap();
        Layout::from_config(&config).unwrap()
    }

    #[test]
    fn test_directory_lookups() {
        let layout = two_hosts();
        assert_eq!(layout.size(), 5);
        assert_eq!(layout.host_of(Rank(3)), Some("b"));
        assert_eq!(layout.ranks_on("a"), vec![Rank(0), Rank(1), Rank(2)]);
        assert_eq!(layout.rank_for_host("b"), Some(Rank(3)));
        assert_eq!(layout.rank_for_host("c"), None);
        assert_eq!(layout.work_type("gpu"), Some(WorkType(2)));
        assert_eq!(layout.workers_for(WorkType::WORK), vec![Rank(1), Rank(2), Rank(3)]);
    }

    #[test]
    fn test_can_place() {
        let layout = two_hosts();
        let gpu = layout.work_type("gpu").unwrap();
        assert!(layout.can_place(&Location::hard(Rank(4)), gpu));
        assert!(!layout.can_place(&Location::hard(Rank(1)), gpu));
        assert!(layout.can_place(&Location::hard(Rank(3)).node(), gpu));
        assert!(!layout.can_place(&Location::hard(Rank(9)), WorkType::WORK));
    }

    #[test]
    fn test_unknown_work_type() {
        let config = Config::from_json_str(r#"{ "hosts": [{ "name": "a", "ranks": ["cpu"] }] }"#).unwrap();
        assert!(matches!(
            Layout::from_config(&config),
            Err(ConfigError::UnknownWorkType(name)) if name == "cpu"
        ));
    }
}
