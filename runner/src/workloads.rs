//! Workload definitions shared by the benchmarks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Which YCSB core workload to run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum YcsbWorkload {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl YcsbWorkload {
    pub fn all() -> [YcsbWorkload; 6] {
        use YcsbWorkload::*;
        [A, B, C, D, E, F]
    }
}

impl std::fmt::Display for YcsbWorkload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for YcsbWorkload {
    type Err = failure::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "A" => Ok(YcsbWorkload::A),
            "B" => Ok(YcsbWorkload::B),
            "C" => Ok(YcsbWorkload::C),
            "D" => Ok(YcsbWorkload::D),
            "E" => Ok(YcsbWorkload::E),
            "F" => Ok(YcsbWorkload::F),
            _ => Err(failure::format_err!("Unknown YCSB workload `{}`", s)),
        }
    }
}

/// The request mix of a YCSB workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadParams {
    pub read: f64,
    pub update: f64,
    pub scan: f64,
    pub insert: f64,
    pub read_modify_write: f64,
    /// `uniform`, `zipfian`, or `latest`.
    pub distribution: String,
}

impl WorkloadParams {
    fn new(read: f64, update: f64, scan: f64, insert: f64, rmw: f64, distribution: &str) -> Self {
        WorkloadParams {
            read,
            update,
            scan,
            insert,
            read_modify_write: rmw,
            distribution: distribution.into(),
        }
    }

    /// The `-p key=value` arguments for the YCSB client.
    pub fn to_client_args(&self) -> Vec<String> {
        let props = vec![
            ("workload", "core".to_owned()),
            ("readallfields", "true".to_owned()),
            ("readproportion", self.read.to_string()),
            ("updateproportion", self.update.to_string()),
            ("scanproportion", self.scan.to_string()),
            ("insertproportion", self.insert.to_string()),
            (
                "readmodifywriteproportion",
                self.read_modify_write.to_string(),
            ),
            ("requestdistribution", self.distribution.clone()),
        ];

        props
            .into_iter()
            .flat_map(|(k, v)| vec!["-p".to_owned(), format!("{}={}", k, v)])
            .collect()
    }
}

/// The standard YCSB core workloads, except that workload A draws keys uniformly instead of from a
/// zipfian.
pub fn default_workload_parameter_sets() -> BTreeMap<YcsbWorkload, WorkloadParams> {
    let mut sets = BTreeMap::new();
    sets.insert(
        YcsbWorkload::A,
        WorkloadParams::new(0.5, 0.5, 0.0, 0.0, 0.0, "uniform"),
    );
    sets.insert(
        YcsbWorkload::B,
        WorkloadParams::new(0.95, 0.05, 0.0, 0.0, 0.0, "zipfian"),
    );
    sets.insert(
        YcsbWorkload::C,
        WorkloadParams::new(1.0, 0.0, 0.0, 0.0, 0.0, "zipfian"),
    );
    sets.insert(
        YcsbWorkload::D,
        WorkloadParams::new(0.95, 0.0, 0.0, 0.05, 0.0, "latest"),
    );
    sets.insert(
        YcsbWorkload::E,
        WorkloadParams::new(0.0, 0.0, 0.95, 0.05, 0.0, "zipfian"),
    );
    sets.insert(
        YcsbWorkload::F,
        WorkloadParams::new(0.5, 0.0, 0.0, 0.0, 0.5, "zipfian"),
    );
    sets
}
