use crate::telemetry::DeviceKind;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};


/// Lines the default factory layout is built for
pub const DEFAULT_LINES: [&str; 3] = ["line1", "line2", "line3"];

/// Operation an AGV can perform at a site
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Take a product from the device onto the AGV
    Load,
    /// Put the AGV's oldest product into the device
    Unload,
}

/// A device reachable from a path point, with the operations it supports
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub device_id: String,
    pub kind: DeviceKind,
    pub operations: Vec<Operation>,
    /// Buffer capacity; None falls back to the per-kind guard default
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Site {
    pub fn new(device_id: &str, kind: DeviceKind, operations: &[Operation]) -> Self {
        Self {
            device_id: device_id.to_string(),
            kind,
            operations: operations.to_vec(),
            capacity: None,
        }
    }

    pub fn supports(&self, operation: Operation) -> bool {
        self.operations.contains(&operation)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathPoint {
    pub id: String,
    #[serde(default)]
    pub sites: Vec<Site>,
}

/// Path graph of one production line
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineTopology {
    pub line_id: String,

    /// Raw-material pickup point
    #[serde(default = "default_intake_point")]
    pub intake_point: String,

    pub points: Vec<PathPoint>,

    /// Undirected traversable segments
    pub edges: Vec<[String; 2]>,
}

fn default_intake_point() -> String {
    "P0".to_string()
}

impl LineTopology {
    /// Standard line: intake, three stations with conveyors between them,
    /// quality check and warehouse on a chain, plus a charging dock
    /// linking both ends.
    pub fn default_layout(line_id: &str) -> Self {
        use DeviceKind::*;
        use Operation::*;

        let point = |id: &str, sites: Vec<Site>| PathPoint {
            id: id.to_string(),
            sites,
        };

        let points = vec![
            point("P0", vec![Site::new("RawMaterial", RawMaterial, &[Load])]),
            point("P1", vec![Site::new("StationA", Station, &[Unload])]),
            point("P2", vec![Site::new("Conveyor_AB", Conveyor, &[Load])]),
            point("P3", vec![Site::new("StationB", Station, &[Unload])]),
            point("P4", vec![Site::new("Conveyor_BC", Conveyor, &[Load])]),
            point("P5", vec![Site::new("StationC", Station, &[Unload])]),
            point("P6", vec![Site::new("Conveyor_CQ", Conveyor, &[Load])]),
            point("P7", vec![Site::new("QualityCheck", Station, &[Unload])]),
            point("P8", vec![Site::new("QualityCheck", Station, &[Load])]),
            point("P9", vec![Site::new("Warehouse", Warehouse, &[Unload])]),
            point("P10", vec![]),
        ];

        let mut edges: Vec<[String; 2]> = (0..9)
            .map(|i| [format!("P{}", i), format!("P{}", i + 1)])
            .collect();
        edges.push(["P0".to_string(), "P10".to_string()]);
        edges.push(["P9".to_string(), "P10".to_string()]);

        Self {
            line_id: line_id.to_string(),
            intake_point: default_intake_point(),
            points,
            edges,
        }
    }

    pub fn has_point(&self, point: &str) -> bool {
        self.points.iter().any(|p| p.id == point)
    }

    pub fn neighbours<'a>(&'a self, point: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.edges.iter().filter_map(move |[a, b]| {
            if a == point {
                Some(b.as_str())
            } else if b == point {
                Some(a.as_str())
            } else {
                None
            }
        })
    }

    /// Breadth-first reachability over the undirected edge set
    pub fn is_reachable(&self, from: &str, to: &str) -> bool {
        if !self.has_point(from) || !self.has_point(to) {
            return false;
        }
        if from == to {
            return true;
        }

        let mut visited: HashSet<&str> = HashSet::from([from]);
        let mut queue: VecDeque<&str> = VecDeque::from([from]);

        while let Some(current) = queue.pop_front() {
            for next in self.neighbours(current) {
                if next == to {
                    return true;
                }
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        false
    }

    /// Sites attached to a path point (empty for unknown points)
    pub fn sites_at(&self, point: &str) -> &[Site] {
        self.points
            .iter()
            .find(|p| p.id == point)
            .map(|p| p.sites.as_slice())
            .unwrap_or(&[])
    }

    /// Structural checks: intake and edge endpoints must be known points
    pub fn validate(&self) -> Result<(), String> {
        if self.line_id.is_empty() {
            return Err("line_id must not be empty".to_string());
        }
        if !self.has_point(&self.intake_point) {
            return Err(format!(
                "{}: intake point '{}' is not a path point",
                self.line_id, self.intake_point
            ));
        }
        for [a, b] in &self.edges {
            if !self.has_point(a) || !self.has_point(b) {
                return Err(format!(
                    "{}: edge {} - {} references an unknown point",
                    self.line_id, a, b
                ));
            }
        }
        Ok(())
    }
}

/// Topology of every line, keyed by line id
#[derive(Clone, Debug, Default)]
pub struct FactoryTopology {
    lines: HashMap<String, LineTopology>,
}

impl FactoryTopology {
    pub fn new(lines: Vec<LineTopology>) -> Self {
        Self {
            lines: lines
                .into_iter()
                .map(|line| (line.line_id.clone(), line))
                .collect(),
        }
    }

    /// Default layout for line1..line3
    pub fn default_factory() -> Self {
        Self::new(
            DEFAULT_LINES
                .iter()
                .map(|id| LineTopology::default_layout(id))
                .collect(),
        )
    }

    pub fn line(&self, line_id: &str) -> Option<&LineTopology> {
        self.lines.get(line_id)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
