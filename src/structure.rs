//! Nested study-part / phase / subphase schema of a study protocol.
//!
//! A structure has one to three levels. With three levels the top level holds
//! study parts, with two levels it holds phases carrying subphases, and with a
//! single level it is a flat list of phases. Any node may carry a duration in
//! seconds; `None` means the duration is unknown. A last subphase with a
//! duration of `0` is open-ended and takes whatever data remains in its phase.

use crate::error::{Error, Result};
use serde_json::Value;

pub const MAX_DEPTH: usize = 3;

/// Unvalidated input for [`ProtocolStructure::new`]
#[derive(Debug, Clone, PartialEq)]
pub enum StructureDef {
    Duration(Option<f64>),
    Nested(Vec<(String, StructureDef)>),
    /// Names whose durations are irrelevant
    List(Vec<String>),
}

impl StructureDef {
    pub fn nested<S: Into<String>>(entries: Vec<(S, StructureDef)>) -> Self {
        StructureDef::Nested(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn seconds(duration: f64) -> Self {
        StructureDef::Duration(Some(duration))
    }

    pub fn unknown() -> Self {
        StructureDef::Duration(None)
    }

    pub fn list<S: Into<String>>(names: Vec<S>) -> Self {
        StructureDef::List(names.into_iter().map(Into::into).collect())
    }
}

impl TryFrom<&Value> for StructureDef {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(StructureDef::Duration(None)),
            Value::Number(n) => n
                .as_f64()
                .map(|d| StructureDef::Duration(Some(d)))
                .ok_or_else(|| Error::structure(format!("invalid duration {}", n))),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), StructureDef::try_from(v)?)))
                .collect::<Result<Vec<_>>>()
                .map(StructureDef::Nested),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| Error::structure(format!("list entries must be names, got {}", item)))
                })
                .collect::<Result<Vec<_>>>()
                .map(StructureDef::List),
            other => Err(Error::structure(format!("unsupported structure value {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructureNode {
    pub name: String,
    pub duration: Option<f64>,
    pub children: Vec<StructureNode>,
}

impl StructureNode {
    fn depth(&self) -> usize {
        1 + self.children.iter().map(|c| c.depth()).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthKind {
    /// Flat list of phases
    Phases,
    /// Phases, each optionally split into subphases
    PhasesWithSubphases,
    /// Study parts containing phases containing subphases
    StudyParts,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolStructure {
    roots: Vec<StructureNode>,
    depth: usize,
}

impl ProtocolStructure {
    pub fn new(def: StructureDef) -> Result<Self> {
        let roots = match def {
            StructureDef::Duration(_) => {
                return Err(Error::structure("a protocol structure needs named entries"))
            }
            other => build_level(other, 1)?,
        };
        if roots.is_empty() {
            return Err(Error::structure("a protocol structure needs at least one entry"));
        }
        let depth = roots.iter().map(|r| r.depth()).max().unwrap_or(1);
        let structure = ProtocolStructure { roots, depth };

        let phases = structure.phases();
        for (i, phase) in phases.iter().enumerate() {
            if phases[..i].contains(phase) {
                return Err(Error::structure(format!(
                    "phase '{}' appears in more than one study part",
                    phase
                )));
            }
        }
        Ok(structure)
    }

    /// Protocol of one phase without subphases
    pub fn single_phase(name: &str) -> Result<Self> {
        Self::new(StructureDef::list(vec![name]))
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        Self::new(StructureDef::try_from(value)?)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn depth_kind(&self) -> DepthKind {
        match self.depth {
            1 => DepthKind::Phases,
            2 => DepthKind::PhasesWithSubphases,
            _ => DepthKind::StudyParts,
        }
    }

    pub fn roots(&self) -> &[StructureNode] {
        &self.roots
    }

    fn phase_nodes(&self) -> Vec<&StructureNode> {
        match self.depth_kind() {
            DepthKind::StudyParts => self.roots.iter().flat_map(|p| p.children.iter()).collect(),
            _ => self.roots.iter().collect(),
        }
    }

    fn phase_node(&self, phase: &str) -> Option<&StructureNode> {
        self.phase_nodes().into_iter().find(|n| n.name == phase)
    }

    pub fn study_parts(&self) -> Vec<&str> {
        match self.depth_kind() {
            DepthKind::StudyParts => self.roots.iter().map(|r| r.name.as_str()).collect(),
            _ => Vec::new(),
        }
    }

    /// All phases in protocol order
    pub fn phases(&self) -> Vec<&str> {
        self.phase_nodes().into_iter().map(|n| n.name.as_str()).collect()
    }

    /// Phases of one study part, `None` if the part does not exist
    pub fn phases_in(&self, part: &str) -> Option<Vec<&str>> {
        if self.depth_kind() != DepthKind::StudyParts {
            return None;
        }
        self.roots
            .iter()
            .find(|r| r.name == part)
            .map(|r| r.children.iter().map(|c| c.name.as_str()).collect())
    }

    /// Study part a phase belongs to (only for three-level structures)
    pub fn study_part_of(&self, phase: &str) -> Option<&str> {
        self.roots
            .iter()
            .find(|r| r.children.iter().any(|c| c.name == phase))
            .filter(|_| self.depth_kind() == DepthKind::StudyParts)
            .map(|r| r.name.as_str())
    }

    pub fn contains_phase(&self, phase: &str) -> bool {
        self.phase_node(phase).is_some()
    }

    /// Subphases of a phase, `None` if the phase does not exist
    pub fn subphases(&self, phase: &str) -> Option<Vec<&str>> {
        self.phase_node(phase)
            .map(|n| n.children.iter().map(|c| c.name.as_str()).collect())
    }

    /// Subphase durations of a phase; open-ended entries report `0`
    pub fn subphase_durations(&self, phase: &str) -> Option<Vec<(String, f64)>> {
        let node = self.phase_node(phase)?;
        if node.children.is_empty() {
            return None;
        }
        node.children
            .iter()
            .map(|c| c.duration.map(|d| (c.name.clone(), d)))
            .collect()
    }

    /// Sum of subphase durations, or the phase's own duration when it has no
    /// subphases. `None` if any duration is unknown or open-ended.
    pub fn total_duration(&self, phase: &str) -> Option<f64> {
        self.inferred_duration(phase, &[])
    }

    /// Like [`total_duration`](Self::total_duration), but unknown or
    /// open-ended subphases take their length from `observed`.
    pub fn inferred_duration(&self, phase: &str, observed: &[(&str, f64)]) -> Option<f64> {
        let node = self.phase_node(phase)?;
        let lookup = |name: &str| observed.iter().find(|(n, _)| *n == name).map(|(_, d)| *d);

        if node.children.is_empty() {
            return node.duration.or_else(|| lookup(&node.name));
        }
        let last = node.children.len() - 1;
        node.children
            .iter()
            .enumerate()
            .map(|(i, child)| match child.duration {
                Some(d) if !(i == last && d == 0.0) => Some(d),
                _ => lookup(&child.name),
            })
            .sum()
    }
}

fn build_level(def: StructureDef, level: usize) -> Result<Vec<StructureNode>> {
    if level > MAX_DEPTH {
        return Err(Error::structure(format!(
            "protocol structures support at most {} levels",
            MAX_DEPTH
        )));
    }
    let entries: Vec<(String, StructureDef)> = match def {
        StructureDef::Nested(entries) => entries,
        StructureDef::List(names) => names
            .into_iter()
            .map(|n| (n, StructureDef::Duration(None)))
            .collect(),
        StructureDef::Duration(_) => {
            return Err(Error::structure(format!("level {} needs named entries", level)))
        }
    };

    let has_nested = entries.iter().any(|(_, s)| !matches!(s, StructureDef::Duration(_)));
    let has_duration = entries
        .iter()
        .any(|(_, s)| matches!(s, StructureDef::Duration(Some(_))));
    if has_nested && has_duration {
        return Err(Error::structure(format!(
            "level {} mixes durations with nested entries",
            level
        )));
    }

    let mut nodes: Vec<StructureNode> = Vec::with_capacity(entries.len());
    for (name, def) in entries {
        if name.is_empty() {
            return Err(Error::structure("structure entries need a name"));
        }
        if nodes.iter().any(|n| n.name == name) {
            return Err(Error::structure(format!(
                "duplicate name '{}' at level {}",
                name, level
            )));
        }
        let node = match def {
            StructureDef::Duration(duration) => {
                if let Some(d) = duration {
                    if !(d.is_finite() && d >= 0.0) {
                        return Err(Error::structure(format!(
                            "duration of '{}' must be non-negative, got {}",
                            name, d
                        )));
                    }
                }
                StructureNode {
                    name,
                    duration,
                    children: Vec::new(),
                }
            }
            nested => StructureNode {
                name,
                duration: None,
                children: build_level(nested, level + 1)?,
            },
        };
        nodes.push(node);
    }
    Ok(nodes)
}
