use crate::error::{Error, Result};
use crate::signal::TimeSeries;
use crate::structure::ProtocolStructure;
use serde::{Deserialize, Serialize};

/// Recursive, ordered name → data tree
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseNode<T> {
    Leaf(T),
    Branch(Vec<(String, PhaseNode<T>)>),
}

impl<T> PhaseNode<T> {
    pub fn get(&self, name: &str) -> Option<&PhaseNode<T>> {
        match self {
            PhaseNode::Leaf(_) => None,
            PhaseNode::Branch(children) => children.iter().find(|(n, _)| n == name).map(|(_, c)| c),
        }
    }

    pub fn leaf(&self) -> Option<&T> {
        match self {
            PhaseNode::Leaf(value) => Some(value),
            PhaseNode::Branch(_) => None,
        }
    }

    /// Depth of the leaves below this node, `None` if leaves sit at different depths
    pub fn uniform_depth(&self) -> Option<usize> {
        match self {
            PhaseNode::Leaf(_) => Some(0),
            PhaseNode::Branch(children) => {
                let mut depth = None;
                for (_, child) in children {
                    let d = child.uniform_depth()? + 1;
                    match depth {
                        None => depth = Some(d),
                        Some(prev) if prev != d => return None,
                        _ => {}
                    }
                }
                depth
            }
        }
    }

    /// Every leaf with the names leading to it, in tree order
    pub fn paths(&self) -> Vec<(Vec<&str>, &T)> {
        let mut out = Vec::new();
        self.collect_paths(&mut Vec::new(), &mut out);
        out
    }

    fn collect_paths<'a>(&'a self, prefix: &mut Vec<&'a str>, out: &mut Vec<(Vec<&'a str>, &'a T)>) {
        match self {
            PhaseNode::Leaf(value) => out.push((prefix.clone(), value)),
            PhaseNode::Branch(children) => {
                for (name, child) in children {
                    prefix.push(name.as_str());
                    child.collect_paths(prefix, out);
                    prefix.pop();
                }
            }
        }
    }

    /// Rebuilds a tree from `(path, leaf)` pairs, keeping first-appearance order
    pub fn from_paths(entries: Vec<(Vec<String>, T)>) -> PhaseNode<T> {
        let mut groups: Vec<(String, Vec<(Vec<String>, T)>)> = Vec::new();
        for (mut path, value) in entries {
            if path.is_empty() {
                // a leaf ends the branch; siblings at the same level are dropped
                return PhaseNode::Leaf(value);
            }
            let head = path.remove(0);
            match groups.iter_mut().find(|(name, _)| *name == head) {
                Some((_, members)) => members.push((path, value)),
                None => groups.push((head, vec![(path, value)])),
            }
        }
        PhaseNode::Branch(
            groups
                .into_iter()
                .map(|(name, members)| (name, PhaseNode::from_paths(members)))
                .collect(),
        )
    }
}

/// Which protocol levels the keys of a [`SubjectDataDict`] correspond to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataLayout {
    Phase,
    PhaseSubphase,
    StudyPartPhase,
    StudyPartPhaseSubphase,
}

impl DataLayout {
    pub fn depth(&self) -> usize {
        match self {
            DataLayout::Phase => 1,
            DataLayout::PhaseSubphase | DataLayout::StudyPartPhase => 2,
            DataLayout::StudyPartPhaseSubphase => 3,
        }
    }

    pub fn has_study_part(&self) -> bool {
        matches!(
            self,
            DataLayout::StudyPartPhase | DataLayout::StudyPartPhaseSubphase
        )
    }

    pub fn has_subphase(&self) -> bool {
        matches!(
            self,
            DataLayout::PhaseSubphase | DataLayout::StudyPartPhaseSubphase
        )
    }
}

/// Address of one series of a subject
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub study_part: Option<String>,
    pub phase: String,
    pub subphase: Option<String>,
}

impl UnitKey {
    pub fn phase(phase: &str) -> Self {
        UnitKey {
            study_part: None,
            phase: phase.to_string(),
            subphase: None,
        }
    }

    pub fn with_subphase(&self, subphase: &str) -> Self {
        UnitKey {
            subphase: Some(subphase.to_string()),
            ..self.clone()
        }
    }

    fn from_path(layout: DataLayout, path: &[&str]) -> Self {
        let (study_part, rest) = if layout.has_study_part() {
            (Some(path[0].to_string()), &path[1..])
        } else {
            (None, path)
        };
        UnitKey {
            study_part,
            phase: rest[0].to_string(),
            subphase: rest.get(1).map(|s| s.to_string()),
        }
    }

    pub fn path(&self) -> Vec<String> {
        self.study_part
            .iter()
            .chain(std::iter::once(&self.phase))
            .chain(self.subphase.iter())
            .cloned()
            .collect()
    }
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path().join("/"))
    }
}

/// Per-subject data, one ordered series per protocol unit
pub type SubjectUnits = (String, Vec<(UnitKey, TimeSeries)>);

/// Subject id → phase tree, validated against a protocol structure
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectDataDict {
    layout: DataLayout,
    subjects: Vec<(String, PhaseNode<TimeSeries>)>,
}

impl SubjectDataDict {
    /// Checks that every subject tree has the depth of `layout`, that names are
    /// unique per level, and that they exist in `structure` in protocol order.
    pub fn new(
        layout: DataLayout,
        subjects: Vec<(String, PhaseNode<TimeSeries>)>,
        structure: &ProtocolStructure,
    ) -> Result<Self> {
        for (i, (subject, tree)) in subjects.iter().enumerate() {
            if subjects[..i].iter().any(|(s, _)| s == subject) {
                return Err(Error::structure(format!("subject '{}' given twice", subject)));
            }
            if tree.uniform_depth() != Some(layout.depth()) {
                return Err(Error::structure(format!(
                    "data of subject '{}' does not have the {} levels of {:?}",
                    subject,
                    layout.depth(),
                    layout
                )));
            }
            validate_unique_names(subject, tree)?;
            validate_against_structure(subject, layout, tree, structure)?;
        }
        Ok(SubjectDataDict { layout, subjects })
    }

    /// Convenience constructor for flat subject → phase → series data
    pub fn from_phases(
        subjects: Vec<(String, Vec<(String, TimeSeries)>)>,
        structure: &ProtocolStructure,
    ) -> Result<Self> {
        let subjects = subjects
            .into_iter()
            .map(|(subject, phases)| {
                let tree = PhaseNode::Branch(
                    phases
                        .into_iter()
                        .map(|(phase, series)| (phase, PhaseNode::Leaf(series)))
                        .collect(),
                );
                (subject, tree)
            })
            .collect();
        Self::new(DataLayout::Phase, subjects, structure)
    }

    /// Rebuilds a dictionary from already validated units
    pub(crate) fn from_units(layout: DataLayout, subjects: Vec<SubjectUnits>) -> Self {
        SubjectDataDict {
            layout,
            subjects: subjects
                .into_iter()
                .map(|(subject, units)| {
                    let tree = PhaseNode::from_paths(
                        units.into_iter().map(|(key, ts)| (key.path(), ts)).collect(),
                    );
                    (subject, tree)
                })
                .collect(),
        }
    }

    pub fn layout(&self) -> DataLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn subject_ids(&self) -> Vec<&str> {
        self.subjects.iter().map(|(s, _)| s.as_str()).collect()
    }

    pub fn subject(&self, id: &str) -> Option<&PhaseNode<TimeSeries>> {
        self.subjects.iter().find(|(s, _)| s == id).map(|(_, t)| t)
    }

    /// Series of one subject and phase (phase-level layouts only)
    pub fn series(&self, subject: &str, phase: &str) -> Option<&TimeSeries> {
        if self.layout.has_subphase() {
            return None;
        }
        self.subject(subject)?
            .paths()
            .into_iter()
            .find(|(path, _)| path.last() == Some(&phase))
            .map(|(_, ts)| ts)
    }

    /// Flattens every subject tree into keyed units, in tree order
    pub fn units(&self) -> Vec<SubjectUnits> {
        self.subjects
            .iter()
            .map(|(subject, tree)| {
                let units = tree
                    .paths()
                    .into_iter()
                    .map(|(path, ts)| (UnitKey::from_path(self.layout, &path), ts.clone()))
                    .collect();
                (subject.clone(), units)
            })
            .collect()
    }
}

fn validate_unique_names<T>(subject: &str, node: &PhaseNode<T>) -> Result<()> {
    if let PhaseNode::Branch(children) = node {
        for (i, (name, child)) in children.iter().enumerate() {
            if children[..i].iter().any(|(n, _)| n == name) {
                return Err(Error::structure(format!(
                    "'{}' appears twice in the data of subject '{}'",
                    name, subject
                )));
            }
            validate_unique_names(subject, child)?;
        }
    }
    Ok(())
}

fn validate_against_structure(
    subject: &str,
    layout: DataLayout,
    tree: &PhaseNode<TimeSeries>,
    structure: &ProtocolStructure,
) -> Result<()> {
    let unknown = |what: &str, name: &str| {
        Error::structure(format!(
            "{} '{}' of subject '{}' is not part of the protocol structure",
            what, name, subject
        ))
    };
    let phase_order = structure.phases();
    let mut last_phase: Option<usize> = None;

    for (path, _) in tree.paths() {
        let key = UnitKey::from_path(layout, &path);
        if let Some(part) = &key.study_part {
            let phases = structure
                .phases_in(part)
                .ok_or_else(|| unknown("study part", part))?;
            if !phases.contains(&key.phase.as_str()) {
                return Err(unknown("phase", &key.phase));
            }
        }
        let position = phase_order
            .iter()
            .position(|p| *p == key.phase)
            .ok_or_else(|| unknown("phase", &key.phase))?;
        if let Some(prev) = last_phase {
            if position < prev {
                return Err(Error::structure(format!(
                    "phases of subject '{}' are not in protocol order",
                    subject
                )));
            }
        }
        last_phase = Some(position);

        if let Some(sub) = &key.subphase {
            let subphases = structure.subphases(&key.phase).unwrap_or_default();
            if !subphases.contains(&sub.as_str()) {
                return Err(unknown("subphase", sub));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn series(n: usize) -> TimeSeries {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        TimeSeries::regular(t0, 1.0, vec![70.0; n]).unwrap()
    }

    fn structure() -> ProtocolStructure {
        ProtocolStructure::from_json(&json!({
            "Pre": {"Baseline": null},
            "Stress": {"Prep": {"Talk": 60, "Math": 0}, "Task": null},
            "Post": {"Recovery": null}
        }))
        .unwrap()
    }

    #[test]
    fn test_study_part_layout() {
        let tree = PhaseNode::Branch(vec![
            (
                "Pre".to_string(),
                PhaseNode::Branch(vec![("Baseline".to_string(), PhaseNode::Leaf(series(5)))]),
            ),
            (
                "Stress".to_string(),
                PhaseNode::Branch(vec![
                    ("Prep".to_string(), PhaseNode::Leaf(series(5))),
                    ("Task".to_string(), PhaseNode::Leaf(series(5))),
                ]),
            ),
        ]);
        let dict = SubjectDataDict::new(
            DataLayout::StudyPartPhase,
            vec![("vp01".to_string(), tree)],
            &structure(),
        )
        .unwrap();
        let units = dict.units();
        assert_eq!(units[0].1.len(), 3);
        assert_eq!(units[0].1[1].0.study_part.as_deref(), Some("Stress"));
        assert_eq!(units[0].1[1].0.phase, "Prep");
    }

    #[test]
    fn test_wrong_depth_is_rejected() {
        let tree = PhaseNode::Branch(vec![("Baseline".to_string(), PhaseNode::Leaf(series(5)))]);
        let err = SubjectDataDict::new(
            DataLayout::StudyPartPhase,
            vec![("vp01".to_string(), tree)],
            &structure(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Structure(_)));
    }

    #[test]
    fn test_unknown_and_unordered_phases() {
        let s = structure();
        let unknown = SubjectDataDict::from_phases(
            vec![("vp01".to_string(), vec![("Lunch".to_string(), series(3))])],
            &s,
        );
        assert!(unknown.is_err());

        let unordered = SubjectDataDict::from_phases(
            vec![(
                "vp01".to_string(),
                vec![
                    ("Recovery".to_string(), series(3)),
                    ("Baseline".to_string(), series(3)),
                ],
            )],
            &s,
        );
        assert!(unordered.is_err());
    }

    #[test]
    fn test_subphase_layout_validation() {
        let s = structure();
        let tree = PhaseNode::Branch(vec![(
            "Prep".to_string(),
            PhaseNode::Branch(vec![
                ("Talk".to_string(), PhaseNode::Leaf(series(3))),
                ("Math".to_string(), PhaseNode::Leaf(series(3))),
            ]),
        )]);
        assert!(SubjectDataDict::new(
            DataLayout::PhaseSubphase,
            vec![("vp01".to_string(), tree)],
            &s
        )
        .is_ok());

        let bad = PhaseNode::Branch(vec![(
            "Prep".to_string(),
            PhaseNode::Branch(vec![("Sing".to_string(), PhaseNode::Leaf(series(3)))]),
        )]);
        assert!(SubjectDataDict::new(
            DataLayout::PhaseSubphase,
            vec![("vp01".to_string(), bad)],
            &s
        )
        .is_err());
    }

    #[test]
    fn test_paths_round_trip() {
        let tree = PhaseNode::Branch(vec![
            (
                "A".to_string(),
                PhaseNode::Branch(vec![
                    ("x".to_string(), PhaseNode::Leaf(1)),
                    ("y".to_string(), PhaseNode::Leaf(2)),
                ]),
            ),
            ("B".to_string(), PhaseNode::Branch(vec![("z".to_string(), PhaseNode::Leaf(3))])),
        ]);
        let entries = tree
            .paths()
            .into_iter()
            .map(|(p, v)| (p.into_iter().map(String::from).collect(), *v))
            .collect();
        assert_eq!(PhaseNode::from_paths(entries), tree);
    }
}
