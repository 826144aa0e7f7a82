use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Branch label of the root world's initial timeline.
pub const DEFAULT_BRANCH: &str = "default";

/// Branch label appended for worlds that replay their parent.
pub const FOLLOW_BRANCH: &str = "follow";

/// Checks that a name is non-empty and made of `[A-Za-z0-9_]`.
pub fn validate_name(name: &str) -> Result<(), CoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidName(name.to_owned()))
    }
}

/// Identity of a belief world: the agent names leading to it from the root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BeliefPath(Vec<String>);

impl BeliefPath {
    /// Path of the root world.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses `/`, `/alice/` or `/alice/bob/`. Surrounding slashes are
    /// optional.
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let trimmed = text.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let segments = trimmed
            .split('/')
            .map(|segment| {
                validate_name(segment)
                    .map(|()| segment.to_owned())
                    .map_err(|_| CoreError::InvalidBeliefPath(text.to_owned()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(segments))
    }

    /// Whether the path names the root world.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Path of the world owned by `agent` inside this one.
    #[must_use]
    pub fn child(&self, agent: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(agent.to_owned());
        Self(segments)
    }

    /// Path of the enclosing world.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.0.split_last()?;
        Some(Self(rest.to_vec()))
    }

    /// Agent names from the root downwards.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of nesting levels below the root.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for BeliefPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("/")?;
        for segment in &self.0 {
            write!(f, "{segment}/")?;
        }
        Ok(())
    }
}

/// Branch label per tree level, from the root world downwards.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchPath(Vec<String>);

impl Default for BranchPath {
    fn default() -> Self {
        Self(vec![DEFAULT_BRANCH.to_owned()])
    }
}

impl BranchPath {
    /// Creates a branch path after validating every label.
    pub fn new(labels: Vec<String>) -> Result<Self, CoreError> {
        if labels.is_empty() {
            return Err(CoreError::InvalidName(String::new()));
        }
        for label in &labels {
            validate_name(label)?;
        }
        Ok(Self(labels))
    }

    /// Branch path of a root world on its initial timeline.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Branch path of a child world replaying this one.
    #[must_use]
    pub fn child_follow(&self) -> Self {
        let mut labels = self.0.clone();
        labels.push(FOLLOW_BRANCH.to_owned());
        Self(labels)
    }

    /// Label of the deepest level.
    #[must_use]
    pub fn last(&self) -> &str {
        self.0.last().map_or(DEFAULT_BRANCH, String::as_str)
    }

    /// Whether the deepest level replays its parent.
    #[must_use]
    pub fn is_follow(&self) -> bool {
        self.last() == FOLLOW_BRANCH
    }

    /// Labels from the root downwards.
    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.0
    }

    /// Checkpoint directory for a world: `world[b0]/agent1[b1]/...` below
    /// `root`. `lineage` holds the agent names leading to the world and must
    /// be one shorter than the branch path.
    pub fn directory(&self, root: &Path, lineage: &BeliefPath) -> Result<PathBuf, CoreError> {
        if lineage.depth() + 1 != self.0.len() {
            return Err(CoreError::InvalidBeliefPath(format!(
                "{lineage} does not match branch {self}"
            )));
        }
        let mut dir = root.join(format!("world[{}]", self.0[0]));
        for (agent, label) in lineage.segments().iter().zip(&self.0[1..]) {
            dir.push(format!("{agent}[{label}]"));
        }
        Ok(dir)
    }
}

impl fmt::Display for BranchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{validate_name, BeliefPath, BranchPath};

    #[test]
    fn names_accept_word_characters_only() {
        assert!(validate_name("alice_2").is_ok());
        for name in ["", "al ice", "bob!", "ü"] {
            assert!(validate_name(name).is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn belief_paths_round_trip_through_text() {
        for text in ["/", "/alice/", "/alice/bob/"] {
            let path = BeliefPath::parse(text).expect("valid path");
            assert_eq!(path.to_string(), text);
        }
        let path = BeliefPath::parse("alice/bob").expect("slashes optional");
        assert_eq!(path.parent(), Some(BeliefPath::root().child("alice")));
        assert_eq!(BeliefPath::root().parent(), None);
        assert!(BeliefPath::parse("/al ice/").is_err());
    }

    #[test]
    fn branch_directories_pair_agents_with_labels() {
        let branch = BranchPath::root().child_follow().child_follow();
        let lineage = BeliefPath::parse("/alice/bob/").expect("valid path");
        let dir = branch
            .directory(Path::new("ckpt"), &lineage)
            .expect("matching depth");
        assert_eq!(
            dir,
            Path::new("ckpt/world[default]/alice[follow]/bob[follow]")
        );
        assert!(branch.is_follow());
        assert!(branch
            .directory(Path::new("ckpt"), &BeliefPath::root())
            .is_err());
    }

    #[test]
    fn branch_labels_are_validated() {
        assert!(BranchPath::new(vec!["default".to_owned(), "try 2".to_owned()]).is_err());
        assert!(BranchPath::new(Vec::new()).is_err());
        let branch = BranchPath::new(vec!["main".to_owned()]).expect("valid");
        assert_eq!(branch.last(), "main");
        assert!(!branch.is_follow());
    }
}
