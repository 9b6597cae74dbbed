use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BiorelError;

/// Entity type assigned to mentions not covered by any entity-type annotation.
pub const UNTYPED_ENTITY: &str = "None";

/// A jointly trained task. Each task owns one ensemble of binary classifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// One classifier per entity type, applied to every entity mention.
    EntityType,
    /// One classifier per relation label, applied to every entity pair.
    Relation,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::EntityType => "entity_type",
            Task::Relation => "relation",
        }
    }

    /// Builds the sub-task identifier for one label of this task,
    /// e.g. `relation_interaction` or `entity_type_Drug`.
    pub fn sub_task(&self, label: &str) -> String {
        format!("{}_{}", self.as_str(), label)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Task {
    type Err = BiorelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entity_type" => Ok(Task::EntityType),
            "relation" => Ok(Task::Relation),
            other => Err(BiorelError::Config(format!("unknown task {other:?}"))),
        }
    }
}
