//! Named authorization rights guarding each mutating helper command.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Every right name starts with this prefix.
pub const RIGHT_PREFIX: &str = "org.poolwatch.";

/// Policy rule attached to a right in the rights database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    /// Any local user.
    Allow,
    /// Root or a configured admin account.
    Admin,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Right {
    Import,
    Export,
    Mount,
    Unmount,
    Snapshot,
    Create,
    Destroy,
    KeyLoad,
    KeyUnload,
    Scrub,
}

impl Right {
    pub const ALL: [Right; 10] = [
        Right::Import,
        Right::Export,
        Right::Mount,
        Right::Unmount,
        Right::Snapshot,
        Right::Create,
        Right::Destroy,
        Right::KeyLoad,
        Right::KeyUnload,
        Right::Scrub,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Right::Import => "org.poolwatch.import",
            Right::Export => "org.poolwatch.export",
            Right::Mount => "org.poolwatch.mount",
            Right::Unmount => "org.poolwatch.unmount",
            Right::Snapshot => "org.poolwatch.snapshot",
            Right::Create => "org.poolwatch.create",
            Right::Destroy => "org.poolwatch.destroy",
            Right::KeyLoad => "org.poolwatch.key.load",
            Right::KeyUnload => "org.poolwatch.key.unload",
            Right::Scrub => "org.poolwatch.scrub",
        }
    }

    pub fn parse(name: &str) -> Option<Right> {
        Right::ALL.into_iter().find(|right| right.name() == name)
    }

    /// Rule written to the rights database when the right is missing.
    pub fn default_rule(self) -> Rule {
        match self {
            Right::Mount | Right::Unmount => Rule::Allow,
            _ => Rule::Admin,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Right::Import => "Import storage pools",
            Right::Export => "Export storage pools",
            Right::Mount => "Mount filesystems",
            Right::Unmount => "Unmount filesystems",
            Right::Snapshot => "Snapshot, roll back and clone filesystems",
            Right::Create => "Create filesystems and volumes",
            Right::Destroy => "Destroy filesystems, volumes and snapshots",
            Right::KeyLoad => "Load encryption keys",
            Right::KeyUnload => "Unload encryption keys",
            Right::Scrub => "Start, pause and stop scrubs",
        }
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Right {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Right {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Right::parse(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown right `{name}`")))
    }
}
