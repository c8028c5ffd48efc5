//! Newline-delimited JSON protocol between the dispatcher and the helper.
//!
//! Every message is one JSON object on one line. Unknown or missing fields are
//! rejected rather than ignored.

use super::authority::AuthorizationToken;
use super::rights::Right;
use crate::backend::{ImportOptions, ImportablePool, PoolSelector, ScrubCommand};
use crate::error::{PoolwatchError, PoolwatchResult, RemoteError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroizing;

/// Bumped whenever the envelope or command layout changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Version string reported by `getVersion`; caller and helper must agree.
pub fn helper_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Key material carried by `loadKeyForFilesystem`; hex on the wire, wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    pub fn new(bytes: Zeroizing<Vec<u8>>) -> Self {
        Self(bytes)
    }

    pub fn into_inner(self) -> Zeroizing<Vec<u8>> {
        self.0
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes(<{} bytes redacted>)", self.0.len())
    }
}

impl Serialize for SecretBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(hex::encode(self.0.as_slice()));
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for SecretBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        let bytes = hex::decode(encoded.as_str()).map_err(serde::de::Error::custom)?;
        Ok(Self(Zeroizing::new(bytes)))
    }
}

/// The closed set of helper verbs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "camelCase", deny_unknown_fields)]
pub enum Command {
    GetVersion,
    StopHelper,
    /// Ask the helper for a token; carries no token itself.
    Authorize { right: Right },
    /// An empty `pools` list imports everything importable.
    ImportPools {
        pools: Vec<PoolSelector>,
        options: ImportOptions,
    },
    ImportablePools { search_paths: Vec<String> },
    ExportPools { pools: Vec<String>, force: bool },
    /// An empty `datasets` list mounts every automountable filesystem.
    MountFilesystems { datasets: Vec<String>, recursive: bool },
    /// An empty `datasets` list unmounts every pool.
    UnmountFilesystems {
        datasets: Vec<String>,
        recursive: bool,
        force: bool,
    },
    SnapshotFilesystem {
        dataset: String,
        snapshot: String,
        recursive: bool,
    },
    RollbackFilesystem { snapshot: String, force: bool },
    CloneSnapshot { snapshot: String, target: String },
    CreateFilesystem {
        name: String,
        properties: BTreeMap<String, String>,
    },
    CreateVolume {
        name: String,
        size: u64,
        properties: BTreeMap<String, String>,
    },
    Destroy {
        name: String,
        recursive: bool,
        force: bool,
    },
    /// Without a secret the dataset's own `keylocation` is used.
    LoadKeyForFilesystem {
        dataset: String,
        secret: Option<SecretBytes>,
    },
    UnloadKeyForFilesystem { dataset: String },
    ScrubPool { pool: String, command: ScrubCommand },
}

impl Command {
    /// Right needed to run the command; `None` for verbs that carry no token.
    pub fn right(&self) -> Option<Right> {
        match self {
            Command::GetVersion | Command::StopHelper | Command::Authorize { .. } => None,
            Command::ImportPools { .. } | Command::ImportablePools { .. } => Some(Right::Import),
            Command::ExportPools { .. } => Some(Right::Export),
            Command::MountFilesystems { .. } => Some(Right::Mount),
            Command::UnmountFilesystems { .. } => Some(Right::Unmount),
            Command::SnapshotFilesystem { .. }
            | Command::RollbackFilesystem { .. }
            | Command::CloneSnapshot { .. } => Some(Right::Snapshot),
            Command::CreateFilesystem { .. } | Command::CreateVolume { .. } => Some(Right::Create),
            Command::Destroy { .. } => Some(Right::Destroy),
            Command::LoadKeyForFilesystem { .. } => Some(Right::KeyLoad),
            Command::UnloadKeyForFilesystem { .. } => Some(Right::KeyUnload),
            Command::ScrubPool { .. } => Some(Right::Scrub),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Command::GetVersion => "getVersion",
            Command::StopHelper => "stopHelper",
            Command::Authorize { .. } => "authorize",
            Command::ImportPools { .. } => "importPools",
            Command::ImportablePools { .. } => "importablePools",
            Command::ExportPools { .. } => "exportPools",
            Command::MountFilesystems { .. } => "mountFilesystems",
            Command::UnmountFilesystems { .. } => "unmountFilesystems",
            Command::SnapshotFilesystem { .. } => "snapshotFilesystem",
            Command::RollbackFilesystem { .. } => "rollbackFilesystem",
            Command::CloneSnapshot { .. } => "cloneSnapshot",
            Command::CreateFilesystem { .. } => "createFilesystem",
            Command::CreateVolume { .. } => "createVolume",
            Command::Destroy { .. } => "destroy",
            Command::LoadKeyForFilesystem { .. } => "loadKeyForFilesystem",
            Command::UnloadKeyForFilesystem { .. } => "unloadKeyForFilesystem",
            Command::ScrubPool { .. } => "scrubPool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionInfo {
    pub version: String,
    pub protocol: u32,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            version: helper_version().to_string(),
            protocol: PROTOCOL_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case", deny_unknown_fields)]
pub enum Response {
    Unit,
    Version(VersionInfo),
    Token(AuthorizationToken),
    ImportablePools(Vec<ImportablePool>),
    /// Names of the pools that were imported.
    Imported(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestEnvelope {
    pub protocol: u32,
    pub id: u64,
    #[serde(default)]
    pub token: Option<AuthorizationToken>,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(Response),
    Err(RemoteError),
}

impl From<PoolwatchResult<Response>> for Outcome {
    fn from(result: PoolwatchResult<Response>) -> Self {
        match result {
            Ok(response) => Outcome::Ok(response),
            Err(err) => Outcome::Err(RemoteError::from(&err)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplyEnvelope {
    pub id: u64,
    pub outcome: Outcome,
}

/// Serialise one message as a single line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> PoolwatchResult<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> PoolwatchResult<T> {
    serde_json::from_str(line.trim_end())
        .map_err(|err| PoolwatchError::Protocol(format!("malformed message: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_verb_tags() {
        let cmd = Command::MountFilesystems {
            datasets: vec!["tank/home".into()],
            recursive: true,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["verb"], "mountFilesystems");
        assert_eq!(json["verb"], cmd.verb());
        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn unknown_fields_and_verbs_fail_closed() {
        let extra = r#"{"verb":"destroy","name":"tank/a","recursive":false,"force":false,"bogus":1}"#;
        assert!(decode_line::<Command>(extra).is_err());
        let missing = r#"{"verb":"destroy","name":"tank/a"}"#;
        assert!(decode_line::<Command>(missing).is_err());
        let unknown = r#"{"verb":"formatDisk"}"#;
        assert!(matches!(
            decode_line::<Command>(unknown).unwrap_err(),
            PoolwatchError::Protocol(_)
        ));
        let envelope = r#"{"protocol":1,"id":1,"command":{"verb":"getVersion"},"extra":true}"#;
        assert!(decode_line::<RequestEnvelope>(envelope).is_err());
    }

    #[test]
    fn every_mutating_verb_maps_to_a_right() {
        let cmd = Command::CloneSnapshot {
            snapshot: "tank/a@s".into(),
            target: "tank/b".into(),
        };
        assert_eq!(cmd.right(), Some(Right::Snapshot));
        assert_eq!(Command::GetVersion.right(), None);
        assert_eq!(Command::StopHelper.right(), None);
        assert_eq!(
            Command::ScrubPool {
                pool: "tank".into(),
                command: ScrubCommand::Pause
            }
            .right(),
            Some(Right::Scrub)
        );
    }

    #[test]
    fn secrets_travel_as_hex_and_stay_out_of_debug() {
        let cmd = Command::LoadKeyForFilesystem {
            dataset: "tank/secure".into(),
            secret: Some(SecretBytes::new(Zeroizing::new(b"pass".to_vec()))),
        };
        let line = encode_line(&cmd).unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("70617373"));
        assert!(!format!("{cmd:?}").contains("pass\""));
        let back: Command = decode_line(&line).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn reply_outcomes_carry_typed_errors() {
        let reply = ReplyEnvelope {
            id: 9,
            outcome: Outcome::from(Err(PoolwatchError::AuthorizationDenied("no".into()))),
        };
        let line = encode_line(&reply).unwrap();
        let back: ReplyEnvelope = decode_line(&line).unwrap();
        match back.outcome {
            Outcome::Err(remote) => assert!(matches!(
                PoolwatchError::from(remote),
                PoolwatchError::AuthorizationDenied(_)
            )),
            other => panic!("unexpected outcome {other:?}"),
        }
        let ok = ReplyEnvelope {
            id: 1,
            outcome: Outcome::Ok(Response::Version(VersionInfo::current())),
        };
        let back: ReplyEnvelope = decode_line(&encode_line(&ok).unwrap()).unwrap();
        assert_eq!(back, ok);
    }
}
