//! Authorization policy store and token issuing/validation.
//!
//! Tokens are `v1:<right>:<uid>:<expiry>:<mac>` where the MAC is
//! HMAC-SHA256 over everything before it, keyed with a secret only the
//! privileged helper can read. A token is bound to one right and one uid.

use super::rights::{Right, Rule};
use crate::config::AuthorizationCfg;
use crate::error::{PoolwatchError, PoolwatchResult};
use hex::FromHex;
use hmac::{Hmac, Mac};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: &str = "v1";
const SECRET_LEN: usize = 32;

/// Opaque proof that the holder was granted one right.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorizationToken(String);

impl AuthorizationToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AuthorizationToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for AuthorizationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthorizationToken(..)")
    }
}

/// Interactive confirmation hook for rules that need more than the caller's uid.
pub trait CredentialPrompt: Send + Sync {
    fn confirm(&self, right: Right, uid: u32) -> PoolwatchResult<bool>;
}

/// Never confirms; used where no interactive channel exists.
pub struct NoPrompt;

impl CredentialPrompt for NoPrompt {
    fn confirm(&self, _right: Right, _uid: u32) -> PoolwatchResult<bool> {
        Ok(false)
    }
}

/// The policy store plus token authority consulted by the privileged helper.
pub trait Authority: Send + Sync {
    /// Register every right missing from the policy store with its default
    /// rule. Returns the rights that were added.
    fn ensure_rights(&self) -> PoolwatchResult<Vec<Right>>;

    fn rule(&self, right: Right) -> PoolwatchResult<Rule>;

    fn is_admin(&self, uid: u32) -> bool;

    /// Issue a token for `right` to `uid`, consulting `prompt` when the rule
    /// is not satisfied by the uid alone.
    fn request(
        &self,
        right: Right,
        uid: u32,
        prompt: &dyn CredentialPrompt,
    ) -> PoolwatchResult<AuthorizationToken>;

    /// Check `token` grants `right` to `peer_uid`. Never trusts anything the
    /// caller claims beyond the token itself.
    fn validate(&self, token: &AuthorizationToken, right: Right, peer_uid: u32)
        -> PoolwatchResult<()>;
}

/// On-disk rights database: right name to rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RightsDatabase {
    #[serde(default)]
    pub rights: BTreeMap<String, Rule>,
}

impl RightsDatabase {
    pub fn load(path: &Path) -> PoolwatchResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, path: &Path) -> PoolwatchResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|err| PoolwatchError::InvalidConfig(format!("encode rights database: {err}")))?;
        fs::write(path, contents)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
        Ok(())
    }

    pub fn rule(&self, right: Right) -> Option<Rule> {
        self.rights.get(right.name()).copied()
    }
}

/// File-backed [`Authority`].
pub struct LocalAuthority {
    policy_path: PathBuf,
    secret: Zeroizing<Vec<u8>>,
    ttl: Duration,
    admin_uids: Vec<u32>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn denied(reason: impl Into<String>) -> PoolwatchError {
    PoolwatchError::AuthorizationDenied(reason.into())
}

impl LocalAuthority {
    pub fn new(
        policy_path: impl Into<PathBuf>,
        secret: Zeroizing<Vec<u8>>,
        ttl: Duration,
        admin_uids: Vec<u32>,
    ) -> PoolwatchResult<Self> {
        if secret.len() < SECRET_LEN {
            return Err(PoolwatchError::InvalidConfig(format!(
                "token secret must be at least {SECRET_LEN} bytes"
            )));
        }
        Ok(Self {
            policy_path: policy_path.into(),
            secret,
            ttl,
            admin_uids,
        })
    }

    /// Build from configuration, generating the signing secret on first use.
    pub fn from_config(cfg: &AuthorizationCfg) -> PoolwatchResult<Self> {
        let secret = load_or_create_secret(Path::new(&cfg.secret_path))?;
        Self::new(
            &cfg.policy_path,
            secret,
            Duration::from_secs(cfg.token_ttl_secs),
            cfg.admin_uids.clone(),
        )
    }

    fn mac(&self, payload: &str) -> PoolwatchResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|err| PoolwatchError::InvalidConfig(format!("token secret: {err}")))?;
        mac.update(payload.as_bytes());
        Ok(mac)
    }

    fn issue(&self, right: Right, uid: u32) -> PoolwatchResult<AuthorizationToken> {
        let expires = now_secs().saturating_add(self.ttl.as_secs());
        let payload = format!("{TOKEN_VERSION}:{}:{uid}:{expires}", right.name());
        let tag = hex::encode(self.mac(&payload)?.finalize().into_bytes());
        Ok(AuthorizationToken(format!("{payload}:{tag}")))
    }
}

impl Authority for LocalAuthority {
    fn ensure_rights(&self) -> PoolwatchResult<Vec<Right>> {
        let mut db = RightsDatabase::load(&self.policy_path)?;
        let mut added = Vec::new();
        for right in Right::ALL {
            if db.rule(right).is_none() {
                db.rights.insert(right.name().to_string(), right.default_rule());
                added.push(right);
            }
        }
        if !added.is_empty() {
            db.save(&self.policy_path)?;
            info!(
                "registered {} rights in {}",
                added.len(),
                self.policy_path.display()
            );
        }
        Ok(added)
    }

    fn rule(&self, right: Right) -> PoolwatchResult<Rule> {
        let db = RightsDatabase::load(&self.policy_path)?;
        Ok(db.rule(right).unwrap_or_else(|| right.default_rule()))
    }

    fn is_admin(&self, uid: u32) -> bool {
        uid == 0 || self.admin_uids.contains(&uid)
    }

    fn request(
        &self,
        right: Right,
        uid: u32,
        prompt: &dyn CredentialPrompt,
    ) -> PoolwatchResult<AuthorizationToken> {
        let granted = match self.rule(right)? {
            Rule::Allow => true,
            Rule::Deny => false,
            Rule::Admin => self.is_admin(uid) || prompt.confirm(right, uid)?,
        };
        if !granted {
            warn!("denied {right} to uid {uid}");
            return Err(denied(format!("{right} is not granted to uid {uid}")));
        }
        info!("granted {right} to uid {uid}");
        self.issue(right, uid)
    }

    fn validate(
        &self,
        token: &AuthorizationToken,
        right: Right,
        peer_uid: u32,
    ) -> PoolwatchResult<()> {
        let (payload, tag) = token
            .as_str()
            .rsplit_once(':')
            .ok_or_else(|| denied("malformed token"))?;
        let fields: Vec<&str> = payload.split(':').collect();
        let [version, name, uid, expires] = fields.as_slice() else {
            return Err(denied("malformed token"));
        };
        if *version != TOKEN_VERSION {
            return Err(denied(format!("unsupported token version `{version}`")));
        }
        let tag = Vec::from_hex(tag).map_err(|_| denied("malformed token signature"))?;
        self.mac(payload)?
            .verify_slice(&tag)
            .map_err(|_| denied("token signature does not verify"))?;
        if *name != right.name() {
            return Err(denied(format!("token grants {name}, command needs {right}")));
        }
        let uid: u32 = uid.parse().map_err(|_| denied("malformed token uid"))?;
        if uid != peer_uid {
            return Err(denied(format!(
                "token issued to uid {uid}, presented by uid {peer_uid}"
            )));
        }
        let expires: u64 = expires.parse().map_err(|_| denied("malformed token expiry"))?;
        if now_secs() >= expires {
            return Err(denied("token expired"));
        }
        // Policy may have been tightened since the token was issued.
        if self.rule(right)? == Rule::Deny {
            return Err(denied(format!("{right} is denied by policy")));
        }
        Ok(())
    }
}

/// Read the hex-encoded signing secret, creating it (mode 0600) if absent.
pub fn load_or_create_secret(path: &Path) -> PoolwatchResult<Zeroizing<Vec<u8>>> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let secret = Vec::from_hex(contents.trim()).map_err(|err| {
                PoolwatchError::InvalidConfig(format!(
                    "token secret {} is not hex: {err}",
                    path.display()
                ))
            })?;
            Ok(Zeroizing::new(secret))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let mut secret = Zeroizing::new(vec![0u8; SECRET_LEN]);
            fs::File::open("/dev/urandom")?.read_exact(&mut secret)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let encoded = Zeroizing::new(hex::encode(secret.as_slice()));
            fs::write(path, encoded.as_bytes())?;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
            info!("generated token secret at {}", path.display());
            Ok(secret)
        }
        Err(err) => Err(err.into()),
    }
}
