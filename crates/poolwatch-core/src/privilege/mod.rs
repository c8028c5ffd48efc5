//! Privilege separation: rights, token authority, wire protocol, and both
//! ends of the helper connection.

pub mod authority;
pub mod client;
pub mod protocol;
pub mod rights;
pub mod server;

pub use authority::{
    load_or_create_secret, AuthorizationToken, Authority, CredentialPrompt, LocalAuthority,
    NoPrompt, RightsDatabase,
};
pub use client::{CommandHandle, CommandState, Dispatcher, HelperClient};
pub use protocol::{
    Command, Outcome, ReplyEnvelope, RequestEnvelope, Response, SecretBytes, VersionInfo,
    PROTOCOL_VERSION,
};
pub use rights::{Right, Rule};
pub use server::PrivilegedHandler;
