//! Identifier generation.
//!
//! Node ids are generated client-side, so two clients can race on the same
//! id. They are 16 hex chars of randomness and are checked against the whole
//! document before use; the remote's uniqueness constraint is the backstop.
//! Document and operation ids are UUID v4.

use crate::model::Node;
use crate::mutators;
use rand::Rng;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ClientIdError {
    #[error("Invalid client ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// Identifies this engine instance as the origin of remote writes.
///
/// Displays as a 16-character hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Generate a new random client ID. Never returns zero.
    pub fn generate() -> Self {
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = ClientIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ClientIdError::InvalidFormat);
        }
        Ok(Self(u64::from_str_radix(&s.to_ascii_lowercase(), 16)?))
    }
}

impl From<u64> for ClientId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Random node id, 16 lowercase hex chars.
pub fn generate_node_id() -> String {
    let id: u64 = rand::rng().random();
    format!("{:016x}", id)
}

/// Node id that does not occur anywhere in `root`'s tree.
pub fn generate_unique_node_id(root: &Node) -> String {
    loop {
        let id = generate_node_id();
        if id != crate::model::ROOT_ALIAS && mutators::find_node(root, &id).is_none() {
            return id;
        }
    }
}

/// Fresh document id.
pub fn generate_document_id() -> String {
    Uuid::new_v4().to_string()
}

/// Fresh operation id.
pub fn generate_operation_id() -> String {
    Uuid::new_v4().to_string()
}
