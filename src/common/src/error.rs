// Copyright 2023 Dropflow Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;

use itertools::Itertools;
use thiserror::Error;

use crate::drop::{DropId, SessionId};

/// A specialized Result type for dropflow operations.
pub type Result<T, E = DfError> = std::result::Result<T, E>;

/// The error type shared across the dropflow crates.
#[derive(Error, Debug)]
pub enum DfError {
    /// A submitted graph is malformed for the current tier: a spec is missing
    /// a required attribute, or names a partition this manager does not own.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// Completed-drop uids that are not part of the session graph.
    #[error("uids for completed drops not found: {0:?}")]
    UnknownUids(Vec<DropId>),

    /// A child agent could not be brought up on a remote host.
    #[error("failed to bring up an agent on {host}:{port}: {reason}")]
    AgentStartup {
        host: String,
        port: u16,
        reason: String,
    },

    /// A child's endpoint is unreachable or misbehaves at the wire level.
    #[error("transport error talking to {host}: {source}")]
    Transport {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    /// A child reported a domain error.
    #[error("{host} reported an error (status {status}): {message}")]
    Remote {
        host: String,
        status: u16,
        message: String,
    },

    /// The session id is not known to this manager tier.
    #[error("session {0} is not known to this manager")]
    SessionNotFound(SessionId),

    /// One or more children failed during a fan-out. The per-host causes are
    /// all kept; siblings of a failed child are still attempted.
    #[error(
        "one or more errors occurred while {action} on session {session_id} (failed hosts: {})",
        .errors.keys().sorted().join(", ")
    )]
    SubManager {
        action: String,
        session_id: SessionId,
        errors: HashMap<String, DfError>,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DfError {
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        DfError::Internal(anyhow::anyhow!("{msg}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_manager_display_lists_hosts() {
        let err = DfError::SubManager {
            action: "creating sessions".to_string(),
            session_id: "s1".to_string(),
            errors: HashMap::from([
                ("h2".to_string(), DfError::internal("boom")),
                ("h1".to_string(), DfError::internal("bang")),
            ]),
        };
        assert_eq!(
            err.to_string(),
            "one or more errors occurred while creating sessions on session s1 \
             (failed hosts: h1, h2)"
        );
    }
}
