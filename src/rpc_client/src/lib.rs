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

//! Client-side handles to drop manager agents.
//!
//! The [`DropManager`] trait is the contract every tier of the manager
//! hierarchy speaks: a composite manager consumes it downward through
//! [`NodeManagerClient`] handles and exposes it upward to its own callers.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use dropflow_common::drop::{DropId, DropRel, DropSpec, SessionId};
use dropflow_common::error::Result;

mod node_manager_client;
pub use node_manager_client::NodeManagerClient;

/// The drop manager contract.
///
/// Children of a composite manager are interchangeable through this trait:
/// a remote agent reached over REST behaves the same as another composite
/// manager stacked below.
#[async_trait]
pub trait DropManager: Send + Sync {
    /// Creates a new, empty session.
    async fn create_session(&self, session_id: &str) -> Result<()>;

    /// Tears a session down, stopping whatever it is running.
    async fn destroy_session(&self, session_id: &str) -> Result<()>;

    /// Appends drop specifications to the session's physical graph.
    async fn add_graph_spec(&self, session_id: &str, graph_spec: Vec<DropSpec>) -> Result<()>;

    /// Instantiates the session's graph and starts executing it.
    async fn deploy_session(&self, session_id: &str, completed_drops: &[DropId]) -> Result<()>;

    /// Tells a node manager which drops on other hosts it must exchange
    /// events with, keyed by the host holding the other endpoint.
    async fn add_node_subscriptions(
        &self,
        session_id: &str,
        rels: &HashMap<String, Vec<DropRel>>,
    ) -> Result<()>;

    /// Moves the given drops to their completed state right away.
    async fn trigger_drops(&self, session_id: &str, uids: &[DropId]) -> Result<()>;

    /// The session's graph, indexed by unique identifier.
    async fn get_graph(&self, session_id: &str) -> Result<HashMap<DropId, DropSpec>>;

    /// Per-drop status of the session's graph.
    async fn get_graph_status(&self, session_id: &str) -> Result<HashMap<DropId, Value>>;

    /// The session's own status.
    async fn get_session_status(&self, session_id: &str) -> Result<Value>;

    /// Number of drops in the session's graph.
    async fn get_graph_size(&self, session_id: &str) -> Result<u64>;

    /// The sessions this manager currently knows about.
    async fn get_session_ids(&self) -> Result<Vec<SessionId>>;
}
