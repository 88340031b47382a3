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
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use dropflow_common::drop::{DropId, DropRel, DropSpec, SessionId};
use dropflow_common::error::{DfError, Result};

use crate::DropManager;

/// A client to the REST interface of one drop manager agent.
///
/// The handle owns its connection pool; dropping it releases the underlying
/// connections on every exit path.
#[derive(Clone, Debug)]
pub struct NodeManagerClient {
    host: String,
    port: u16,
    inner: reqwest::Client,
}

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    session_id: &'a str,
}

#[derive(Serialize)]
struct DeploySessionRequest<'a> {
    completed: &'a [DropId],
}

#[derive(Serialize)]
struct TriggerDropsRequest<'a> {
    uids: &'a [DropId],
}

/// Shape of the error payload an agent reports alongside a non-2xx status.
#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl NodeManagerClient {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::with_connect_timeout(host, port, Self::DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| DfError::Internal(e.into()))?;
        Ok(Self {
            host: host.to_string(),
            port,
            inner,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}:{}/api{}", self.host, self.port, path)
    }

    fn transport(&self, err: reqwest::Error) -> DfError {
        DfError::Transport {
            host: self.host.clone(),
            source: err.into(),
        }
    }

    /// Sends the request and turns a non-2xx answer into a [`DfError::Remote`]
    /// carrying whatever cause the agent reported.
    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req.send().await.map_err(|e| self.transport(e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = match resp.text().await {
            Ok(body) => serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.message)
                .unwrap_or(body),
            Err(_) => String::new(),
        };
        debug!(host = %self.host, %status, message, "agent rejected a request");
        Err(DfError::Remote {
            host: self.host.clone(),
            status: status.as_u16(),
            message,
        })
    }

    async fn post_json<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<()> {
        self.execute(self.inner.post(self.url(path)).json(body))
            .await
            .map(|_| ())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.execute(self.inner.get(self.url(path))).await?;
        resp.json().await.map_err(|e| self.transport(e))
    }
}

#[async_trait]
impl DropManager for NodeManagerClient {
    async fn create_session(&self, session_id: &str) -> Result<()> {
        self.post_json("/sessions", &CreateSessionRequest { session_id })
            .await
    }

    async fn destroy_session(&self, session_id: &str) -> Result<()> {
        self.execute(self.inner.delete(self.url(&format!("/sessions/{session_id}"))))
            .await
            .map(|_| ())
    }

    async fn add_graph_spec(&self, session_id: &str, graph_spec: Vec<DropSpec>) -> Result<()> {
        self.post_json(&format!("/sessions/{session_id}/graph/append"), &graph_spec)
            .await
    }

    async fn deploy_session(&self, session_id: &str, completed_drops: &[DropId]) -> Result<()> {
        self.post_json(
            &format!("/sessions/{session_id}/deploy"),
            &DeploySessionRequest {
                completed: completed_drops,
            },
        )
        .await
    }

    async fn add_node_subscriptions(
        &self,
        session_id: &str,
        rels: &HashMap<String, Vec<DropRel>>,
    ) -> Result<()> {
        self.post_json(&format!("/sessions/{session_id}/subscriptions"), rels)
            .await
    }

    async fn trigger_drops(&self, session_id: &str, uids: &[DropId]) -> Result<()> {
        self.post_json(
            &format!("/sessions/{session_id}/trigger"),
            &TriggerDropsRequest { uids },
        )
        .await
    }

    async fn get_graph(&self, session_id: &str) -> Result<HashMap<DropId, DropSpec>> {
        self.get_json(&format!("/sessions/{session_id}/graph")).await
    }

    async fn get_graph_status(&self, session_id: &str) -> Result<HashMap<DropId, Value>> {
        self.get_json(&format!("/sessions/{session_id}/graph/status"))
            .await
    }

    async fn get_session_status(&self, session_id: &str) -> Result<Value> {
        self.get_json(&format!("/sessions/{session_id}/status")).await
    }

    async fn get_graph_size(&self, session_id: &str) -> Result<u64> {
        self.get_json(&format!("/sessions/{session_id}/graph/size"))
            .await
    }

    async fn get_session_ids(&self) -> Result<Vec<SessionId>> {
        self.get_json("/sessions").await
    }
}
