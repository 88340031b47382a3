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

//! Keeping child agents alive.
//!
//! [`AgentConnector`] is the seam between a composite manager and the
//! machines it manages: it knows how to check that an agent is listening,
//! how to start one when it is not, and how to open a client to it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use dropflow_common::error::{DfError, Result};
use dropflow_common::util::net::port_is_open;
use dropflow_rpc_client::{DropManager, NodeManagerClient};

use crate::ssh;

/// Pause between two sweeps of the background agent checker.
const AGENT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// How a composite manager reaches the agents it supervises.
#[async_trait]
pub trait AgentConnector: Send + Sync + 'static {
    /// Makes sure an agent is listening at `host:port`, bootstrapping one if
    /// nothing answers within `timeout`.
    async fn ensure_agent(&self, host: &str, port: u16, timeout: Duration) -> Result<()>;

    /// Opens a client to the agent listening at `host:port`.
    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn DropManager>>;
}

/// The production [`AgentConnector`]: probes over TCP, bootstraps over SSH
/// with public-key authentication, and talks REST once the agent is up.
pub struct SshAgentConnector {
    exec: String,
    manager_id: String,
    user: String,
    pkey_path: Option<PathBuf>,
}

impl SshAgentConnector {
    pub fn new(
        exec: impl Into<String>,
        manager_id: impl Into<String>,
        user: Option<String>,
        pkey_path: Option<PathBuf>,
    ) -> Self {
        let user = user
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());
        Self {
            exec: exec.into(),
            manager_id: manager_id.into(),
            user,
            pkey_path,
        }
    }

    /// The command line that brings up an agent on `host`, detached and bound
    /// to that host's address.
    fn command_line(&self, host: &str, port: u16) -> String {
        format!(
            "{} -i {} -P {} -d --host {}",
            self.exec, self.manager_id, port, host
        )
    }

    async fn start_agent(&self, host: &str, port: u16) -> Result<()> {
        let command = self.command_line(host, port);
        debug!(host, port, %command, "starting agent over SSH");
        let output = ssh::exec_remote(host, &self.user, self.pkey_path.as_deref(), &command)
            .await
            .map_err(|e| DfError::AgentStartup {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;
        if output.status != 0 {
            error!(
                host,
                port,
                status = output.status,
                "failed to start the agent, stdout/stderr follow:\n==STDOUT==\n{}\n==STDERR==\n{}",
                output.stdout,
                output.stderr
            );
            return Err(DfError::AgentStartup {
                host: host.to_string(),
                port,
                reason: format!("'{}' exited with status {}", command, output.status),
            });
        }
        info!(host, port, "agent successfully started");
        Ok(())
    }

    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> Result<bool> {
        port_is_open(host, port, Some(timeout))
            .await
            .map_err(|e| DfError::Internal(anyhow!(e).context(format!("probing {host}:{port}"))))
    }
}

#[async_trait]
impl AgentConnector for SshAgentConnector {
    async fn ensure_agent(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        debug!(host, port, "checking agent presence");
        if self.probe(host, port, timeout).await? {
            debug!(host, port, "agent already present");
            return Ok(());
        }

        // Nothing is listening; bring the agent up ourselves. This relies on
        // public-key SSH access to the host.
        debug!(host, port, "agent not present, will start it now");
        self.start_agent(host, port).await?;

        // Give the agent a chance to start listening; if it doesn't, fail.
        if !self.probe(host, port, timeout).await? {
            return Err(DfError::AgentStartup {
                host: host.to_string(),
                port,
                reason: "agent was started but its port never opened".to_string(),
            });
        }
        Ok(())
    }

    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn DropManager>> {
        Ok(Box::new(NodeManagerClient::new(host, port)?))
    }
}

/// Spawns the background task that periodically re-checks every known host,
/// opportunistically restarting agents that went away. Failures are logged
/// and swallowed; real errors surface when an operation is actually issued.
pub(crate) fn start_agent_checker(
    connector: Arc<dyn AgentConnector>,
    hosts: Arc<RwLock<Vec<String>>>,
    port: u16,
    check_timeout: Duration,
) -> (JoinHandle<()>, watch::Sender<()>) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(());
    let join_handle = tokio::spawn(async move {
        loop {
            // Snapshot so host-list mutations only have to be visible to the
            // next sweep.
            let sweep: Vec<String> = hosts.read().clone();
            for host in sweep {
                if shutdown_rx.has_changed().unwrap_or(true) {
                    return;
                }
                if let Err(err) = connector.ensure_agent(&host, port, check_timeout).await {
                    warn!(%host, error = %err, "couldn't ensure an agent, will try again later");
                }
            }
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    debug!("agent checker stopped");
                    return;
                }
                _ = sleep(AGENT_CHECK_INTERVAL) => {}
            }
        }
    });
    (join_handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_command_line() {
        let connector = SshAgentConnector::new(
            "dropflow-nm",
            "nm",
            Some("dfops".to_string()),
            None,
        );
        assert_eq!(
            connector.command_line("h1", 8000),
            "dropflow-nm -i nm -P 8000 -d --host h1"
        );
    }
}
