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

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dropflow_common::constants::{
    ISLAND_DEFAULT_REST_PORT, ISLAND_MANAGER_EXEC, NODE_DEFAULT_REST_PORT, NODE_MANAGER_EXEC,
};
use dropflow_common::drop::{DropId, DropRel, DropSpec, Graph, SessionId};
use dropflow_common::error::{DfError, Result};
use dropflow_common::graph;
use dropflow_rpc_client::DropManager;

use crate::agent::{start_agent_checker, AgentConnector, SshAgentConnector};
use crate::partition::{self, DropRelMap};

/// Upper bound on how many children are contacted concurrently in a fan-out.
const MAX_FANOUT: usize = 20;

/// Construction-time options shared by the composite manager profiles.
#[derive(Clone, Debug)]
pub struct CompositeOptions {
    /// Path to the SSH private key used when starting remote agents; `None`
    /// searches the default locations.
    pub pkey_path: Option<PathBuf>,
    /// User to authenticate as when starting remote agents; `None` means the
    /// current user.
    pub ssh_user: Option<String>,
    /// How long to wait before declaring an agent not-yet-present on a host.
    pub check_timeout: Duration,
}

impl Default for CompositeOptions {
    fn default() -> Self {
        Self {
            pkey_path: None,
            ssh_user: None,
            check_timeout: Duration::from_secs(10),
        }
    }
}

/// A drop manager that in turn manages drop managers.
///
/// Managers form a hierarchy where those at the bottom actually host drops
/// while the tiers above relay commands and aggregate results. This type
/// implements the upper part of the hierarchy generically: it only assumes
/// its children obey the [`DropManager`] contract, so any number of levels
/// stack seamlessly.
///
/// Each tier partitions the graphs it receives so every drop lands on the
/// child owning it; the spec attribute used for partitioning is given at
/// construction time, as is the port children listen on.
pub struct CompositeManager {
    dm_port: u16,
    partition_attr: String,
    check_timeout: Duration,
    pool_size: usize,
    connector: Arc<dyn AgentConnector>,
    dm_hosts: Arc<RwLock<Vec<String>>>,
    /// The bottom-level nodes covered by this manager. Unlike `dm_hosts`,
    /// which this manager talks to directly, these are the machines where
    /// drops ultimately run.
    nodes: RwLock<Vec<String>>,
    graphs: RwLock<HashMap<SessionId, Graph>>,
    drop_rels: RwLock<HashMap<SessionId, DropRelMap>>,
    session_ids: RwLock<Vec<SessionId>>,
    checker: Mutex<Option<(JoinHandle<()>, watch::Sender<()>)>>,
}

impl CompositeManager {
    /// Creates a composite manager whose children are expected on `dm_hosts`,
    /// listening on `dm_port`. Children that are not up are bootstrapped by
    /// running `dm_exec` on their host over SSH.
    ///
    /// Must be called within a tokio runtime: the background agent checker is
    /// spawned right away.
    pub fn new(
        dm_port: u16,
        partition_attr: &str,
        dm_exec: &str,
        manager_id: &str,
        dm_hosts: Vec<String>,
        options: CompositeOptions,
    ) -> Self {
        let connector = Arc::new(SshAgentConnector::new(
            dm_exec,
            manager_id,
            options.ssh_user.clone(),
            options.pkey_path.clone(),
        ));
        Self::with_connector(dm_port, partition_attr, dm_hosts, options.check_timeout, connector)
    }

    /// Like [`CompositeManager::new`], but with full control over how child
    /// agents are probed, bootstrapped and dialled.
    pub fn with_connector(
        dm_port: u16,
        partition_attr: &str,
        dm_hosts: Vec<String>,
        check_timeout: Duration,
        connector: Arc<dyn AgentConnector>,
    ) -> Self {
        let pool_size = dm_hosts.len().clamp(1, MAX_FANOUT);
        let dm_hosts = Arc::new(RwLock::new(dm_hosts));
        let checker =
            start_agent_checker(connector.clone(), dm_hosts.clone(), dm_port, check_timeout);
        Self {
            dm_port,
            partition_attr: partition_attr.to_string(),
            check_timeout,
            pool_size,
            connector,
            dm_hosts,
            nodes: RwLock::default(),
            graphs: RwLock::default(),
            drop_rels: RwLock::default(),
            session_ids: RwLock::default(),
            checker: Mutex::new(Some(checker)),
        }
    }

    /// Stops the background agent checker and waits for it to exit. In-flight
    /// operations are left alone; they complete (or fail) on their own.
    pub async fn shutdown(&self) {
        let checker = self.checker.lock().take();
        if let Some((handle, shutdown_tx)) = checker {
            let _ = shutdown_tx.send(());
            if let Err(err) = handle.await {
                warn!(error = %err, "agent checker did not shut down cleanly");
            }
        }
    }

    pub fn dm_port(&self) -> u16 {
        self.dm_port
    }

    pub fn dm_hosts(&self) -> Vec<String> {
        self.dm_hosts.read().clone()
    }

    pub fn add_dm_host(&self, host: String) {
        self.dm_hosts.write().push(host);
    }

    pub fn remove_dm_host(&self, host: &str) {
        self.dm_hosts.write().retain(|h| h != host);
    }

    pub fn nodes(&self) -> Vec<String> {
        self.nodes.read().clone()
    }

    pub fn add_node(&self, node: String) {
        self.nodes.write().push(node);
    }

    pub fn remove_node(&self, node: &str) {
        self.nodes.write().retain(|n| n != node);
    }

    fn host_items(&self) -> Vec<(String, ())> {
        self.dm_hosts.read().iter().cloned().map(|h| (h, ())).collect()
    }

    fn known_session(&self, session_id: &str) -> Result<()> {
        if self.session_ids.read().iter().any(|s| s == session_id) {
            Ok(())
        } else {
            Err(DfError::SessionNotFound(session_id.to_string()))
        }
    }

    /// Replicates a call across the agents at every item's host, at most
    /// `pool_size` at a time.
    ///
    /// Each item is wrapped the same way: make sure the host's agent is up,
    /// open a scoped client to it and invoke `f`. A failing host never
    /// cancels its in-flight siblings; every host is attempted, and the
    /// per-host failures are reported together at the end.
    async fn replicate<I, R, F, Fut>(
        &self,
        session_id: &str,
        action: &str,
        port: u16,
        items: Vec<(String, I)>,
        f: F,
    ) -> Result<Vec<(String, R)>>
    where
        I: Send,
        R: Send,
        F: Fn(Box<dyn DropManager>, String, I) -> Fut + Sync,
        Fut: Future<Output = Result<R>> + Send,
    {
        let f = &f;
        let outcomes = futures::stream::iter(items)
            .map(|(host, item)| async move {
                let res = self.call_host(&host, port, item, f).await;
                (host, res)
            })
            .buffer_unordered(self.pool_size)
            .collect::<Vec<_>>()
            .await;

        let mut collected = Vec::with_capacity(outcomes.len());
        let mut errors = HashMap::new();
        for (host, res) in outcomes {
            match res {
                Ok(r) => collected.push((host, r)),
                Err(e) => {
                    warn!(%host, session_id, error = %e, "child manager failed while {}", action);
                    errors.insert(host, e);
                }
            }
        }
        if !errors.is_empty() {
            return Err(DfError::SubManager {
                action: action.to_string(),
                session_id: session_id.to_string(),
                errors,
            });
        }
        Ok(collected)
    }

    /// The client only lives for this one call; it is released on every exit
    /// path once `f` returns.
    async fn call_host<I, R, F, Fut>(&self, host: &str, port: u16, item: I, f: &F) -> Result<R>
    where
        F: Fn(Box<dyn DropManager>, String, I) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.connector
            .ensure_agent(host, port, self.check_timeout)
            .await?;
        let dm = self.connector.connect(host, port)?;
        f(dm, host.to_string(), item).await
    }

    /// Hands each node manager the list of cross-partition relationships it
    /// is an endpoint of. This goes straight to the leaf nodes at the node
    /// port — subscription wiring is a leaf-level concern, and this tier's
    /// own port only addresses its direct children.
    async fn send_node_subscriptions(&self, session_id: &str, rels: DropRelMap) -> Result<()> {
        let items: Vec<(String, HashMap<String, Vec<DropRel>>)> = rels.into_iter().collect();
        self.replicate(
            session_id,
            "adding relationship information",
            NODE_DEFAULT_REST_PORT,
            items,
            |dm, host, subs| async move {
                dm.add_node_subscriptions(session_id, &subs).await?;
                debug!(%host, session_id, "successfully added relationship info");
                Ok(())
            },
        )
        .await?;
        Ok(())
    }

    /// Validates the given uids against the session graph, groups them by
    /// their owning leaf node and tells each node manager to move them to
    /// COMPLETED.
    async fn trigger_completed(&self, session_id: &str, uids: &[DropId]) -> Result<()> {
        let completed_by_host = {
            let graphs = self.graphs.read();
            let empty = Graph::default();
            let session_graph = graphs.get(session_id).unwrap_or(&empty);
            let not_found: Vec<DropId> = uids
                .iter()
                .filter(|uid| !session_graph.contains_key(*uid))
                .cloned()
                .sorted()
                .collect();
            if !not_found.is_empty() {
                return Err(DfError::UnknownUids(not_found));
            }
            partition::group_by_node(uids, session_graph)?
        };

        info!(session_id, ?uids, "moving drops to COMPLETED right away");
        let items: Vec<(String, Vec<DropId>)> = completed_by_host.into_iter().collect();
        self.replicate(
            session_id,
            "triggering drops",
            NODE_DEFAULT_REST_PORT,
            items,
            |dm, host, uids| async move {
                dm.trigger_drops(session_id, &uids).await?;
                debug!(%host, session_id, "triggered initial drops");
                Ok(())
            },
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DropManager for CompositeManager {
    async fn create_session(&self, session_id: &str) -> Result<()> {
        info!(session_id, "creating session in all hosts");
        self.replicate(
            session_id,
            "creating sessions",
            self.dm_port,
            self.host_items(),
            |dm, host, ()| async move {
                dm.create_session(session_id).await?;
                debug!(%host, session_id, "successfully created session");
                Ok(())
            },
        )
        .await?;
        self.session_ids.write().push(session_id.to_string());
        info!(session_id, "successfully created session in all hosts");
        Ok(())
    }

    async fn destroy_session(&self, session_id: &str) -> Result<()> {
        info!(session_id, "destroying session in all hosts");
        let res = self
            .replicate(
                session_id,
                "destroying sessions",
                self.dm_port,
                self.host_items(),
                |dm, host, ()| async move {
                    dm.destroy_session(session_id).await?;
                    debug!(%host, session_id, "successfully destroyed session");
                    Ok(())
                },
            )
            .await;

        // Local bookkeeping goes away even when children failed, so that a
        // partially-created session can always be cleaned up.
        self.session_ids.write().retain(|s| s != session_id);
        self.graphs.write().remove(session_id);
        self.drop_rels.write().remove(session_id);
        res?;
        Ok(())
    }

    async fn add_graph_spec(&self, session_id: &str, graph_spec: Vec<DropSpec>) -> Result<()> {
        self.known_session(session_id)?;

        // Break the graph into smaller graphs that each belong to one child,
        // so they can be submitted to the individual managers.
        info!(session_id, num_specs = graph_spec.len(), "separating graph");
        let hosts = self.dm_hosts();
        let mut per_partition =
            partition::partition_graph(graph_spec, &self.partition_attr, &hosts)?;

        // Relationships must be local to a partition by the time the graph
        // reaches a child; the ones crossing partitions are recorded apart
        // and delivered to the node managers at deployment time.
        let mut inter_partition_rels = Vec::new();
        for bucket in per_partition.values_mut() {
            inter_partition_rels.extend(graph::remove_unmet_relationships(bucket));
        }

        let rels_map = {
            let mut graphs = self.graphs.write();
            let session_graph = graphs.entry(session_id.to_string()).or_default();
            for spec in per_partition.values().flatten() {
                session_graph.insert(spec.uid()?.to_string(), spec.clone());
            }
            partition::sanitize_relations(&mut inter_partition_rels, session_graph)?;
            partition::build_drop_rels(&inter_partition_rels, session_graph)?
        };
        info!(
            session_id,
            num_rels = inter_partition_rels.len(),
            "removed (and sanitized) inter-manager relationships"
        );
        self.drop_rels.write().insert(session_id.to_string(), rels_map);

        info!(session_id, "adding individual graphs to each child manager");
        let items: Vec<(String, Vec<DropSpec>)> = per_partition.into_iter().collect();
        self.replicate(
            session_id,
            "appending graphs",
            self.dm_port,
            items,
            |dm, host, bucket| async move {
                dm.add_graph_spec(session_id, bucket).await?;
                info!(%host, session_id, "successfully appended graph");
                Ok(())
            },
        )
        .await?;
        Ok(())
    }

    async fn deploy_session(&self, session_id: &str, completed_drops: &[DropId]) -> Result<()> {
        self.known_session(session_id)?;

        // The node managers must subscribe to cross-partition events before
        // anything is deployed, or early events would be missed.
        let rels = self
            .drop_rels
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        if !rels.is_empty() {
            self.send_node_subscriptions(session_id, rels).await?;
            info!(session_id, "delivered node subscription list to node managers");
        }

        info!(session_id, "deploying session in all hosts");
        self.replicate(
            session_id,
            "deploying session",
            self.dm_port,
            self.host_items(),
            |dm, host, ()| async move {
                dm.deploy_session(session_id, &[]).await?;
                debug!(%host, session_id, "successfully deployed session");
                Ok(())
            },
        )
        .await?;
        info!(session_id, "successfully deployed session in all hosts");

        // Only now that everything is wired up can the requested drops be
        // moved to COMPLETED without losing events.
        if !completed_drops.is_empty() {
            self.trigger_completed(session_id, completed_drops).await?;
            info!(session_id, "successfully triggered drops");
        }
        Ok(())
    }

    async fn add_node_subscriptions(
        &self,
        _session_id: &str,
        _rels: &HashMap<String, Vec<DropRel>>,
    ) -> Result<()> {
        // Subscriptions are a node-manager concern; composite tiers deliver
        // them straight to the leaf nodes during deploy_session.
        Err(DfError::internal(
            "only node managers accept event subscriptions",
        ))
    }

    async fn trigger_drops(&self, session_id: &str, uids: &[DropId]) -> Result<()> {
        self.trigger_completed(session_id, uids).await
    }

    async fn get_graph(&self, session_id: &str) -> Result<HashMap<DropId, DropSpec>> {
        let collected = self
            .replicate(
                session_id,
                "getting the graph",
                self.dm_port,
                self.host_items(),
                |dm, _host, ()| async move { dm.get_graph(session_id).await },
            )
            .await?;
        let mut all_graphs: HashMap<DropId, DropSpec> = HashMap::new();
        for (_, g) in collected {
            all_graphs.extend(g);
        }

        // The graphs coming from the children are not interconnected: put
        // the recorded cross-partition links back before handing the graph
        // upstream. The symmetric map holds each relationship twice, so
        // de-duplicate first.
        let rels: HashSet<DropRel> = self
            .drop_rels
            .read()
            .get(session_id)
            .map(|m| {
                m.values()
                    .flat_map(|by_host| by_host.values())
                    .flatten()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for rel in rels {
            match all_graphs.get_mut(&rel.rhs) {
                Some(spec) => graph::add_link(rel.rel, spec, &rel.lhs),
                None => warn!(
                    session_id,
                    uid = %rel.rhs,
                    "cross-partition link references a drop absent from the collected graph"
                ),
            }
        }
        Ok(all_graphs)
    }

    async fn get_graph_status(&self, session_id: &str) -> Result<HashMap<DropId, Value>> {
        let collected = self
            .replicate(
                session_id,
                "getting the graph status",
                self.dm_port,
                self.host_items(),
                |dm, _host, ()| async move { dm.get_graph_status(session_id).await },
            )
            .await?;
        let mut all_status = HashMap::new();
        for (_, statuses) in collected {
            all_status.extend(statuses);
        }
        Ok(all_status)
    }

    async fn get_session_status(&self, session_id: &str) -> Result<Value> {
        let collected = self
            .replicate(
                session_id,
                "getting the session status",
                self.dm_port,
                self.host_items(),
                |dm, _host, ()| async move { dm.get_session_status(session_id).await },
            )
            .await?;
        let mut by_host = serde_json::Map::new();
        for (host, status) in collected {
            by_host.insert(host, status);
        }
        Ok(Value::Object(by_host))
    }

    async fn get_graph_size(&self, session_id: &str) -> Result<u64> {
        let collected = self
            .replicate(
                session_id,
                "getting the graph size",
                self.dm_port,
                self.host_items(),
                |dm, _host, ()| async move { dm.get_graph_size(session_id).await },
            )
            .await?;
        Ok(collected.into_iter().map(|(_, n)| n).sum())
    }

    async fn get_session_ids(&self) -> Result<Vec<SessionId>> {
        Ok(self.session_ids.read().clone())
    }
}

/// A composite manager over node managers. Its children are themselves the
/// final nodes where drops run.
pub struct DataIslandManager {
    inner: CompositeManager,
}

impl DataIslandManager {
    pub fn new(dm_hosts: Vec<String>, options: CompositeOptions) -> Self {
        let inner = CompositeManager::new(
            NODE_DEFAULT_REST_PORT,
            "node",
            NODE_MANAGER_EXEC,
            "nm",
            dm_hosts,
            options,
        );
        info!(hosts = ?inner.dm_hosts(), "created data island manager");
        Self { inner }
    }

    pub fn nodes(&self) -> Vec<String> {
        self.inner.dm_hosts()
    }

    pub fn add_node(&self, node: String) {
        self.inner.add_dm_host(node);
    }

    pub fn remove_node(&self, node: &str) {
        self.inner.remove_dm_host(node);
    }
}

impl Deref for DataIslandManager {
    type Target = CompositeManager;

    fn deref(&self) -> &CompositeManager {
        &self.inner
    }
}

/// A composite manager over data island managers.
pub struct MasterManager {
    inner: CompositeManager,
}

impl MasterManager {
    pub fn new(dm_hosts: Vec<String>, options: CompositeOptions) -> Self {
        let inner = CompositeManager::new(
            ISLAND_DEFAULT_REST_PORT,
            "island",
            ISLAND_MANAGER_EXEC,
            "dim",
            dm_hosts,
            options,
        );
        info!(hosts = ?inner.dm_hosts(), "created master manager");
        Self { inner }
    }
}

impl Deref for MasterManager {
    type Target = CompositeManager;

    fn deref(&self) -> &CompositeManager {
        &self.inner
    }
}
