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

//! Remote command execution over SSH, used to bring up child agents.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use tracing::debug;

use dropflow_common::constants::SSH_PORT;
use dropflow_common::error::{DfError, Result};

/// What a remotely executed command produced.
pub(crate) struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: u32,
}

struct BootstrapHandler;

#[async_trait]
impl client::Handler for BootstrapHandler {
    type Error = russh::Error;

    async fn check_server_key(
        self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<(Self, bool), Self::Error> {
        // Hosts in the managed cluster are trusted; user authentication is
        // still key-based and mandatory.
        Ok((self, true))
    }
}

/// Runs `command` on `host` over SSH with public-key authentication and
/// returns its output streams and exit status.
pub(crate) async fn exec_remote(
    host: &str,
    user: &str,
    pkey_path: Option<&Path>,
    command: &str,
) -> Result<ExecOutput> {
    let key = load_key(pkey_path)?;
    let config = Arc::new(client::Config::default());

    debug!(host, user, "opening SSH session");
    let mut session = client::connect(config, (host, SSH_PORT), BootstrapHandler)
        .await
        .map_err(|e| DfError::Transport {
            host: host.to_string(),
            source: e.into(),
        })?;

    let authenticated = session
        .authenticate_publickey(user, Arc::new(key))
        .await
        .map_err(|e| DfError::Transport {
            host: host.to_string(),
            source: e.into(),
        })?;
    if !authenticated {
        return Err(DfError::Internal(anyhow!(
            "public key authentication failed for {user}@{host}"
        )));
    }

    let mut channel = session
        .channel_open_session()
        .await
        .with_context(|| format!("opening an SSH channel to {host}"))?;
    channel
        .exec(true, command)
        .await
        .with_context(|| format!("executing a command on {host}"))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
            _ => {}
        }
    }
    let _ = session
        .disconnect(Disconnect::ByApplication, "", "en")
        .await;

    let status = status
        .ok_or_else(|| anyhow!("remote command on {host} finished without an exit status"))?;
    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        status,
    })
}

/// Loads the private key at `pkey_path`, or the first usable key from the
/// default locations when no explicit path is given.
fn load_key(pkey_path: Option<&Path>) -> Result<key::KeyPair> {
    let candidates: Vec<PathBuf> = match pkey_path {
        Some(path) => vec![path.to_path_buf()],
        None => {
            let home = std::env::var_os("HOME")
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("cannot locate a default SSH key without $HOME"))?;
            vec![home.join(".ssh/id_rsa"), home.join(".ssh/id_ed25519")]
        }
    };
    for path in &candidates {
        if path.exists() {
            return Ok(russh_keys::load_secret_key(path, None)
                .with_context(|| format!("loading SSH private key from {}", path.display()))?);
        }
    }
    Err(DfError::Internal(anyhow!(
        "no usable SSH private key found (tried {candidates:?})"
    )))
}
