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

//! The composite drop manager.
//!
//! Drop managers form a hierarchy: node managers at the bottom actually host
//! drops, while the tiers above relay commands and aggregate results. This
//! crate implements the upper tiers generically — a [`CompositeManager`]
//! holds a set of child managers, partitions incoming graphs among them,
//! fans lifecycle operations out to all of them and keeps their agents
//! alive, bootstrapping them over SSH when needed. [`DataIslandManager`] and
//! [`MasterManager`] are the two concrete profiles of that machinery.

mod agent;
mod composite;
mod partition;
mod ssh;

pub use agent::{AgentConnector, SshAgentConnector};
pub use composite::{CompositeManager, CompositeOptions, DataIslandManager, MasterManager};
