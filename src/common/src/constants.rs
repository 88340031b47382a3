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

//! Well-known ports and executable names for the manager hierarchy.

/// Port at which node managers expose their REST interface.
pub const NODE_DEFAULT_REST_PORT: u16 = 8000;

/// Port at which data island managers expose their REST interface.
pub const ISLAND_DEFAULT_REST_PORT: u16 = 8001;

/// Port at which the master manager exposes its REST interface.
pub const MASTER_DEFAULT_REST_PORT: u16 = 8002;

/// Executable that starts a node manager on a remote host.
pub const NODE_MANAGER_EXEC: &str = "dropflow-nm";

/// Executable that starts a data island manager on a remote host.
pub const ISLAND_MANAGER_EXEC: &str = "dropflow-dim";

/// Port used when reaching a remote host over SSH to start a manager.
pub const SSH_PORT: u16 = 22;
