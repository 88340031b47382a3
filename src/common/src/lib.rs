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

//! Types and helpers shared by every dropflow crate: the drop data model,
//! physical-graph utilities, the common error type, well-known constants and
//! small network helpers.

pub mod constants;
pub mod drop;
pub mod error;
pub mod graph;
pub mod util;
