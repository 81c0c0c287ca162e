//    Copyright 2021 Red Hat, Inc.
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

pub mod collaborators;
pub mod config;
pub mod error;
pub mod fan;
pub mod firewall;
pub mod forward;
pub mod lease;
pub mod lifecycle;
pub mod lock;
pub mod logging;
pub mod mac;
pub mod reconciler;
pub mod resolver;
pub mod types;

pub use crate::error::{ErrorKind, NetbridgeError, Result};
pub use crate::logging::{LogEntry, LogLevel};
