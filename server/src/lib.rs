// Copyright 2022 Ryan Seipp
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

#![deny(missing_docs, missing_debug_implementations, rust_2018_idioms, unused_imports)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! rask is a low-level static-file HTTP/1.1 server: a cross-platform
//! readiness-notification poller, a listener/worker pipeline, and a
//! non-blocking transport layer with TLS and sendfile support.
//!
//! ## Examples
//!
//! See `examples/example.rs` for a minimal embedding of the library
//! outside of the `raskd` binary.

pub mod collections;
pub mod config;
pub mod error;
pub mod http;
pub mod job;
pub mod listener;
pub mod manager;
pub mod poller;
pub mod pool;
pub mod supervisor;
pub mod transport;
pub mod worker;
