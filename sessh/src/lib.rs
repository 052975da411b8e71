#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match, clippy::upper_case_acronyms)]
// Copyright 2024 the sessh contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Client-side SSH session, channel and SFTP lifecycle layer.
//!
//! This crate does not speak the SSH wire protocol. It implements everything
//! that sits *above* it: the object model of a client connection (a
//! [`Session`] owning [`Channel`]s, [`Listener`]s and [`sftp::Sftp`]
//! subsystems), authentication orchestration, flow-control bookkeeping,
//! ordered teardown, and one structured [`Error`] taxonomy. The protocol
//! itself is provided by an [`engine::Engine`] implementation handed to
//! [`Session::new`]; the crate ships a deterministic in-memory engine in
//! [`testkit`] for tests and demos.
//!
//! A minimal exec round-trip looks like this:
//!
//! ```
//! use sessh::engine::SocketDescriptor;
//! use sessh::testkit::MemoryEngine;
//! use sessh::Session;
//!
//! # async fn run() -> Result<(), sessh::Error> {
//! let engine = MemoryEngine::new();
//! engine.add_user("jane", "s3cret");
//! engine.script_exec("uname", b"Linux\n", b"", 0);
//!
//! let mut session = Session::new(Box::new(engine));
//! session.startup(SocketDescriptor::from_raw(7)).await?;
//! session.userauth_password("jane", "s3cret").await?;
//!
//! let mut channel = session.open_session().await?;
//! channel.execute("uname").await?;
//! let out = channel.read(1024).await?;
//! assert_eq!(&*out, b"Linux\n");
//! assert_eq!(channel.exit_status().await?, Some(0));
//! session.close(None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Every operation that talks to the engine is `async`; in blocking mode the
//! calling task is suspended until the engine finishes, in non-blocking mode
//! the engine's "would wait" signal surfaces as [`Error::WouldBlock`] and the
//! caller retries.

pub use russh_cryptovec::CryptoVec;

#[cfg(test)]
mod tests;

mod auth;
mod error;
mod negotiation;

pub mod engine;

mod channels;
mod listener;
mod session;

pub mod sftp;
pub mod testkit;

pub use auth::{AgentIdentity, CannedResponder, KeyboardInteractive, Prompt};
pub use channels::{Channel, DEFAULT_READ_SIZE, EXTENDED_DATA_STDERR};
pub use engine::{ChannelOpen, ScpFileStat, SocketDescriptor, WindowRead, WindowWrite, X11Open};
pub use error::{Error, SftpError, SftpStatus, TransportPhase};
pub use listener::Listener;
pub use negotiation::{HostKeyHashKind, MethodClass, NegotiatedMethods, TraceFlags};
pub use session::{Session, X11Handler};
