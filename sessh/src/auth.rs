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

//! Keyboard-interactive responders and agent identities.

/// One prompt of a keyboard-interactive exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub prompt: String,
    /// Whether the user's answer may be echoed back while typing.
    pub echo: bool,
}

/// Answers the prompts of a keyboard-interactive authentication round.
///
/// The engine may call `respond` several times, once per info request the
/// server sends. The returned vector must contain exactly one answer per
/// prompt, in order; extra answers are ignored and missing answers are
/// treated as empty strings.
pub trait KeyboardInteractive: Send {
    fn respond(&mut self, username: &str, instructions: &str, prompts: &[Prompt]) -> Vec<String>;
}

/// Responder that answers every prompt with the same canned string.
/// Covers the common single-prompt password-over-kbdint server setup.
pub struct CannedResponder {
    answer: String,
}

impl CannedResponder {
    pub fn new(answer: impl Into<String>) -> Self {
        CannedResponder {
            answer: answer.into(),
        }
    }
}

impl KeyboardInteractive for CannedResponder {
    fn respond(&mut self, _username: &str, _instructions: &str, prompts: &[Prompt]) -> Vec<String> {
        prompts.iter().map(|_| self.answer.clone()).collect()
    }
}

/// A public key held by the authentication agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub blob: Vec<u8>,
    pub comment: String,
}
