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

//! Method negotiation, host key digests and transport tracing.

use bitflags::bitflags;

/// One of the method classes negotiated during key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodClass {
    Kex,
    HostKey,
    CryptCs,
    CryptSc,
    MacCs,
    MacSc,
    CompCs,
    CompSc,
    LangCs,
    LangSc,
}

impl MethodClass {
    /// Conventional short name, with the `_CS`/`_SC` direction suffix
    /// (client-to-server, server-to-client).
    pub fn as_str(self) -> &'static str {
        match self {
            MethodClass::Kex => "KEX",
            MethodClass::HostKey => "HOSTKEY",
            MethodClass::CryptCs => "CRYPT_CS",
            MethodClass::CryptSc => "CRYPT_SC",
            MethodClass::MacCs => "MAC_CS",
            MethodClass::MacSc => "MAC_SC",
            MethodClass::CompCs => "COMP_CS",
            MethodClass::CompSc => "COMP_SC",
            MethodClass::LangCs => "LANG_CS",
            MethodClass::LangSc => "LANG_SC",
        }
    }
}

impl std::fmt::Display for MethodClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The methods both sides agreed on, one per class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedMethods {
    pub kex: String,
    pub hostkey: String,
    pub crypt_cs: String,
    pub crypt_sc: String,
    pub mac_cs: String,
    pub mac_sc: String,
    pub comp_cs: String,
    pub comp_sc: String,
    pub lang_cs: String,
    pub lang_sc: String,
}

impl NegotiatedMethods {
    pub fn get(&self, class: MethodClass) -> &str {
        match class {
            MethodClass::Kex => &self.kex,
            MethodClass::HostKey => &self.hostkey,
            MethodClass::CryptCs => &self.crypt_cs,
            MethodClass::CryptSc => &self.crypt_sc,
            MethodClass::MacCs => &self.mac_cs,
            MethodClass::MacSc => &self.mac_sc,
            MethodClass::CompCs => &self.comp_cs,
            MethodClass::CompSc => &self.comp_sc,
            MethodClass::LangCs => &self.lang_cs,
            MethodClass::LangSc => &self.lang_sc,
        }
    }
}

/// Digest algorithm for the server host key fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKeyHashKind {
    Md5,
    Sha1,
}

impl HostKeyHashKind {
    pub fn digest_len(self) -> usize {
        match self {
            HostKeyHashKind::Md5 => 16,
            HostKeyHashKind::Sha1 => 20,
        }
    }
}

bitflags! {
    /// Subsystems an engine may emit wire-level traces for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TraceFlags: u32 {
        const TRANS = 1 << 1;
        const KEX = 1 << 2;
        const AUTH = 1 << 3;
        const CONN = 1 << 4;
        const SCP = 1 << 5;
        const SFTP = 1 << 6;
        const ERROR = 1 << 7;
        const PUBLICKEY = 1 << 8;
        const SOCKET = 1 << 9;
    }
}
