//! A deterministic in-memory engine for tests, examples and offline use.
//!
//! [`MemoryEngine`] implements the whole [`Engine`](crate::engine::Engine)
//! surface against scripted state: users and their credentials, canned
//! command output, an in-memory remote filesystem shared by SFTP and SCP,
//! and toggles for the failure paths. Cloning the engine clones a handle
//! to the same state, so a test can keep a clone for inspection after
//! handing the engine to a session.
//!
//! Waiting is modelled, not performed: a call that would block forever
//! (reading a channel nothing will ever write to, for instance) fails with
//! a timeout instead of hanging the test suite.

mod fs;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::{debug, trace};
use sha1::{Digest, Sha1};

use crate::auth::{AgentIdentity, KeyboardInteractive, Prompt};
use crate::engine::{
    AuthEngine, ChannelEngine, ChannelId, ChannelOpen, EngineError, EngineErrorKind, EngineResult,
    ListenerId, ScpFileStat, SftpEngine, SftpHandleId, SftpId, SocketDescriptor, TransportEngine,
    WindowRead, WindowWrite, X11Open,
};
use crate::error::SftpStatus;
use crate::negotiation::{HostKeyHashKind, MethodClass, NegotiatedMethods, TraceFlags};
use crate::sftp::attrs::{FileAttributes, SetStat};
use crate::sftp::OpenFlags;
use crate::CryptoVec;

use fs::MemFs;

/// One teardown action the engine observed, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownEvent {
    SftpShutdown(SftpId),
    ChannelClose(ChannelId),
    ListenerCancel(ListenerId),
    CloseHandle(SftpId, SftpHandleId),
    Disconnect(String),
}

#[derive(Clone)]
struct ScriptedExec {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit: u32,
}

#[derive(Debug)]
enum ChannelKind {
    Session,
    DirectTcpip,
    Forwarded,
    ScpRecv,
    ScpSend {
        path: String,
        mode: u32,
        size: u64,
        times: Option<(u64, u64)>,
        finalized: bool,
    },
    X11,
}

struct ChannelRec {
    kind: ChannelKind,
    stdout: VecDeque<u8>,
    pending: VecDeque<u8>,
    stderr: VecDeque<u8>,
    written: Vec<u8>,
    env: HashMap<String, String>,
    pty: Option<String>,
    echo: bool,
    exec_done: bool,
    peer_eof: bool,
    sent_eof: bool,
    closed: bool,
    exit_status: Option<u32>,
    blocking: Option<bool>,
    send_window: u32,
    recv_window: u32,
    initial_send: u32,
    initial_recv: u32,
    max_packet: u32,
}

enum HandleRec {
    File {
        key: String,
        flags: OpenFlags,
        offset: u64,
    },
    Dir {
        entries: VecDeque<(String, FileAttributes)>,
    },
}

struct SftpRec {
    last_status: Option<u32>,
    handles: HashMap<SftpHandleId, HandleRec>,
}

struct ListenerRec {
    port: u16,
    queue_max: u32,
    queue: VecDeque<Vec<u8>>,
}

struct EngineState {
    connected: bool,
    banner: Option<String>,
    disconnect_reason: Option<String>,
    blocking: bool,
    trace_flags: TraceFlags,
    accept_x11: bool,
    x11_queue: VecDeque<X11Open>,
    negotiated: Option<NegotiatedMethods>,
    method_prefs: HashMap<MethodClass, String>,
    host_key: Vec<u8>,
    last_error: Option<EngineError>,
    users: HashMap<String, String>,
    expired: HashSet<String>,
    pubkey_users: HashSet<String>,
    hostbased_users: HashSet<String>,
    kbd: HashMap<String, String>,
    auth_methods: String,
    deny_auth_list: bool,
    authenticated: bool,
    agent: Vec<AgentIdentity>,
    agent_accepted: HashSet<String>,
    agent_connected: bool,
    scripts: HashMap<String, ScriptedExec>,
    echo_mode: bool,
    channels: HashMap<ChannelId, ChannelRec>,
    finished: HashMap<ChannelId, ChannelRec>,
    next_channel: u32,
    listeners: HashMap<ListenerId, ListenerRec>,
    next_listener: u32,
    ephemeral_offset: u16,
    deny_forward: bool,
    sftps: HashMap<SftpId, SftpRec>,
    next_sftp: u32,
    next_handle: u32,
    default_window: u32,
    default_max_packet: u32,
    fs: MemFs,
    teardown: Vec<TeardownEvent>,
}

impl EngineState {
    fn new() -> Self {
        EngineState {
            connected: false,
            banner: None,
            disconnect_reason: None,
            blocking: true,
            trace_flags: TraceFlags::empty(),
            accept_x11: false,
            x11_queue: VecDeque::new(),
            negotiated: None,
            method_prefs: HashMap::new(),
            host_key: b"ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIMemTestKey".to_vec(),
            last_error: None,
            users: HashMap::new(),
            expired: HashSet::new(),
            pubkey_users: HashSet::new(),
            hostbased_users: HashSet::new(),
            kbd: HashMap::new(),
            auth_methods: "publickey,password,keyboard-interactive".to_string(),
            deny_auth_list: false,
            authenticated: false,
            agent: Vec::new(),
            agent_accepted: HashSet::new(),
            agent_connected: false,
            scripts: HashMap::new(),
            echo_mode: false,
            channels: HashMap::new(),
            finished: HashMap::new(),
            next_channel: 1,
            listeners: HashMap::new(),
            next_listener: 1,
            ephemeral_offset: 0,
            deny_forward: false,
            sftps: HashMap::new(),
            next_sftp: 1,
            next_handle: 1,
            default_window: 2 * 1024 * 1024,
            default_max_packet: 32768,
            fs: MemFs::new(),
            teardown: Vec::new(),
        }
    }
}

/// Record a failure with full detail, return it with none.
///
/// The detail is only available through `last_error`, which is exactly
/// how the session layer's message enrichment expects engines to behave.
fn fail(state: &mut EngineState, kind: EngineErrorKind, message: impl Into<String>) -> EngineError {
    let message = message.into();
    trace!("memory engine: failing with {:?}: {}", kind, message);
    state.last_error = Some(EngineError::new(kind, message));
    EngineError::bare(kind)
}

/// Fail a call that would wait forever. In blocking mode this is a
/// usage error (no producer exists in a scripted engine), reported as a
/// timeout; in non-blocking mode it is the usual would-block signal.
fn stalled(state: &mut EngineState, channel: Option<ChannelId>, what: &str) -> EngineError {
    let blocking = channel
        .and_then(|id| state.channels.get(&id).and_then(|rec| rec.blocking))
        .unwrap_or(state.blocking);
    if blocking {
        fail(
            state,
            EngineErrorKind::Timeout,
            format!("{what} would wait forever"),
        )
    } else {
        fail(state, EngineErrorKind::Eagain, format!("{what} would block"))
    }
}

fn supported(class: MethodClass) -> &'static [&'static str] {
    match class {
        MethodClass::Kex => &[
            "curve25519-sha256",
            "ecdh-sha2-nistp256",
            "diffie-hellman-group14-sha256",
        ],
        MethodClass::HostKey => &["ssh-ed25519", "rsa-sha2-256", "ecdsa-sha2-nistp256"],
        MethodClass::CryptCs | MethodClass::CryptSc => {
            &["aes256-ctr", "aes128-ctr", "chacha20-poly1305@openssh.com"]
        }
        MethodClass::MacCs | MethodClass::MacSc => &["hmac-sha2-256", "hmac-sha2-512"],
        MethodClass::CompCs | MethodClass::CompSc => &["none", "zlib@openssh.com"],
        MethodClass::LangCs | MethodClass::LangSc => &[""],
    }
}

fn choose(state: &EngineState, class: MethodClass) -> String {
    if let Some(prefs) = state.method_prefs.get(&class) {
        for cand in prefs.split(',') {
            if supported(class).contains(&cand) {
                return cand.to_string();
            }
        }
    }
    supported(class).first().copied().unwrap_or("").to_string()
}

fn open_channel(state: &mut EngineState, kind: ChannelKind) -> ChannelOpen {
    let id = ChannelId::new(state.next_channel);
    state.next_channel += 1;
    let open = ChannelOpen {
        id,
        send_window: state.default_window,
        recv_window: state.default_window,
        max_packet: state.default_max_packet,
    };
    let echo =
        state.echo_mode && matches!(kind, ChannelKind::DirectTcpip | ChannelKind::Forwarded);
    trace!("memory engine: opened channel {} ({:?})", id, kind);
    state.channels.insert(
        id,
        ChannelRec {
            kind,
            stdout: VecDeque::new(),
            pending: VecDeque::new(),
            stderr: VecDeque::new(),
            written: Vec::new(),
            env: HashMap::new(),
            pty: None,
            echo,
            exec_done: false,
            peer_eof: false,
            sent_eof: false,
            closed: false,
            exit_status: None,
            blocking: None,
            send_window: open.send_window,
            recv_window: open.recv_window,
            initial_send: open.send_window,
            initial_recv: open.recv_window,
            max_packet: open.max_packet,
        },
    );
    open
}

fn chan<'a>(
    state: &'a mut EngineState,
    id: ChannelId,
) -> Result<&'a mut ChannelRec, EngineError> {
    let gone = match state.channels.get(&id) {
        None => true,
        Some(rec) => rec.closed,
    };
    if gone {
        return Err(fail(
            state,
            EngineErrorKind::ChannelClosed,
            "the channel is not open",
        ));
    }
    match state.channels.get_mut(&id) {
        Some(rec) => Ok(rec),
        None => Err(EngineError::bare(EngineErrorKind::ChannelClosed)),
    }
}

/// Hand inbound stream 0 data to a channel. Only as much as the receive
/// window allows lands in the read buffer; the rest queues until reads
/// make room.
fn deliver_stdout(rec: &mut ChannelRec, data: impl IntoIterator<Item = u8>) {
    rec.pending.extend(data);
    refill_stdout(rec);
}

/// Top the read buffer up from the queued backlog. Buffered stream 0
/// data never exceeds the initial receive window.
fn refill_stdout(rec: &mut ChannelRec) {
    let room = (rec.initial_recv as usize).saturating_sub(rec.stdout.len());
    let n = room.min(rec.pending.len());
    for byte in rec.pending.drain(..n) {
        rec.stdout.push_back(byte);
    }
}

/// Commit data written to an SCP upload channel to the filesystem.
fn finalize_scp(state: &mut EngineState, id: ChannelId) {
    let pending = {
        let Some(rec) = state.channels.get_mut(&id) else {
            return;
        };
        let ChannelKind::ScpSend {
            path,
            mode,
            size,
            times,
            finalized,
        } = &mut rec.kind
        else {
            return;
        };
        if *finalized {
            return;
        }
        *finalized = true;
        let n = usize::try_from(*size).unwrap_or(usize::MAX).min(rec.written.len());
        let data = rec.written.get(..n).map(<[u8]>::to_vec).unwrap_or_default();
        let out = (path.clone(), *mode, *times, data);
        rec.exit_status = Some(0);
        out
    };
    let (path, mode, times, data) = pending;
    state.fs.add_file(&path, &data, mode);
    if let Some((atime, mtime)) = times {
        let _ = state.fs.setstat(&path, &SetStat::new().times(atime, mtime));
    }
}

fn sftp_rec(state: &mut EngineState, sftp: SftpId) -> Result<(), EngineError> {
    if state.sftps.contains_key(&sftp) {
        Ok(())
    } else {
        Err(fail(
            state,
            EngineErrorKind::BadUse,
            "the sftp subsystem is not open",
        ))
    }
}

/// Record an SFTP protocol failure: the status code lands in the
/// subsystem's last-status slot, the error itself is bare.
fn sftp_fail(state: &mut EngineState, sftp: SftpId, code: u32) -> EngineError {
    if let Some(rec) = state.sftps.get_mut(&sftp) {
        rec.last_status = Some(code);
    }
    state.last_error = Some(EngineError::new(
        EngineErrorKind::SftpProtocol,
        format!("sftp request failed with status {code}"),
    ));
    EngineError::bare(EngineErrorKind::SftpProtocol)
}

fn file_handle(
    state: &mut EngineState,
    sftp: SftpId,
    handle: SftpHandleId,
) -> Result<(String, OpenFlags, u64), EngineError> {
    let found = state
        .sftps
        .get(&sftp)
        .and_then(|rec| rec.handles.get(&handle))
        .and_then(|h| match h {
            HandleRec::File { key, flags, offset } => Some((key.clone(), *flags, *offset)),
            HandleRec::Dir { .. } => None,
        });
    match found {
        Some(parts) => Ok(parts),
        None => Err(sftp_fail(state, sftp, SftpStatus::InvalidHandle.code())),
    }
}

fn set_offset(state: &mut EngineState, sftp: SftpId, handle: SftpHandleId, value: u64) {
    if let Some(HandleRec::File { offset, .. }) = state
        .sftps
        .get_mut(&sftp)
        .and_then(|rec| rec.handles.get_mut(&handle))
    {
        *offset = value;
    }
}

/// The in-memory engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryEngine {
    state: Arc<Mutex<EngineState>>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        MemoryEngine {
            state: Arc::new(Mutex::new(EngineState::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a user for password authentication.
    pub fn add_user(&self, username: &str, password: &str) {
        self.lock()
            .users
            .insert(username.to_string(), password.to_string());
    }

    /// Make password authentication for this user fail with the
    /// password-expired outcome even when the password is right.
    pub fn expire_password(&self, username: &str) {
        self.lock().expired.insert(username.to_string());
    }

    /// Accept any public key offered for this user.
    pub fn allow_publickey(&self, username: &str) {
        self.lock().pubkey_users.insert(username.to_string());
    }

    /// Accept host-based authentication for this user.
    pub fn allow_hostbased(&self, username: &str) {
        self.lock().hostbased_users.insert(username.to_string());
    }

    /// Configure keyboard-interactive for this user: one password prompt
    /// whose answer must equal `answer`.
    pub fn set_kbd(&self, username: &str, answer: &str) {
        self.lock()
            .kbd
            .insert(username.to_string(), answer.to_string());
    }

    /// Add an identity to the in-process agent.
    pub fn add_agent_identity(&self, comment: &str, blob: &[u8]) {
        self.lock().agent.push(AgentIdentity {
            blob: blob.to_vec(),
            comment: comment.to_string(),
        });
    }

    /// Mark an agent identity (by comment) as acceptable to the server.
    pub fn accept_agent_identity(&self, comment: &str) {
        self.lock().agent_accepted.insert(comment.to_string());
    }

    /// What `userauth_list` reports.
    pub fn set_auth_methods(&self, methods: &str) {
        self.lock().auth_methods = methods.to_string();
    }

    /// Make `userauth_list` fail.
    pub fn deny_auth_list(&self) {
        self.lock().deny_auth_list = true;
    }

    pub fn set_host_key(&self, key: &[u8]) {
        self.lock().host_key = key.to_vec();
    }

    /// Script the outcome of executing `command`.
    pub fn script_exec(&self, command: &str, stdout: &[u8], stderr: &[u8], exit: u32) {
        self.lock().scripts.insert(
            command.to_string(),
            ScriptedExec {
                stdout: stdout.to_vec(),
                stderr: stderr.to_vec(),
                exit,
            },
        );
    }

    /// Make tcpip channels (and shells) echo written data back on stdout,
    /// with the send window replenished as data is consumed.
    pub fn enable_echo(&self) {
        self.lock().echo_mode = true;
    }

    /// Initial window size for channels opened after this call.
    pub fn set_channel_window(&self, window: u32) {
        self.lock().default_window = window;
    }

    /// Maximum packet size for channels opened after this call.
    pub fn set_max_packet(&self, max_packet: u32) {
        self.lock().default_max_packet = max_packet;
    }

    /// Deny future remote forward requests.
    pub fn deny_forward(&self) {
        self.lock().deny_forward = true;
    }

    /// Create a file on the remote filesystem, parents included.
    pub fn add_file(&self, path: &str, data: &[u8], mode: u32) {
        self.lock().fs.add_file(path, data, mode);
    }

    pub fn add_dir(&self, path: &str) {
        self.lock().fs.add_dir(path);
    }

    pub fn add_symlink(&self, target: &str, link: &str) {
        self.lock().fs.add_symlink(target, link);
    }

    /// Queue an inbound connection on a forwarded port. Returns false
    /// when no listener is bound there or its backlog is full.
    pub fn push_forward_connection(&self, port: u16, data: &[u8]) -> bool {
        let mut state = self.lock();
        let Some(rec) = state.listeners.values_mut().find(|rec| rec.port == port) else {
            return false;
        };
        if rec.queue.len() >= rec.queue_max as usize {
            return false;
        }
        rec.queue.push_back(data.to_vec());
        true
    }

    /// Open an inbound X11 channel carrying `data`. Returns false while
    /// the session is not accepting X11 opens.
    pub fn push_x11_open(&self, originator_host: &str, originator_port: u16, data: &[u8]) -> bool {
        let mut state = self.lock();
        if !state.accept_x11 {
            return false;
        }
        let open = open_channel(&mut state, ChannelKind::X11);
        if let Some(rec) = state.channels.get_mut(&open.id) {
            deliver_stdout(rec, data.iter().copied());
            rec.peer_eof = true;
        }
        state.x11_queue.push_back(X11Open {
            open,
            originator_host: originator_host.to_string(),
            originator_port,
        });
        true
    }

    /// Contents of a remote file, for asserting on uploads.
    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().fs.file_contents(path)
    }

    /// The reason string of the disconnect, once one happened.
    pub fn disconnect_reason(&self) -> Option<String> {
        self.lock().disconnect_reason.clone()
    }

    /// Every teardown action seen so far, in order.
    pub fn teardown_log(&self) -> Vec<TeardownEvent> {
        self.lock().teardown.clone()
    }

    /// The banner the client asked to present.
    pub fn client_banner(&self) -> Option<String> {
        self.lock().banner.clone()
    }

    pub fn trace_flags(&self) -> TraceFlags {
        self.lock().trace_flags
    }

    /// Everything written to a channel, kept past its close.
    pub fn channel_written(&self, id: ChannelId) -> Option<Vec<u8>> {
        let state = self.lock();
        state
            .channels
            .get(&id)
            .or_else(|| state.finished.get(&id))
            .map(|rec| rec.written.clone())
    }

    pub fn channel_env(&self, id: ChannelId, name: &str) -> Option<String> {
        let state = self.lock();
        state
            .channels
            .get(&id)
            .or_else(|| state.finished.get(&id))
            .and_then(|rec| rec.env.get(name).cloned())
    }

    pub fn channel_has_pty(&self, id: ChannelId) -> bool {
        let state = self.lock();
        state
            .channels
            .get(&id)
            .or_else(|| state.finished.get(&id))
            .map(|rec| rec.pty.is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl TransportEngine for MemoryEngine {
    async fn handshake(&mut self, socket: SocketDescriptor) -> EngineResult<()> {
        let mut state = self.lock();
        if state.connected {
            return Err(fail(
                &mut state,
                EngineErrorKind::BadUse,
                "handshake on a connected transport",
            ));
        }
        let negotiated = NegotiatedMethods {
            kex: choose(&state, MethodClass::Kex),
            hostkey: choose(&state, MethodClass::HostKey),
            crypt_cs: choose(&state, MethodClass::CryptCs),
            crypt_sc: choose(&state, MethodClass::CryptSc),
            mac_cs: choose(&state, MethodClass::MacCs),
            mac_sc: choose(&state, MethodClass::MacSc),
            comp_cs: choose(&state, MethodClass::CompCs),
            comp_sc: choose(&state, MethodClass::CompSc),
            lang_cs: choose(&state, MethodClass::LangCs),
            lang_sc: choose(&state, MethodClass::LangSc),
        };
        state.negotiated = Some(negotiated);
        state.connected = true;
        debug!("memory engine: handshake complete on {}", socket);
        Ok(())
    }

    async fn disconnect(&mut self, reason: &str) -> EngineResult<()> {
        let mut state = self.lock();
        state.connected = false;
        state.disconnect_reason = Some(reason.to_string());
        state
            .teardown
            .push(TeardownEvent::Disconnect(reason.to_string()));
        debug!("memory engine: disconnected ({})", reason);
        Ok(())
    }

    fn set_banner(&mut self, banner: &str) -> EngineResult<()> {
        self.lock().banner = Some(banner.to_string());
        Ok(())
    }

    fn method_pref(&mut self, class: MethodClass, prefs: &str) -> EngineResult<()> {
        let mut state = self.lock();
        if state.connected {
            return Err(fail(
                &mut state,
                EngineErrorKind::BadUse,
                "method preferences after the handshake",
            ));
        }
        if !prefs.split(',').any(|p| supported(class).contains(&p)) {
            return Err(fail(
                &mut state,
                EngineErrorKind::MethodNotSupported,
                format!("no supported {class} method in {prefs:?}"),
            ));
        }
        state.method_prefs.insert(class, prefs.to_string());
        Ok(())
    }

    fn methods(&self) -> Option<NegotiatedMethods> {
        self.lock().negotiated.clone()
    }

    fn hostkey_hash(&self, kind: HostKeyHashKind) -> Option<Vec<u8>> {
        let state = self.lock();
        if !state.connected {
            return None;
        }
        Some(match kind {
            HostKeyHashKind::Md5 => md5::compute(&state.host_key).0.to_vec(),
            HostKeyHashKind::Sha1 => Sha1::digest(&state.host_key).to_vec(),
        })
    }

    fn last_error(&self) -> Option<EngineError> {
        self.lock().last_error.clone()
    }

    fn set_blocking(&mut self, blocking: bool) {
        self.lock().blocking = blocking;
    }

    fn trace(&mut self, bitmask: TraceFlags) {
        self.lock().trace_flags = bitmask;
    }

    fn set_accept_x11(&mut self, accept: bool) {
        self.lock().accept_x11 = accept;
    }

    fn take_x11_open(&mut self) -> Option<X11Open> {
        self.lock().x11_queue.pop_front()
    }
}

#[async_trait]
impl AuthEngine for MemoryEngine {
    async fn auth_password(&mut self, username: &str, password: &str) -> EngineResult<()> {
        let mut state = self.lock();
        let ok = state.users.get(username).map(String::as_str) == Some(password);
        if ok && state.expired.contains(username) {
            return Err(fail(
                &mut state,
                EngineErrorKind::PasswordExpired,
                format!("password for {username} has expired"),
            ));
        }
        if ok {
            state.authenticated = true;
            Ok(())
        } else {
            Err(fail(
                &mut state,
                EngineErrorKind::AuthenticationFailed,
                format!("authentication failed for {username}"),
            ))
        }
    }

    async fn auth_publickey_fromfile(
        &mut self,
        username: &str,
        _publickey: Option<&Path>,
        _privatekey: &Path,
        _passphrase: Option<&str>,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        if state.pubkey_users.contains(username) {
            state.authenticated = true;
            Ok(())
        } else {
            Err(fail(
                &mut state,
                EngineErrorKind::PublickeyUnverified,
                format!("the public key for {username} was not accepted"),
            ))
        }
    }

    async fn auth_hostbased_fromfile(
        &mut self,
        username: &str,
        _publickey: &Path,
        _privatekey: &Path,
        _passphrase: Option<&str>,
        _hostname: &str,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        if state.hostbased_users.contains(username) {
            state.authenticated = true;
            Ok(())
        } else {
            Err(fail(
                &mut state,
                EngineErrorKind::AuthenticationFailed,
                format!("host-based authentication failed for {username}"),
            ))
        }
    }

    async fn auth_keyboard_interactive(
        &mut self,
        username: &str,
        responder: &mut (dyn KeyboardInteractive + Send),
    ) -> EngineResult<()> {
        let expected = self.lock().kbd.get(username).cloned();
        let Some(expected) = expected else {
            let mut state = self.lock();
            return Err(fail(
                &mut state,
                EngineErrorKind::AuthenticationFailed,
                format!("keyboard-interactive is not configured for {username}"),
            ));
        };
        let prompts = vec![Prompt {
            prompt: "Password: ".to_string(),
            echo: false,
        }];
        let answers = responder.respond(username, "", &prompts);
        let mut state = self.lock();
        if answers.first().map(String::as_str) == Some(expected.as_str()) {
            state.authenticated = true;
            Ok(())
        } else {
            Err(fail(
                &mut state,
                EngineErrorKind::AuthenticationFailed,
                format!("keyboard-interactive authentication failed for {username}"),
            ))
        }
    }

    fn authenticated(&self) -> bool {
        self.lock().authenticated
    }

    async fn auth_list(&mut self, username: &str) -> EngineResult<String> {
        let mut state = self.lock();
        if state.deny_auth_list {
            return Err(fail(
                &mut state,
                EngineErrorKind::AuthenticationFailed,
                format!("the server refused to list methods for {username}"),
            ));
        }
        Ok(state.auth_methods.clone())
    }

    async fn agent_connect(&mut self) -> EngineResult<()> {
        self.lock().agent_connected = true;
        Ok(())
    }

    async fn agent_identities(&mut self) -> EngineResult<Vec<AgentIdentity>> {
        let mut state = self.lock();
        if !state.agent_connected {
            return Err(fail(
                &mut state,
                EngineErrorKind::AgentProtocol,
                "the agent is not connected",
            ));
        }
        Ok(state.agent.clone())
    }

    async fn agent_auth(&mut self, _username: &str, identity: &AgentIdentity) -> EngineResult<()> {
        let mut state = self.lock();
        if state.agent_accepted.contains(&identity.comment) {
            state.authenticated = true;
            Ok(())
        } else {
            Err(fail(
                &mut state,
                EngineErrorKind::AuthenticationFailed,
                format!("agent identity {:?} refused", identity.comment),
            ))
        }
    }

    async fn agent_disconnect(&mut self) {
        self.lock().agent_connected = false;
    }
}

#[async_trait]
impl ChannelEngine for MemoryEngine {
    async fn channel_open_session(&mut self) -> EngineResult<ChannelOpen> {
        let mut state = self.lock();
        if !state.connected {
            return Err(fail(
                &mut state,
                EngineErrorKind::SocketDisconnect,
                "the transport is not connected",
            ));
        }
        Ok(open_channel(&mut state, ChannelKind::Session))
    }

    async fn channel_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        _shost: &str,
        _sport: u16,
    ) -> EngineResult<ChannelOpen> {
        let mut state = self.lock();
        if !state.connected {
            return Err(fail(
                &mut state,
                EngineErrorKind::SocketDisconnect,
                "the transport is not connected",
            ));
        }
        trace!("memory engine: direct-tcpip to {}:{}", host, port);
        Ok(open_channel(&mut state, ChannelKind::DirectTcpip))
    }

    async fn forward_listen(
        &mut self,
        host: &str,
        port: u16,
        queue_max: u32,
    ) -> EngineResult<(ListenerId, u16)> {
        let mut state = self.lock();
        if state.deny_forward {
            return Err(fail(
                &mut state,
                EngineErrorKind::RequestDenied,
                "forward request denied by the server",
            ));
        }
        let id = ListenerId::new(state.next_listener);
        state.next_listener += 1;
        let bound = if port == 0 {
            let bound = 49152 + state.ephemeral_offset;
            state.ephemeral_offset += 1;
            bound
        } else {
            port
        };
        debug!("memory engine: listening on {}:{}", host, bound);
        state.listeners.insert(
            id,
            ListenerRec {
                port: bound,
                queue_max,
                queue: VecDeque::new(),
            },
        );
        Ok((id, bound))
    }

    async fn forward_accept(&mut self, listener: ListenerId) -> EngineResult<ChannelOpen> {
        let mut state = self.lock();
        if !state.listeners.contains_key(&listener) {
            return Err(fail(
                &mut state,
                EngineErrorKind::RequestDenied,
                "the listener is not active",
            ));
        }
        let next = state
            .listeners
            .get_mut(&listener)
            .and_then(|rec| rec.queue.pop_front());
        match next {
            Some(data) => {
                let open = open_channel(&mut state, ChannelKind::Forwarded);
                if let Some(rec) = state.channels.get_mut(&open.id) {
                    deliver_stdout(rec, data.into_iter());
                    rec.peer_eof = true;
                }
                Ok(open)
            }
            None => Err(stalled(&mut state, None, "accepting a forwarded connection")),
        }
    }

    async fn forward_cancel(&mut self, listener: ListenerId) -> EngineResult<()> {
        let mut state = self.lock();
        if state.listeners.remove(&listener).is_some() {
            state.teardown.push(TeardownEvent::ListenerCancel(listener));
        }
        Ok(())
    }

    async fn scp_recv(&mut self, path: &str) -> EngineResult<(ChannelOpen, ScpFileStat)> {
        let mut state = self.lock();
        if !state.connected {
            return Err(fail(
                &mut state,
                EngineErrorKind::SocketDisconnect,
                "the transport is not connected",
            ));
        }
        let attrs = match state.fs.stat(path, true) {
            Ok(attrs) if attrs.is_file() => attrs,
            Ok(_) => {
                return Err(fail(
                    &mut state,
                    EngineErrorKind::ScpProtocol,
                    format!("scp: {path}: not a regular file"),
                ))
            }
            Err(_) => {
                return Err(fail(
                    &mut state,
                    EngineErrorKind::ScpProtocol,
                    format!("scp: {path}: no such file or directory"),
                ))
            }
        };
        let contents = state.fs.file_contents(path).unwrap_or_default();
        let open = open_channel(&mut state, ChannelKind::ScpRecv);
        if let Some(rec) = state.channels.get_mut(&open.id) {
            deliver_stdout(rec, contents.into_iter());
            rec.peer_eof = true;
            rec.exit_status = Some(0);
        }
        let stat = ScpFileStat {
            size: attrs.size,
            uid: attrs.uid,
            gid: attrs.gid,
            mode: attrs.permissions,
            atime: attrs.atime,
            mtime: attrs.mtime,
        };
        Ok((open, stat))
    }

    async fn scp_send(
        &mut self,
        path: &str,
        mode: u32,
        size: u64,
        times: Option<(u64, u64)>,
    ) -> EngineResult<ChannelOpen> {
        let mut state = self.lock();
        if !state.connected {
            return Err(fail(
                &mut state,
                EngineErrorKind::SocketDisconnect,
                "the transport is not connected",
            ));
        }
        let target = fs::normalize(path);
        let parent = fs::parent_of(&target);
        let parent_ok = matches!(state.fs.stat(&parent, true), Ok(attrs) if attrs.is_dir());
        if !parent_ok {
            return Err(fail(
                &mut state,
                EngineErrorKind::ScpProtocol,
                format!("scp: {parent}: no such directory"),
            ));
        }
        let open = open_channel(
            &mut state,
            ChannelKind::ScpSend {
                path: target,
                mode,
                size,
                times,
                finalized: false,
            },
        );
        if let Some(rec) = state.channels.get_mut(&open.id) {
            rec.peer_eof = true;
        }
        Ok(open)
    }

    async fn request_pty(
        &mut self,
        id: ChannelId,
        term: &str,
        _modes: &[u8],
        _width: u32,
        _height: u32,
        _width_px: u32,
        _height_px: u32,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let rec = chan(&mut state, id)?;
        rec.pty = Some(term.to_string());
        Ok(())
    }

    async fn pty_resize(
        &mut self,
        id: ChannelId,
        _width: u32,
        _height: u32,
        _width_px: u32,
        _height_px: u32,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let has_pty = chan(&mut state, id)?.pty.is_some();
        if has_pty {
            Ok(())
        } else {
            Err(fail(
                &mut state,
                EngineErrorKind::ChannelFailure,
                "no pty has been requested on this channel",
            ))
        }
    }

    async fn request_shell(&mut self, id: ChannelId) -> EngineResult<()> {
        let mut state = self.lock();
        let echo_mode = state.echo_mode;
        let (not_session, already) = {
            let rec = chan(&mut state, id)?;
            (!matches!(rec.kind, ChannelKind::Session), rec.exec_done)
        };
        if not_session {
            return Err(fail(
                &mut state,
                EngineErrorKind::ChannelFailure,
                "process requests need a session channel",
            ));
        }
        if already {
            return Err(fail(
                &mut state,
                EngineErrorKind::ChannelRequestDenied,
                "a process has already run on this channel",
            ));
        }
        if let Some(rec) = state.channels.get_mut(&id) {
            rec.exec_done = true;
            rec.echo = echo_mode;
        }
        Ok(())
    }

    async fn request_exec(&mut self, id: ChannelId, command: &str) -> EngineResult<()> {
        let mut state = self.lock();
        let (not_session, already) = {
            let rec = chan(&mut state, id)?;
            (!matches!(rec.kind, ChannelKind::Session), rec.exec_done)
        };
        if not_session {
            return Err(fail(
                &mut state,
                EngineErrorKind::ChannelFailure,
                "process requests need a session channel",
            ));
        }
        if already {
            return Err(fail(
                &mut state,
                EngineErrorKind::ChannelRequestDenied,
                "a process has already run on this channel",
            ));
        }
        let script = state.scripts.get(command).cloned();
        if let Some(rec) = state.channels.get_mut(&id) {
            rec.exec_done = true;
            rec.peer_eof = true;
            match script {
                Some(script) => {
                    deliver_stdout(rec, script.stdout.iter().copied());
                    rec.stderr.extend(script.stderr.iter().copied());
                    rec.exit_status = Some(script.exit);
                }
                None => {
                    rec.stderr
                        .extend(format!("{command}: command not found\n").into_bytes());
                    rec.exit_status = Some(127);
                }
            }
        }
        trace!("memory engine: exec {:?} on channel {}", command, id);
        Ok(())
    }

    async fn request_setenv(&mut self, id: ChannelId, name: &str, value: &str) -> EngineResult<()> {
        let mut state = self.lock();
        let rec = chan(&mut state, id)?;
        rec.env.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn request_x11(
        &mut self,
        id: ChannelId,
        _single_connection: bool,
        _auth_proto: Option<&str>,
        _auth_cookie: Option<&str>,
        _screen: u32,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        chan(&mut state, id)?;
        Ok(())
    }

    fn channel_set_blocking(&mut self, id: ChannelId, blocking: bool) {
        if let Some(rec) = self.lock().channels.get_mut(&id) {
            rec.blocking = Some(blocking);
        }
    }

    async fn channel_read(
        &mut self,
        id: ChannelId,
        stream: u32,
        max: usize,
    ) -> EngineResult<CryptoVec> {
        let mut state = self.lock();
        let (empty, at_eof) = {
            let rec = chan(&mut state, id)?;
            let buf = if stream == 0 { &rec.stdout } else { &rec.stderr };
            let at_eof = rec.peer_eof && (stream != 0 || rec.pending.is_empty());
            (buf.is_empty(), at_eof)
        };
        if empty {
            if at_eof {
                return Ok(CryptoVec::new());
            }
            return Err(stalled(&mut state, Some(id), "reading from the channel"));
        }
        let mut out = CryptoVec::new();
        if let Some(rec) = state.channels.get_mut(&id) {
            let buf = if stream == 0 {
                &mut rec.stdout
            } else {
                &mut rec.stderr
            };
            let n = buf.len().min(max);
            for byte in buf.drain(..n) {
                out.push(byte);
            }
            if stream == 0 {
                refill_stdout(rec);
            }
        }
        Ok(out)
    }

    async fn channel_write(&mut self, id: ChannelId, data: &[u8]) -> EngineResult<usize> {
        let mut state = self.lock();
        let (sent_eof, accept) = {
            let rec = chan(&mut state, id)?;
            let accept = if rec.echo {
                data.len()
            } else {
                (rec.send_window as usize).min(data.len())
            };
            (rec.sent_eof, accept)
        };
        if sent_eof {
            return Err(fail(
                &mut state,
                EngineErrorKind::ChannelEofSent,
                "EOF has already been sent on this channel",
            ));
        }
        if accept == 0 && !data.is_empty() {
            return Err(stalled(&mut state, Some(id), "writing to the channel"));
        }
        if let Some(rec) = state.channels.get_mut(&id) {
            let chunk = data.get(..accept).unwrap_or(data);
            rec.written.extend_from_slice(chunk);
            if rec.echo {
                deliver_stdout(rec, chunk.iter().copied());
            } else {
                rec.send_window = rec.send_window.saturating_sub(accept as u32);
            }
        }
        Ok(accept)
    }

    async fn channel_flush(&mut self, id: ChannelId) -> EngineResult<usize> {
        let mut state = self.lock();
        let rec = chan(&mut state, id)?;
        let n = rec.stdout.len() + rec.stderr.len();
        rec.stdout.clear();
        rec.stderr.clear();
        // Data held back by the window was never buffered; it arrives
        // after the flush.
        refill_stdout(rec);
        Ok(n)
    }

    fn channel_eof(&self, id: ChannelId) -> bool {
        let state = self.lock();
        state.channels.get(&id).map_or(true, |rec| {
            rec.peer_eof
                && rec.stdout.is_empty()
                && rec.pending.is_empty()
                && rec.stderr.is_empty()
        })
    }

    async fn channel_send_eof(&mut self, id: ChannelId) -> EngineResult<()> {
        let mut state = self.lock();
        let sent = {
            let rec = chan(&mut state, id)?;
            rec.sent_eof
        };
        if sent {
            return Err(fail(
                &mut state,
                EngineErrorKind::ChannelEofSent,
                "EOF has already been sent on this channel",
            ));
        }
        if let Some(rec) = state.channels.get_mut(&id) {
            rec.sent_eof = true;
        }
        finalize_scp(&mut state, id);
        Ok(())
    }

    async fn channel_wait_eof(&mut self, id: ChannelId) -> EngineResult<()> {
        let mut state = self.lock();
        let peer_eof = chan(&mut state, id)?.peer_eof;
        if peer_eof {
            Ok(())
        } else {
            Err(stalled(&mut state, Some(id), "waiting for channel EOF"))
        }
    }

    async fn channel_wait_closed(&mut self, id: ChannelId) -> EngineResult<()> {
        let mut state = self.lock();
        let peer_eof = chan(&mut state, id)?.peer_eof;
        if peer_eof {
            Ok(())
        } else {
            Err(stalled(&mut state, Some(id), "waiting for channel close"))
        }
    }

    fn channel_exit_status(&self, id: ChannelId) -> Option<u32> {
        let state = self.lock();
        state
            .channels
            .get(&id)
            .or_else(|| state.finished.get(&id))
            .and_then(|rec| rec.exit_status)
    }

    fn channel_window_read(&self, id: ChannelId) -> WindowRead {
        let state = self.lock();
        match state.channels.get(&id) {
            Some(rec) => {
                let buffered = rec.stdout.len() as u32;
                WindowRead {
                    remote_window: rec.recv_window.saturating_sub(buffered),
                    read_avail: buffered,
                    initial: rec.initial_recv,
                }
            }
            None => WindowRead {
                remote_window: 0,
                read_avail: 0,
                initial: 0,
            },
        }
    }

    fn channel_window_write(&self, id: ChannelId) -> WindowWrite {
        let state = self.lock();
        match state.channels.get(&id) {
            Some(rec) => WindowWrite {
                writable: rec.send_window,
                initial: rec.initial_send,
            },
            None => WindowWrite {
                writable: 0,
                initial: 0,
            },
        }
    }

    async fn channel_receive_window_adjust(
        &mut self,
        id: ChannelId,
        adjustment: u32,
        _force: bool,
    ) -> EngineResult<u32> {
        let mut state = self.lock();
        let rec = chan(&mut state, id)?;
        rec.recv_window = rec.recv_window.saturating_add(adjustment);
        Ok(rec.recv_window)
    }

    fn channel_poll_read(&self, id: ChannelId, extended: bool) -> bool {
        let state = self.lock();
        state.channels.get(&id).is_some_and(|rec| {
            if extended {
                !rec.stderr.is_empty()
            } else {
                !rec.stdout.is_empty()
            }
        })
    }

    async fn channel_close(&mut self, id: ChannelId) -> EngineResult<()> {
        let mut state = self.lock();
        finalize_scp(&mut state, id);
        let newly = match state.channels.get_mut(&id) {
            Some(rec) if !rec.closed => {
                rec.closed = true;
                true
            }
            _ => false,
        };
        if newly {
            state.teardown.push(TeardownEvent::ChannelClose(id));
        }
        Ok(())
    }

    fn channel_free(&mut self, id: ChannelId) {
        let mut state = self.lock();
        if let Some(rec) = state.channels.remove(&id) {
            state.finished.insert(id, rec);
        }
    }
}

#[async_trait]
impl SftpEngine for MemoryEngine {
    async fn sftp_init(&mut self) -> EngineResult<SftpId> {
        let mut state = self.lock();
        if !state.connected {
            return Err(fail(
                &mut state,
                EngineErrorKind::SocketDisconnect,
                "the transport is not connected",
            ));
        }
        let id = SftpId::new(state.next_sftp);
        state.next_sftp += 1;
        state.sftps.insert(
            id,
            SftpRec {
                last_status: None,
                handles: HashMap::new(),
            },
        );
        trace!("memory engine: sftp subsystem {} started", id);
        Ok(id)
    }

    async fn sftp_shutdown(&mut self, sftp: SftpId) -> EngineResult<()> {
        let mut state = self.lock();
        if state.sftps.remove(&sftp).is_some() {
            state.teardown.push(TeardownEvent::SftpShutdown(sftp));
        }
        Ok(())
    }

    async fn sftp_open(
        &mut self,
        sftp: SftpId,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> EngineResult<SftpHandleId> {
        let mut state = self.lock();
        sftp_rec(&mut state, sftp)?;
        let key = match state.fs.open(path, flags, mode) {
            Ok(key) => key,
            Err(code) => return Err(sftp_fail(&mut state, sftp, code)),
        };
        let handle = SftpHandleId::new(state.next_handle);
        state.next_handle += 1;
        if let Some(rec) = state.sftps.get_mut(&sftp) {
            rec.handles.insert(
                handle,
                HandleRec::File {
                    key,
                    flags,
                    offset: 0,
                },
            );
        }
        trace!("memory engine: sftp {} opened {:?} as {}", sftp, path, handle);
        Ok(handle)
    }

    async fn sftp_opendir(&mut self, sftp: SftpId, path: &str) -> EngineResult<SftpHandleId> {
        let mut state = self.lock();
        sftp_rec(&mut state, sftp)?;
        let entries = match state.fs.readdir_snapshot(path) {
            Ok(entries) => entries,
            Err(code) => return Err(sftp_fail(&mut state, sftp, code)),
        };
        let handle = SftpHandleId::new(state.next_handle);
        state.next_handle += 1;
        if let Some(rec) = state.sftps.get_mut(&sftp) {
            rec.handles.insert(
                handle,
                HandleRec::Dir {
                    entries: VecDeque::from(entries),
                },
            );
        }
        Ok(handle)
    }

    async fn sftp_close_handle(&mut self, sftp: SftpId, handle: SftpHandleId) -> EngineResult<()> {
        let mut state = self.lock();
        let removed = state
            .sftps
            .get_mut(&sftp)
            .map(|rec| rec.handles.remove(&handle).is_some())
            .unwrap_or(false);
        if removed {
            state.teardown.push(TeardownEvent::CloseHandle(sftp, handle));
        }
        Ok(())
    }

    async fn sftp_read(
        &mut self,
        sftp: SftpId,
        handle: SftpHandleId,
        max: usize,
    ) -> EngineResult<CryptoVec> {
        let mut state = self.lock();
        sftp_rec(&mut state, sftp)?;
        let (key, flags, offset) = file_handle(&mut state, sftp, handle)?;
        if !flags.contains(OpenFlags::READ) {
            return Err(sftp_fail(
                &mut state,
                sftp,
                SftpStatus::PermissionDenied.code(),
            ));
        }
        let bytes = state.fs.read(&key, offset, max);
        set_offset(&mut state, sftp, handle, offset + bytes.len() as u64);
        let mut out = CryptoVec::new();
        out.extend(&bytes);
        Ok(out)
    }

    async fn sftp_write(
        &mut self,
        sftp: SftpId,
        handle: SftpHandleId,
        data: &[u8],
    ) -> EngineResult<usize> {
        let mut state = self.lock();
        sftp_rec(&mut state, sftp)?;
        let (key, flags, offset) = file_handle(&mut state, sftp, handle)?;
        if !flags.contains(OpenFlags::WRITE) {
            return Err(sftp_fail(
                &mut state,
                sftp,
                SftpStatus::PermissionDenied.code(),
            ));
        }
        let at = if flags.contains(OpenFlags::APPEND) {
            state.fs.len(&key)
        } else {
            offset
        };
        state.fs.write(&key, at, data);
        set_offset(&mut state, sftp, handle, at + data.len() as u64);
        Ok(data.len())
    }

    fn sftp_seek(&mut self, sftp: SftpId, handle: SftpHandleId, offset: u64) {
        let mut state = self.lock();
        set_offset(&mut state, sftp, handle, offset);
    }

    fn sftp_tell(&self, sftp: SftpId, handle: SftpHandleId) -> u64 {
        let state = self.lock();
        match state
            .sftps
            .get(&sftp)
            .and_then(|rec| rec.handles.get(&handle))
        {
            Some(HandleRec::File { offset, .. }) => *offset,
            _ => 0,
        }
    }

    async fn sftp_readdir(
        &mut self,
        sftp: SftpId,
        handle: SftpHandleId,
    ) -> EngineResult<Option<(String, FileAttributes)>> {
        let mut state = self.lock();
        sftp_rec(&mut state, sftp)?;
        let outcome: Result<Option<(String, FileAttributes)>, u32> = match state
            .sftps
            .get_mut(&sftp)
            .and_then(|rec| rec.handles.get_mut(&handle))
        {
            Some(HandleRec::Dir { entries }) => Ok(entries.pop_front()),
            Some(HandleRec::File { .. }) => Err(SftpStatus::Failure.code()),
            None => Err(SftpStatus::InvalidHandle.code()),
        };
        match outcome {
            Ok(entry) => Ok(entry),
            Err(code) => Err(sftp_fail(&mut state, sftp, code)),
        }
    }

    async fn sftp_unlink(&mut self, sftp: SftpId, path: &str) -> EngineResult<()> {
        let mut state = self.lock();
        sftp_rec(&mut state, sftp)?;
        match state.fs.unlink(path) {
            Ok(()) => Ok(()),
            Err(code) => Err(sftp_fail(&mut state, sftp, code)),
        }
    }

    async fn sftp_rename(&mut self, sftp: SftpId, src: &str, dst: &str) -> EngineResult<()> {
        let mut state = self.lock();
        sftp_rec(&mut state, sftp)?;
        match state.fs.rename(src, dst) {
            Ok(()) => Ok(()),
            Err(code) => Err(sftp_fail(&mut state, sftp, code)),
        }
    }

    async fn sftp_mkdir(&mut self, sftp: SftpId, path: &str, mode: u32) -> EngineResult<()> {
        let mut state = self.lock();
        sftp_rec(&mut state, sftp)?;
        match state.fs.mkdir(path, mode) {
            Ok(()) => Ok(()),
            Err(code) => Err(sftp_fail(&mut state, sftp, code)),
        }
    }

    async fn sftp_rmdir(&mut self, sftp: SftpId, path: &str) -> EngineResult<()> {
        let mut state = self.lock();
        sftp_rec(&mut state, sftp)?;
        match state.fs.rmdir(path) {
            Ok(()) => Ok(()),
            Err(code) => Err(sftp_fail(&mut state, sftp, code)),
        }
    }

    async fn sftp_symlink(&mut self, sftp: SftpId, target: &str, link: &str) -> EngineResult<()> {
        let mut state = self.lock();
        sftp_rec(&mut state, sftp)?;
        match state.fs.symlink(target, link) {
            Ok(()) => Ok(()),
            Err(code) => Err(sftp_fail(&mut state, sftp, code)),
        }
    }

    async fn sftp_readlink(&mut self, sftp: SftpId, path: &str) -> EngineResult<String> {
        let mut state = self.lock();
        sftp_rec(&mut state, sftp)?;
        match state.fs.readlink(path) {
            Ok(target) => Ok(target),
            Err(code) => Err(sftp_fail(&mut state, sftp, code)),
        }
    }

    async fn sftp_realpath(&mut self, sftp: SftpId, path: &str) -> EngineResult<String> {
        let mut state = self.lock();
        sftp_rec(&mut state, sftp)?;
        match state.fs.realpath(path) {
            Ok(resolved) => Ok(resolved),
            Err(code) => Err(sftp_fail(&mut state, sftp, code)),
        }
    }

    async fn sftp_stat(
        &mut self,
        sftp: SftpId,
        path: &str,
        follow: bool,
    ) -> EngineResult<FileAttributes> {
        let mut state = self.lock();
        sftp_rec(&mut state, sftp)?;
        match state.fs.stat(path, follow) {
            Ok(attrs) => Ok(attrs),
            Err(code) => Err(sftp_fail(&mut state, sftp, code)),
        }
    }

    async fn sftp_setstat(&mut self, sftp: SftpId, path: &str, stat: &SetStat) -> EngineResult<()> {
        let mut state = self.lock();
        sftp_rec(&mut state, sftp)?;
        match state.fs.setstat(path, stat) {
            Ok(()) => Ok(()),
            Err(code) => Err(sftp_fail(&mut state, sftp, code)),
        }
    }

    fn sftp_last_status(&self, sftp: SftpId) -> Option<u32> {
        self.lock().sftps.get(&sftp).and_then(|rec| rec.last_status)
    }
}
