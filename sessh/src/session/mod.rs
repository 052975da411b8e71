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

//! The session: startup, authentication, factories and ordered teardown.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use log::{debug, trace, warn};
use tokio::sync::Mutex;

use crate::auth::{CannedResponder, KeyboardInteractive};
use crate::channels::{Channel, ChannelState};
use crate::engine::{
    ChannelId, ChannelOpen, Engine, EngineError, ListenerId, ScpFileStat, SftpId,
    SocketDescriptor,
};
use crate::error::{self, Error, TransportPhase};
use crate::listener::{Listener, ListenerState};
use crate::negotiation::{HostKeyHashKind, MethodClass, NegotiatedMethods, TraceFlags};
use crate::sftp::{self, Sftp, SftpShared};

static SESSION_IDS: AtomicU64 = AtomicU64::new(0);

/// Receives channels the remote side opens for X11 forwarding.
///
/// Installed per session with [`Session::set_x11_handler`]. The handler
/// runs on whichever task happened to surface the open, with no engine
/// lock held, so it may stash the channel and use it later.
pub trait X11Handler: Send {
    fn x11_open(&mut self, channel: Channel, originator_host: &str, originator_port: u16);
}

/// Live objects of a session. Holds state records only, never handles,
/// so a forgotten handle cannot keep the session alive through here.
#[derive(Default)]
struct Registry {
    channels: HashMap<ChannelId, Arc<ChannelState>>,
    listeners: HashMap<ListenerId, Arc<ListenerState>>,
    sftps: HashMap<SftpId, Arc<SftpShared>>,
}

/// State shared between a [`Session`] and every handle it produced.
pub(crate) struct SessionShared {
    pub(crate) id: u64,
    pub(crate) engine: Mutex<Box<dyn Engine>>,
    pub(crate) opened: AtomicBool,
    registry: StdMutex<Registry>,
    x11: StdMutex<Option<Box<dyn X11Handler>>>,
}

impl SessionShared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn adopt_channel(self: &Arc<Self>, open: ChannelOpen) -> Channel {
        let state = Arc::new(ChannelState::new(&open));
        self.registry().channels.insert(open.id, state.clone());
        debug!("session {}: adopted channel {}", self.id, open.id);
        Channel::new(self.clone(), state)
    }

    fn adopt_listener(self: &Arc<Self>, id: ListenerId, bound_port: u16) -> Listener {
        let state = Arc::new(ListenerState::new(id, bound_port));
        self.registry().listeners.insert(id, state.clone());
        debug!("session {}: listening on remote port {}", self.id, bound_port);
        Listener::new(self.clone(), state)
    }

    fn adopt_sftp(self: &Arc<Self>, id: SftpId) -> Sftp {
        let state = Arc::new(SftpShared::new(id));
        self.registry().sftps.insert(id, state.clone());
        debug!("session {}: sftp subsystem {} started", self.id, id);
        Sftp::new(self.clone(), state)
    }

    pub(crate) fn unregister_channel(&self, id: ChannelId) {
        self.registry().channels.remove(&id);
    }

    pub(crate) fn unregister_listener(&self, id: ListenerId) {
        self.registry().listeners.remove(&id);
    }

    pub(crate) fn unregister_sftp(&self, id: SftpId) {
        self.registry().sftps.remove(&id);
    }

    fn drain_registry(
        &self,
    ) -> (
        Vec<Arc<SftpShared>>,
        Vec<Arc<ChannelState>>,
        Vec<Arc<ListenerState>>,
    ) {
        let mut registry = self.registry();
        let sftps = registry.sftps.drain().map(|(_, s)| s).collect();
        let channels = registry.channels.drain().map(|(_, s)| s).collect();
        let listeners = registry.listeners.drain().map(|(_, s)| s).collect();
        (sftps, channels, listeners)
    }

    /// Close a channel and release it, engine-side included. The record
    /// is gone from the registry even when the engine reports an error.
    pub(crate) async fn close_channel(&self, state: &ChannelState) -> Result<(), Error> {
        if state.mark_closed() {
            return Ok(());
        }
        self.unregister_channel(state.id);
        let mut engine = self.engine.lock().await;
        let res = engine.channel_close(state.id).await;
        engine.channel_free(state.id);
        debug!("session {}: closed channel {}", self.id, state.id);
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    /// Hand queued inbound X11 channels to the session's handler.
    ///
    /// Called after reads, polls and accepts, the points where new opens
    /// can have arrived. The handler is invoked without the engine lock;
    /// opens arriving while no handler is installed are closed.
    pub(crate) async fn dispatch_x11(self: &Arc<Self>) {
        loop {
            let pending = {
                let mut engine = self.engine.lock().await;
                engine.take_x11_open()
            };
            let Some(x11) = pending else { return };
            let handler = self
                .x11
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match handler {
                Some(mut handler) => {
                    debug!(
                        "session {}: inbound x11 channel {} from {}:{}",
                        self.id, x11.open.id, x11.originator_host, x11.originator_port
                    );
                    let channel = self.adopt_channel(x11.open);
                    handler.x11_open(channel, &x11.originator_host, x11.originator_port);
                    let mut slot = self.x11.lock().unwrap_or_else(PoisonError::into_inner);
                    if slot.is_none() {
                        *slot = Some(handler);
                    }
                }
                None => {
                    let mut engine = self.engine.lock().await;
                    if let Err(e) = engine.channel_close(x11.open.id).await {
                        warn!(
                            "session {}: error refusing x11 channel {}: {}",
                            self.id, x11.open.id, e
                        );
                    }
                    engine.channel_free(x11.open.id);
                }
            }
        }
    }
}

/// A client SSH session on top of an [`Engine`].
///
/// The session hands out [`Channel`], [`Listener`] and [`Sftp`] handles
/// and keeps track of them; [`Session::close`] tears everything down in
/// order (subsystems, then channels, then listeners) before disconnecting.
pub struct Session {
    shared: Arc<SessionShared>,
    socket: Option<SocketDescriptor>,
}

impl Session {
    pub fn new(engine: Box<dyn Engine>) -> Self {
        let id = SESSION_IDS.fetch_add(1, Ordering::Relaxed);
        Session {
            shared: Arc::new(SessionShared {
                id,
                engine: Mutex::new(engine),
                opened: AtomicBool::new(false),
                registry: StdMutex::new(Registry::default()),
                x11: StdMutex::new(None),
            }),
            socket: None,
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if !self.shared.opened.load(Ordering::SeqCst) {
            return Err(Error::Transport {
                phase: TransportPhase::Protocol,
                detail: "session has not been started".into(),
            });
        }
        Ok(())
    }

    /// Run the handshake on an already-connected socket. The caller keeps
    /// ownership of the socket and closes it after the session ends.
    pub async fn startup(&mut self, socket: SocketDescriptor) -> Result<(), Error> {
        if self.shared.opened.load(Ordering::SeqCst) {
            return Err(Error::InvalidArgument("session already started".into()));
        }
        debug!("session {}: handshake on {}", self.shared.id, socket);
        let mut engine = self.shared.engine.lock().await;
        let res = engine.handshake(socket).await;
        match res {
            Ok(()) => {
                drop(engine);
                self.socket = Some(socket);
                self.shared.opened.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    /// Replace the client banner sent during the handshake. Once the
    /// session is started the banner is on the wire, so later calls are
    /// logged and ignored.
    pub async fn set_banner(&mut self, banner: &str) -> Result<(), Error> {
        if self.shared.opened.load(Ordering::SeqCst) {
            warn!(
                "session {}: banner set after startup has no effect",
                self.shared.id
            );
            return Ok(());
        }
        let mut engine = self.shared.engine.lock().await;
        let res = engine.set_banner(banner);
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    /// Restrict the preference list for one method class. Preferences
    /// only matter to the key exchange, so this must happen before
    /// [`Session::startup`].
    pub async fn method_pref(&mut self, class: MethodClass, prefs: &str) -> Result<(), Error> {
        if self.shared.opened.load(Ordering::SeqCst) {
            return Err(Error::InvalidArgument(
                "method preferences must be set before startup".into(),
            ));
        }
        let mut engine = self.shared.engine.lock().await;
        let res = engine.method_pref(class, prefs);
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    /// The methods agreed on during key exchange, one per class, or
    /// `None` before the handshake has completed.
    pub async fn methods(&self) -> Option<NegotiatedMethods> {
        let engine = self.shared.engine.lock().await;
        engine.methods()
    }

    /// Digest of the server host key, or `None` before the handshake.
    pub async fn hostkey_hash(&self, kind: HostKeyHashKind) -> Option<Vec<u8>> {
        let engine = self.shared.engine.lock().await;
        engine.hostkey_hash(kind)
    }

    /// The most recent failure the engine recorded, with full detail.
    pub async fn last_error(&self) -> Option<EngineError> {
        let engine = self.shared.engine.lock().await;
        engine.last_error()
    }

    /// The socket the handshake ran on, or `None` before startup.
    pub fn socket(&self) -> Option<SocketDescriptor> {
        self.socket
    }

    /// Switch the whole session between blocking and non-blocking mode.
    pub async fn set_blocking(&mut self, blocking: bool) {
        let mut engine = self.shared.engine.lock().await;
        engine.set_blocking(blocking);
    }

    /// Enable wire-level tracing for the given subsystems.
    pub async fn trace(&mut self, bitmask: TraceFlags) {
        let mut engine = self.shared.engine.lock().await;
        engine.trace(bitmask);
    }

    pub async fn authenticated(&self) -> bool {
        let engine = self.shared.engine.lock().await;
        engine.authenticated()
    }

    /// Comma-separated authentication methods the server advertises for
    /// this user.
    pub async fn userauth_list(&mut self, username: &str) -> Result<String, Error> {
        self.ensure_open()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.auth_list(username).await;
        match res {
            Ok(methods) => Ok(methods),
            Err(e) => Err(error::map_auth(error::enrich(&**engine, e))),
        }
    }

    pub async fn userauth_password(&mut self, username: &str, password: &str) -> Result<(), Error> {
        self.ensure_open()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.auth_password(username, password).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_auth(error::enrich(&**engine, e))),
        }
    }

    /// Authenticate with a key pair on disk. The public key path may be
    /// omitted when the engine can derive it from the private key.
    pub async fn userauth_publickey_fromfile(
        &mut self,
        username: &str,
        publickey: Option<&Path>,
        privatekey: &Path,
        passphrase: Option<&str>,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine
            .auth_publickey_fromfile(username, publickey, privatekey, passphrase)
            .await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_auth(error::enrich(&**engine, e))),
        }
    }

    pub async fn userauth_hostbased_fromfile(
        &mut self,
        username: &str,
        publickey: &Path,
        privatekey: &Path,
        passphrase: Option<&str>,
        hostname: &str,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine
            .auth_hostbased_fromfile(username, publickey, privatekey, passphrase, hostname)
            .await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_auth(error::enrich(&**engine, e))),
        }
    }

    /// Keyboard-interactive authentication answering every prompt with
    /// `password`, which is what most password-over-kbdint servers expect.
    pub async fn userauth_keyboardinteractive(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<(), Error> {
        let mut responder = CannedResponder::new(password);
        self.userauth_keyboardinteractive_with(username, &mut responder)
            .await
    }

    /// Keyboard-interactive authentication with a caller-supplied
    /// responder, for servers that ask real questions.
    pub async fn userauth_keyboardinteractive_with(
        &mut self,
        username: &str,
        responder: &mut (dyn KeyboardInteractive + Send),
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.auth_keyboard_interactive(username, responder).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_auth(error::enrich(&**engine, e))),
        }
    }

    /// Try every identity the authentication agent holds, in the order
    /// the agent lists them, until one is accepted. The agent connection
    /// is released before returning, whatever the outcome.
    pub async fn userauth_agent(&mut self, username: &str) -> Result<(), Error> {
        self.ensure_open()?;
        let mut engine = self.shared.engine.lock().await;
        if let Err(e) = engine.agent_connect().await {
            return Err(error::map_auth(error::enrich(&**engine, e)));
        }
        let identities = match engine.agent_identities().await {
            Ok(identities) => identities,
            Err(e) => {
                let err = error::map_auth(error::enrich(&**engine, e));
                engine.agent_disconnect().await;
                return Err(err);
            }
        };
        let mut accepted = false;
        for identity in &identities {
            match engine.agent_auth(username, identity).await {
                Ok(()) => {
                    accepted = true;
                    break;
                }
                Err(e) => trace!("agent identity {:?} refused: {}", identity.comment, e),
            }
        }
        engine.agent_disconnect().await;
        if accepted {
            Ok(())
        } else if identities.is_empty() {
            Err(Error::AuthFailed("the agent holds no identities".into()))
        } else {
            Err(Error::AuthFailed(format!(
                "none of the {} agent identities was accepted",
                identities.len()
            )))
        }
    }

    /// Open a session channel, the kind that carries execs and shells.
    pub async fn open_session(&mut self) -> Result<Channel, Error> {
        self.ensure_open()?;
        let open = {
            let mut engine = self.shared.engine.lock().await;
            let res = engine.channel_open_session().await;
            match res {
                Ok(open) => open,
                Err(e) => return Err(error::map_enriched(&**engine, e)),
            }
        };
        Ok(self.shared.adopt_channel(open))
    }

    /// Open a direct-tcpip channel to `host:port`, reporting the local
    /// loopback and the SSH port as the originator.
    pub async fn direct_tcpip(&mut self, host: &str, port: u16) -> Result<Channel, Error> {
        self.direct_tcpip_ex(host, port, "127.0.0.1", 22).await
    }

    pub async fn direct_tcpip_ex(
        &mut self,
        host: &str,
        port: u16,
        shost: &str,
        sport: u16,
    ) -> Result<Channel, Error> {
        self.ensure_open()?;
        let open = {
            let mut engine = self.shared.engine.lock().await;
            let res = engine.channel_direct_tcpip(host, port, shost, sport).await;
            match res {
                Ok(open) => open,
                Err(e) => return Err(error::map_enriched(&**engine, e)),
            }
        };
        Ok(self.shared.adopt_channel(open))
    }

    /// Ask the server to listen on `host:port` and forward connections
    /// back over the session. Passing port zero lets the server pick;
    /// [`Listener::bound_port`] reports the choice.
    pub async fn forward_listen(
        &mut self,
        host: &str,
        port: u16,
        queue_max: u32,
    ) -> Result<Listener, Error> {
        self.ensure_open()?;
        let (id, bound_port) = {
            let mut engine = self.shared.engine.lock().await;
            let res = engine.forward_listen(host, port, queue_max).await;
            match res {
                Ok(bound) => bound,
                Err(e) => return Err(error::map_enriched(&**engine, e)),
            }
        };
        Ok(self.shared.adopt_listener(id, bound_port))
    }

    /// Fetch a remote file over SCP: returns the channel carrying the
    /// file body and the stat the server announced.
    pub async fn scp_recv(&mut self, path: &str) -> Result<(Channel, ScpFileStat), Error> {
        self.ensure_open()?;
        let (open, stat) = {
            let mut engine = self.shared.engine.lock().await;
            let res = engine.scp_recv(path).await;
            match res {
                Ok(recv) => recv,
                Err(e) => return Err(error::map_enriched(&**engine, e)),
            }
        };
        Ok((self.shared.adopt_channel(open), stat))
    }

    /// Send a file over SCP. `size` bytes must then be written to the
    /// returned channel, followed by EOF.
    pub async fn scp_send(
        &mut self,
        path: &str,
        mode: u32,
        size: u64,
        times: Option<(u64, u64)>,
    ) -> Result<Channel, Error> {
        self.ensure_open()?;
        let open = {
            let mut engine = self.shared.engine.lock().await;
            let res = engine.scp_send(path, mode, size, times).await;
            match res {
                Ok(open) => open,
                Err(e) => return Err(error::map_enriched(&**engine, e)),
            }
        };
        Ok(self.shared.adopt_channel(open))
    }

    /// Start an SFTP subsystem on its own channel.
    pub async fn sftp_init(&mut self) -> Result<Sftp, Error> {
        self.ensure_open()?;
        let id = {
            let mut engine = self.shared.engine.lock().await;
            let res = engine.sftp_init().await;
            match res {
                Ok(id) => id,
                Err(e) => return Err(error::map_enriched(&**engine, e)),
            }
        };
        Ok(self.shared.adopt_sftp(id))
    }

    /// Install or remove the handler for inbound X11 channels. While a
    /// handler is installed the engine accepts such opens; without one
    /// they are refused.
    pub async fn set_x11_handler(&mut self, handler: Option<Box<dyn X11Handler>>) {
        let accept = handler.is_some();
        *self
            .shared
            .x11
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handler;
        let mut engine = self.shared.engine.lock().await;
        engine.set_accept_x11(accept);
    }

    /// Tear the session down: shut down SFTP subsystems, close channels,
    /// cancel listeners, then disconnect with `reason` (default "end").
    /// Per-object failures are logged and do not stop the teardown; only
    /// the disconnect outcome is returned. Closing twice is a no-op.
    pub async fn close(&mut self, reason: Option<&str>) -> Result<(), Error> {
        if !self.shared.opened.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let reason = reason.unwrap_or("end");
        debug!("session {}: closing ({})", self.shared.id, reason);
        let (sftps, channels, listeners) = self.shared.drain_registry();
        let mut engine = self.shared.engine.lock().await;
        for state in sftps {
            if let Err(e) = sftp::shutdown_subsystem(&mut **engine, &state).await {
                warn!(
                    "session {}: error shutting down sftp {}: {}",
                    self.shared.id, state.id, e
                );
            }
        }
        for state in channels {
            if state.mark_closed() {
                continue;
            }
            if let Err(e) = engine.channel_close(state.id).await {
                warn!(
                    "session {}: error closing channel {}: {}",
                    self.shared.id, state.id, e
                );
            }
            engine.channel_free(state.id);
        }
        for state in listeners {
            if state.mark_closed() {
                continue;
            }
            if let Err(e) = engine.forward_cancel(state.id).await {
                warn!(
                    "session {}: error cancelling listener {}: {}",
                    self.shared.id, state.id, e
                );
            }
        }
        let res = engine.disconnect(reason).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.shared.opened.swap(false, Ordering::SeqCst) {
            let (sftps, channels, listeners) = self.shared.drain_registry();
            for state in &sftps {
                state.mark_closed();
                for handle in state.drain_handles() {
                    handle.mark_closed();
                }
            }
            for state in &channels {
                state.mark_closed();
            }
            for state in &listeners {
                state.mark_closed();
            }
            debug!("session {}: dropped without close", self.shared.id);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("socket", &self.socket)
            .finish()
    }
}
