use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::auth::{KeyboardInteractive, Prompt};
use crate::testkit::MemoryEngine;
use crate::{
    Channel, Error, HostKeyHashKind, MethodClass, Session, SocketDescriptor, TraceFlags,
    TransportPhase, X11Handler,
};

use super::connected_pair;

#[tokio::test]
async fn password_auth_succeeds() {
    let (_engine, session) = connected_pair().await;
    assert!(session.authenticated().await);
}

#[tokio::test]
async fn startup_twice_is_rejected() {
    let (_engine, mut session) = connected_pair().await;
    let err = session
        .startup(SocketDescriptor::from_raw(8))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn operations_require_startup() {
    let _ = env_logger::try_init();
    let engine = MemoryEngine::new();
    let mut session = Session::new(Box::new(engine));
    let err = session.open_session().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Transport {
            phase: TransportPhase::Protocol,
            ..
        }
    ));
    let err = session.userauth_password("jane", "s3cret").await.unwrap_err();
    assert!(matches!(err, Error::Transport { .. }));
}

#[tokio::test]
async fn wrong_password_then_retry() {
    let _ = env_logger::try_init();
    let engine = MemoryEngine::new();
    engine.add_user("jane", "s3cret");
    let mut session = Session::new(Box::new(engine));
    session
        .startup(SocketDescriptor::from_raw(7))
        .await
        .unwrap();

    let err = session.userauth_password("jane", "wrong").await.unwrap_err();
    match err {
        Error::AuthFailed(detail) => assert_eq!(detail, "authentication failed for jane"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!session.authenticated().await);

    // The session survives the failure; a second attempt goes through.
    session.userauth_password("jane", "s3cret").await.unwrap();
    assert!(session.authenticated().await);
}

#[tokio::test]
async fn expired_password_is_distinguished() {
    let (engine, mut session) = connected_pair().await;
    engine.add_user("old", "pw");
    engine.expire_password("old");
    let err = session.userauth_password("old", "pw").await.unwrap_err();
    assert!(matches!(err, Error::PasswordExpired));
}

#[tokio::test]
async fn publickey_auth_and_rejection() {
    let (engine, mut session) = connected_pair().await;
    let err = session
        .userauth_publickey_fromfile(
            "nobody",
            None,
            Path::new("/home/nobody/.ssh/id_ed25519"),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthUnverified(_)));

    engine.allow_publickey("jane");
    session
        .userauth_publickey_fromfile(
            "jane",
            Some(Path::new("/home/jane/.ssh/id_ed25519.pub")),
            Path::new("/home/jane/.ssh/id_ed25519"),
            Some("passphrase"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn hostbased_auth() {
    let (engine, mut session) = connected_pair().await;
    engine.allow_hostbased("jane");
    session
        .userauth_hostbased_fromfile(
            "jane",
            Path::new("/etc/ssh/ssh_host_ed25519_key.pub"),
            Path::new("/etc/ssh/ssh_host_ed25519_key"),
            None,
            "client.example.com",
        )
        .await
        .unwrap();
    assert!(session.authenticated().await);
}

#[tokio::test]
async fn keyboard_interactive_with_canned_password() {
    let (engine, mut session) = connected_pair().await;
    engine.set_kbd("jane", "otp-123456");
    session
        .userauth_keyboardinteractive("jane", "otp-123456")
        .await
        .unwrap();

    let err = session
        .userauth_keyboardinteractive("jane", "wrong")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthFailed(_)));
}

#[tokio::test]
async fn keyboard_interactive_prompts_reach_the_responder() {
    struct Recorder {
        prompts: Vec<Prompt>,
        answer: String,
    }

    impl KeyboardInteractive for Recorder {
        fn respond(
            &mut self,
            _username: &str,
            _instructions: &str,
            prompts: &[Prompt],
        ) -> Vec<String> {
            self.prompts.extend_from_slice(prompts);
            vec![self.answer.clone(); prompts.len()]
        }
    }

    let (engine, mut session) = connected_pair().await;
    engine.set_kbd("jane", "otp-123456");
    let mut responder = Recorder {
        prompts: Vec::new(),
        answer: "otp-123456".to_string(),
    };
    session
        .userauth_keyboardinteractive_with("jane", &mut responder)
        .await
        .unwrap();
    assert_eq!(responder.prompts.len(), 1);
    let prompt = responder.prompts.first().unwrap();
    assert_eq!(prompt.prompt, "Password: ");
    assert!(!prompt.echo);
}

#[tokio::test]
async fn agent_auth_walks_identities() {
    let (engine, mut session) = connected_pair().await;
    engine.add_agent_identity("work-laptop", b"blob-1");
    engine.add_agent_identity("home-desktop", b"blob-2");
    engine.accept_agent_identity("home-desktop");
    session.userauth_agent("jane").await.unwrap();
    assert!(session.authenticated().await);
}

#[tokio::test]
async fn agent_auth_without_identities() {
    let (_engine, mut session) = connected_pair().await;
    let err = session.userauth_agent("jane").await.unwrap_err();
    match err {
        Error::AuthFailed(detail) => assert_eq!(detail, "the agent holds no identities"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn agent_auth_with_only_refused_identities() {
    let (engine, mut session) = connected_pair().await;
    engine.add_agent_identity("work-laptop", b"blob-1");
    engine.add_agent_identity("home-desktop", b"blob-2");
    let err = session.userauth_agent("jane").await.unwrap_err();
    match err {
        Error::AuthFailed(detail) => assert!(detail.contains("2 agent identities")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn userauth_list_reports_methods() {
    let (engine, mut session) = connected_pair().await;
    let methods = session.userauth_list("jane").await.unwrap();
    assert_eq!(methods, "publickey,password,keyboard-interactive");

    engine.set_auth_methods("password");
    assert_eq!(session.userauth_list("jane").await.unwrap(), "password");
}

#[tokio::test]
async fn method_preferences_steer_negotiation() {
    let _ = env_logger::try_init();
    let engine = MemoryEngine::new();
    engine.add_user("jane", "s3cret");
    let mut session = Session::new(Box::new(engine));
    assert!(session.methods().await.is_none());
    session
        .method_pref(
            MethodClass::Kex,
            "ecdh-sha2-nistp256,curve25519-sha256",
        )
        .await
        .unwrap();
    session
        .method_pref(MethodClass::CompCs, "zlib@openssh.com,none")
        .await
        .unwrap();
    session
        .startup(SocketDescriptor::from_raw(7))
        .await
        .unwrap();

    let methods = session.methods().await.unwrap();
    assert_eq!(methods.kex, "ecdh-sha2-nistp256");
    assert_eq!(methods.comp_cs, "zlib@openssh.com");
    assert_eq!(methods.comp_sc, "none");
    assert_eq!(methods.get(MethodClass::HostKey), "ssh-ed25519");
}

#[tokio::test]
async fn unsupported_method_preference() {
    let _ = env_logger::try_init();
    let engine = MemoryEngine::new();
    let mut session = Session::new(Box::new(engine));
    let err = session
        .method_pref(MethodClass::Kex, "diffie-hellman-group1-sha1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MethodNotSupported(_)));
}

#[tokio::test]
async fn method_preferences_are_pre_startup_only() {
    let (_engine, mut session) = connected_pair().await;
    let err = session
        .method_pref(MethodClass::Kex, "curve25519-sha256")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn hostkey_hash_lengths() {
    let _ = env_logger::try_init();
    let engine = MemoryEngine::new();
    let mut session = Session::new(Box::new(engine));
    assert!(session.hostkey_hash(HostKeyHashKind::Md5).await.is_none());
    session
        .startup(SocketDescriptor::from_raw(7))
        .await
        .unwrap();
    assert_eq!(
        session.hostkey_hash(HostKeyHashKind::Md5).await.unwrap().len(),
        16
    );
    assert_eq!(
        session
            .hostkey_hash(HostKeyHashKind::Sha1)
            .await
            .unwrap()
            .len(),
        20
    );
}

#[tokio::test]
async fn banner_must_precede_startup() {
    let _ = env_logger::try_init();
    let engine = MemoryEngine::new();
    let mut session = Session::new(Box::new(engine.clone()));
    session.set_banner("SSH-2.0-sessh_test").await.unwrap();
    session
        .startup(SocketDescriptor::from_raw(7))
        .await
        .unwrap();
    assert_eq!(
        engine.client_banner().as_deref(),
        Some("SSH-2.0-sessh_test")
    );

    // On the wire already; the late call is ignored.
    session.set_banner("SSH-2.0-too_late").await.unwrap();
    assert_eq!(
        engine.client_banner().as_deref(),
        Some("SSH-2.0-sessh_test")
    );
}

#[tokio::test]
async fn trace_flags_reach_the_engine() {
    let (engine, mut session) = connected_pair().await;
    session.trace(TraceFlags::KEX | TraceFlags::ERROR).await;
    assert_eq!(engine.trace_flags(), TraceFlags::KEX | TraceFlags::ERROR);
}

struct CollectingHandler {
    opens: Arc<Mutex<Vec<(Channel, String, u16)>>>,
}

impl X11Handler for CollectingHandler {
    fn x11_open(&mut self, channel: Channel, originator_host: &str, originator_port: u16) {
        self.opens
            .lock()
            .unwrap()
            .push((channel, originator_host.to_string(), originator_port));
    }
}

#[tokio::test]
async fn inbound_x11_channels_reach_the_handler() {
    let (engine, mut session) = connected_pair().await;
    engine.script_exec("xterm", b"", b"", 0);

    // Refused while no handler is installed.
    assert!(!engine.push_x11_open("127.0.0.1", 6000, b"x11-data"));

    let opens = Arc::new(Mutex::new(Vec::new()));
    session
        .set_x11_handler(Some(Box::new(CollectingHandler {
            opens: opens.clone(),
        })))
        .await;

    let mut channel = session.open_session().await.unwrap();
    channel.x11_req(0).await.unwrap();
    channel.execute("xterm").await.unwrap();

    assert!(engine.push_x11_open("127.0.0.1", 6000, b"x11-data"));
    // Any read or poll surfaces queued opens.
    channel.poll_read(false).await.unwrap();

    let (mut x11_channel, host, port) = {
        let mut opens = opens.lock().unwrap();
        assert_eq!(opens.len(), 1);
        opens.pop().unwrap()
    };
    assert_eq!(host, "127.0.0.1");
    assert_eq!(port, 6000);
    let data = x11_channel.read(1024).await.unwrap();
    assert_eq!(&*data, b"x11-data");
    x11_channel.close().await.unwrap();
}

#[tokio::test]
async fn x11_opens_without_handler_are_refused_after_removal() {
    let (engine, mut session) = connected_pair().await;
    let opens = Arc::new(Mutex::new(Vec::new()));
    session
        .set_x11_handler(Some(Box::new(CollectingHandler {
            opens: opens.clone(),
        })))
        .await;
    session.set_x11_handler(None).await;
    assert!(!engine.push_x11_open("127.0.0.1", 6001, b""));
    assert!(opens.lock().unwrap().is_empty());
}
