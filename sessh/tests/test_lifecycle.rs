use sessh::engine::SocketDescriptor;
use sessh::sftp::OpenFlags;
use sessh::testkit::{MemoryEngine, TeardownEvent};
use sessh::{HostKeyHashKind, MethodClass, Session};

#[tokio::test]
async fn test_exec_lifecycle() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();

    let engine = MemoryEngine::new();
    engine.add_user("deploy", "hunter2");
    engine.script_exec("uptime", b" 17:21:50 up 42 days\n", b"", 0);

    let mut session = Session::new(Box::new(engine.clone()));
    session.set_banner("SSH-2.0-lifecycle_test").await?;
    session.method_pref(MethodClass::Kex, "curve25519-sha256").await?;
    session.startup(SocketDescriptor::from_raw(3)).await?;

    assert!(session.hostkey_hash(HostKeyHashKind::Sha1).await.is_some());
    let methods = session.methods().await.expect("negotiated methods");
    assert_eq!(methods.kex, "curve25519-sha256");

    let list = session.userauth_list("deploy").await?;
    assert!(list.contains("password"));
    session.userauth_password("deploy", "hunter2").await?;
    assert!(session.authenticated().await);

    let mut channel = session.open_session().await?;
    channel.setenv("LANG", "C").await?;
    channel.execute("uptime").await?;
    let out = channel.read(1024).await?;
    assert_eq!(&*out, b" 17:21:50 up 42 days\n");
    assert!(channel.read(1024).await?.is_empty());
    channel.wait_eof().await?;
    channel.wait_closed().await?;
    assert_eq!(channel.exit_status().await?, Some(0));
    channel.close().await?;

    session.close(Some("done")).await?;
    assert_eq!(engine.disconnect_reason().as_deref(), Some("done"));
    Ok(())
}

#[tokio::test]
async fn test_sftp_and_forward_lifecycle() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();

    let engine = MemoryEngine::new();
    engine.add_user("deploy", "hunter2");
    engine.add_dir("/srv/incoming");

    let mut session = Session::new(Box::new(engine.clone()));
    session.startup(SocketDescriptor::from_raw(3)).await?;
    session.userauth_password("deploy", "hunter2").await?;

    // Upload through SFTP, then read it back over SCP.
    let mut sftp = session.sftp_init().await?;
    let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
    let mut file = sftp.open_file("/srv/incoming/release.tar", flags, 0o644).await?;
    let payload = b"not actually a tarball";
    assert_eq!(file.write(payload).await?, payload.len());
    file.close().await?;

    let (mut download, stat) = session.scp_recv("/srv/incoming/release.tar").await?;
    assert_eq!(stat.size, payload.len() as u64);
    let mut fetched = Vec::new();
    loop {
        let chunk = download.read(7).await?;
        if chunk.is_empty() {
            break;
        }
        fetched.extend_from_slice(&chunk);
    }
    assert_eq!(fetched, payload);
    download.close().await?;

    // A remote forward delivers inbound connections as channels.
    let mut listener = session.forward_listen("0.0.0.0", 9090, 4).await?;
    assert_eq!(listener.bound_port(), 9090);
    assert!(engine.push_forward_connection(9090, b"ping"));
    let mut conn = listener.accept().await?;
    assert_eq!(&*conn.read(64).await?, b"ping");
    conn.close().await?;

    session.close(None).await?;
    let log = engine.teardown_log();
    assert_eq!(log.last(), Some(&TeardownEvent::Disconnect("end".into())));
    assert!(log.iter().any(|e| matches!(e, TeardownEvent::SftpShutdown(_))));
    assert!(log.iter().any(|e| matches!(e, TeardownEvent::ListenerCancel(_))));
    Ok(())
}
