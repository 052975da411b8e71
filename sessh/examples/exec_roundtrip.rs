///
/// Run this example with:
/// cargo run --example exec_roundtrip
///
use anyhow::Result;
use log::info;
use sessh::engine::SocketDescriptor;
use sessh::testkit::MemoryEngine;
use sessh::Session;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    // A deterministic in-memory engine stands in for a real transport.
    let engine = MemoryEngine::new();
    engine.add_user("demo", "demo");
    engine.script_exec(
        "uname -a",
        b"Linux build-farm 6.1.0 x86_64 GNU/Linux\n",
        b"",
        0,
    );

    let mut session = Session::new(Box::new(engine));
    session.startup(SocketDescriptor::from_raw(3)).await?;
    info!("transport up, authenticating");
    session.userauth_password("demo", "demo").await?;

    let mut channel = session.open_session().await?;
    channel.execute("uname -a").await?;
    loop {
        let chunk = channel.read(1024).await?;
        if chunk.is_empty() {
            break;
        }
        print!("{}", String::from_utf8_lossy(&chunk));
    }
    channel.wait_closed().await?;
    println!("Exitcode: {:?}", channel.exit_status().await?);
    channel.close().await?;

    session.close(None).await?;
    Ok(())
}
