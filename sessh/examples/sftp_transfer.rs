///
/// Run this example with:
/// cargo run --example sftp_transfer
///
use anyhow::Result;
use log::info;
use sessh::engine::SocketDescriptor;
use sessh::sftp::{OpenFlags, SetStat};
use sessh::testkit::MemoryEngine;
use sessh::Session;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let engine = MemoryEngine::new();
    engine.add_user("demo", "demo");
    engine.add_file("/etc/motd", b"free beer in the server room\n", 0o644);
    engine.add_dir("/uploads");

    let mut session = Session::new(Box::new(engine));
    session.startup(SocketDescriptor::from_raw(3)).await?;
    session.userauth_password("demo", "demo").await?;

    let mut sftp = session.sftp_init().await?;
    sftp.set_dot_filter(true);

    let mut motd = sftp.open("/etc/motd").await?;
    let contents = motd.read(4096).await?;
    motd.close().await?;
    print!("motd: {}", String::from_utf8_lossy(&contents));

    let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
    let mut report = sftp.open_file("/uploads/report.txt", flags, 0o600).await?;
    report.write(b"all systems nominal\n").await?;
    report.close().await?;
    sftp.set_stat("/uploads/report.txt", &SetStat::new().permissions(0o644))
        .await?;

    let copied = sftp.copy_file("/etc/motd", "/uploads/motd.copy", 1024).await?;
    info!("copied {copied} bytes");

    let mut dir = sftp.open_dir("/uploads").await?;
    for (name, attrs) in dir.list().await? {
        info!("{name}: {} bytes", attrs.size);
    }
    dir.close().await?;

    sftp.shutdown().await?;
    session.close(None).await?;
    Ok(())
}
