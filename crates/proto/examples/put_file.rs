//! Uploads a local file to a remote server.
//!
//! Usage: put_file <host> <local-path> <remote-path>
//!
//! Connects over plain TCP, so this is only useful against a server whose
//! transport is secured externally (or a test harness).

use skiff_proto::sftp::{SessionConfig, SftpClient, TransferOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (host, local, remote) = match (args.next(), args.next(), args.next()) {
        (Some(host), Some(local), Some(remote)) => (host, local, remote),
        _ => {
            eprintln!("usage: put_file <host> <local-path> <remote-path>");
            std::process::exit(1);
        }
    };

    let config = SessionConfig::new(&host);
    let mut client = SftpClient::connect(config).await?;

    let options = TransferOptions::new()
        .with_concurrency(4)
        .with_step(|total, _chunk, known| match known {
            Some(size) => println!("{} / {} bytes", total, size),
            None => println!("{} bytes", total),
        });

    let dest = client
        .put(std::path::Path::new(&local), &remote, options)
        .await?;
    println!("uploaded {} to {}", local, dest);

    client.end().await?;
    Ok(())
}
