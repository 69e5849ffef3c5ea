use std::{error::Error, path::PathBuf, time::Duration};

use clap::Parser;
use thinwire::{
    ClientConfig, Connection, ConnectionListeners,
    config::{TlsConfig, TransportOptions},
};

/// Connects to a server node, reports the negotiated protocol and optionally sends one
/// operation with an empty payload.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server endpoint, `host[:port]` or `[ipv6][:port]`
    endpoint: String,
    /// Wrap the connection in TLS
    #[arg(long)]
    tls: bool,
    /// Extra PEM bundle of trusted certificates (implies --tls)
    #[arg(long)]
    ca_file: Option<PathBuf>,
    /// Name to verify the server certificate against (implies --tls)
    #[arg(long)]
    server_name: Option<String>,
    #[arg(short, long)]
    username: Option<String>,
    #[arg(short, long, requires = "username")]
    password: Option<String>,
    /// Connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,
    /// Operation code to send after connecting
    #[arg(long)]
    op: Option<i16>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();

    let mut config = ClientConfig::default().with_transport(TransportOptions {
        connect_timeout: Duration::from_secs(cli.timeout),
        ..TransportOptions::default()
    });
    if let Some(username) = cli.username {
        config = config.with_credentials(username, cli.password.unwrap_or_default());
    }
    if cli.tls || cli.ca_file.is_some() || cli.server_name.is_some() {
        config = config.with_tls(TlsConfig {
            ca_file: cli.ca_file,
            server_name: cli.server_name,
        });
    }

    let listeners = ConnectionListeners::default()
        .on_disconnect(|conn, err| match err {
            Some(e) => eprintln!("connection to {} lost: {e}", conn.endpoint()),
            None => eprintln!("connection to {} closed by server", conn.endpoint()),
        })
        .on_affinity_topology_change(|version| println!("affinity topology: {version}"));

    let conn = Connection::new(&cli.endpoint, config, listeners)?;
    conn.connect()?;

    println!("endpoint: {}", conn.endpoint());
    println!("protocol: {}", conn.protocol_version());
    match conn.node_id() {
        Some(node_id) => println!("node: {node_id}"),
        None => println!("node: unknown"),
    }

    if let Some(op) = cli.op {
        let payload = conn.send_request(op, |_| Ok(()), |payload| Ok(payload.remaining()))?;
        println!("op {op}: {payload} payload bytes");
    }

    conn.disconnect();
    Ok(())
}
