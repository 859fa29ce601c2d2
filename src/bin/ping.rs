//! Connectivity probe: open a bucket, ping every endpoint, print the
//! JSON report.

use clap::Parser;
use mussel::{Cluster, ClusterOptions, Credentials};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mussel-ping", about = "Ping all services of a cluster")]
struct Args {
    /// couchbase:// or couchbases:// connection string
    #[arg(long, default_value = "couchbase://127.0.0.1")]
    connection_string: String,

    #[arg(long, short = 'u')]
    username: String,

    #[arg(long, short = 'p')]
    password: String,

    /// Bucket to open before pinging
    #[arg(long, default_value = "default")]
    bucket: String,

    /// Per-endpoint timeout in milliseconds
    #[arg(long, default_value_t = 2500)]
    timeout_ms: u64,

    /// Print the diagnostics snapshot instead of pinging
    #[arg(long)]
    diagnostics: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cluster = Cluster::connect(
        &args.connection_string,
        Credentials::password(&args.username, &args.password),
        ClusterOptions::default(),
    )?;
    cluster.bucket(&args.bucket).await.map_err(|e| {
        eprintln!("{}", serde_json::to_string_pretty(&e.to_json()).unwrap_or_default());
        e
    })?;

    let report = if args.diagnostics {
        serde_json::to_string_pretty(&cluster.diagnostics().await)?
    } else {
        serde_json::to_string_pretty(&cluster.ping(Some(Duration::from_millis(args.timeout_ms))).await)?
    };
    println!("{report}");

    cluster.close().await;
    Ok(())
}
