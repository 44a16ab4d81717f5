//! PaxKV server node executable.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::signal;

use paxkv::{pf_error, pf_info, pf_warn, PaxKvError, Replica, ReplicaId};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Replica ID of myself, an index into the replicas list.
    #[arg(short, long)]
    id: ReplicaId,

    /// Key-value API port open to clients.
    #[arg(short, long, default_value_t = 52700)]
    api_port: u16,

    /// List of replica p2p addresses, the order of which maps to replica
    /// IDs. Example: '-r host1:port1 -r host2:port2 -r host3:port3'.
    #[arg(short, long)]
    replicas: Vec<SocketAddr>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Configuration string in TOML format.
    /// Example: '-c rpc_timeout_ms=1000 fail_rate=0.2'.
    #[arg(short, long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(PaxKvError)` on any error.
    fn sanitize(&self) -> Result<(), PaxKvError> {
        // check for duplicate replica addresses
        let mut replicas_set = HashSet::new();
        for addr in self.replicas.iter() {
            if replicas_set.contains(addr) {
                return Err(PaxKvError(format!(
                    "duplicate replica address '{}' given",
                    addr
                )));
            }
            replicas_set.insert(addr);
        }

        if self.replicas.is_empty() {
            return Err(PaxKvError("empty replicas list given".into()));
        }
        if (self.id as usize) >= self.replicas.len() {
            return Err(PaxKvError(format!(
                "invalid replica ID {} / {}",
                self.id,
                self.replicas.len()
            )));
        }
        let my_addr = self.replicas[self.id as usize];

        if self.api_port <= 1024 {
            Err(PaxKvError(format!("invalid api_port {}", self.api_port)))
        } else if self.api_port == my_addr.port() {
            Err(PaxKvError(format!(
                "api_port == p2p port {}",
                self.api_port
            )))
        } else if self.threads < 2 {
            Err(PaxKvError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

// Server node executable main entrance.
fn server_main() -> Result<(), PaxKvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // parse key-value API address
    let api_addr: SocketAddr = format!("127.0.0.1:{}", args.api_port)
        .parse()
        .map_err(|e| {
            PaxKvError(format!(
                "failed to parse api_addr: port {}: {}",
                args.api_port, e
            ))
        })?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-replica{}", args.id))
        .build()?;

    // enter tokio runtime, start the replica, and block until a
    // termination signal arrives
    runtime.block_on(async move {
        let mut replica = Replica::new_and_setup(
            args.id,
            api_addr,
            args.replicas.clone(),
            args.config.as_deref(),
        )?;
        replica.start().await?;

        signal::ctrl_c().await?;
        pf_warn!(args.id; "server caught termination signal");
        replica.stop().await?;

        Ok::<(), PaxKvError>(())
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("s"; "server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        pf_info!("s"; "server_main exited successfully");
        ExitCode::SUCCESS
    }
}
