use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;

use mapred::{default_sock_path, Coordinator};

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opt {
    /// Files to process, one map task per file
    #[structopt(name = "FILE", parse(from_os_str), required = true)]
    files: Vec<PathBuf>,

    /// Number of reduce partitions
    #[structopt(long, default_value = "10")]
    nreduce: usize,

    /// Seconds before an unfinished task is handed to another worker
    #[structopt(short, long, default_value = "10")]
    timeout: u64,

    /// Socket path to serve on (defaults to the per-user path)
    #[structopt(long, parse(from_os_str))]
    sock: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let sock = opt.sock.unwrap_or_else(default_sock_path);
    let coordinator = Coordinator::serve(
        opt.files,
        opt.nreduce,
        &sock,
        Duration::from_secs(opt.timeout),
    )
    .await?;

    while !coordinator.done() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    // Let lingering workers pick up their Exit reply before the socket goes
    // away with this process.
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}
