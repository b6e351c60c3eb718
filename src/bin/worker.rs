use std::path::PathBuf;

use structopt::StructOpt;

use mapred::app::wc;
use mapred::{default_sock_path, Worker};

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opt {
    /// Directory for intermediate and output files
    #[structopt(short, long, parse(from_os_str), default_value = ".")]
    dir: PathBuf,

    /// Coordinator socket path (defaults to the per-user path)
    #[structopt(long, parse(from_os_str))]
    sock: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let w = Worker {
        dir: opt.dir,
        sock: opt.sock.unwrap_or_else(default_sock_path),
        map: wc::map,
        reduce: wc::reduce,
    };
    w.run().await
}
