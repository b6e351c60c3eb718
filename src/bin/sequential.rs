//! Sequential reference runner: the same job as the distributed runtime,
//! executed in-process, with the same partitioning and output line format.
//! Useful for sanity-checking a distributed run's `mr-out-*` files.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use atomicwrites::{AllowOverwrite, AtomicFile};
use log::trace;
use structopt::StructOpt;

use mapred::app::wc::{map, reduce};
use mapred::ihash;

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opt {
    /// Files to process
    #[structopt(name = "FILE", parse(from_os_str), required = true)]
    files: Vec<PathBuf>,

    /// Number of reduce partitions
    #[structopt(long, default_value = "10")]
    nreduce: usize,

    /// Directory for output files
    #[structopt(short, long, parse(from_os_str), default_value = ".")]
    dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    assert!(opt.nreduce > 0, "--nreduce must be non-zero");

    let mut cnt = HashMap::<String, Vec<String>>::new();
    for fname in opt.files.iter() {
        let contents = fs::read_to_string(fname)?;
        for kv in map(fname, &contents) {
            cnt.entry(kv.key).or_default().push(kv.value);
        }
    }

    let mut partitions = HashMap::<usize, Vec<(String, String)>>::new();
    for (k, vs) in cnt.iter() {
        let r = ihash(k) as usize % opt.nreduce;
        let v = reduce(k, vs);
        partitions.entry(r).or_default().push((k.clone(), v));
    }

    for r in 0..opt.nreduce {
        let path = opt.dir.join(format!("mr-seq-out-{}", r));
        let mut lines = partitions.remove(&r).unwrap_or_default();
        lines.sort();
        AtomicFile::new(&path, AllowOverwrite).write(|f| {
            let mut s = String::new();
            for (k, v) in lines.iter() {
                s.push_str(k);
                s.push(' ');
                s.push_str(v);
                s.push('\n');
            }
            f.write_all(s.as_bytes())
        })?;
        trace!("output {:?}", path);
    }
    Ok(())
}
