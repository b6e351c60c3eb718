//! The worker runtime: a loop that polls the coordinator for assignments
//! and runs the user's map and reduce functions.
//!
//! A worker carries no state across iterations beyond the completion report
//! it piggybacks on its next poll, so a crashed worker costs at most one
//! timed-out reassignment. I/O failures are deliberately fatal: the
//! coordinator's timeout is the recovery mechanism, not in-process retries.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use atomicwrites::{AllowOverwrite, AtomicFile};
use log::{info, trace};
use tarpc::tokio_serde::formats::Json;
use tarpc::{client, context};
use tokio::net::UnixStream;
use tokio_util::codec::LengthDelimitedCodec;

use crate::coordinator::MAX_FRAME_LENGTH;
use crate::{ihash, Assignment, KeyValue, MapFn, ReduceFn, Report, TaskServiceClient};

/// How long a worker pauses after a `Sleep` assignment.
const SLEEP_INTERVAL: Duration = Duration::from_millis(500);

pub struct Worker {
    /// Directory intermediate and output files are written to. Reported
    /// paths carry this prefix so reducers in other processes can open them.
    pub dir: PathBuf,
    /// Coordinator socket to dial.
    pub sock: PathBuf,
    pub map: MapFn,
    pub reduce: ReduceFn,
}

impl Worker {
    /// Poll the coordinator until it hands out `Exit` or goes away.
    ///
    /// A worker that finishes a task and dies before its next poll simply
    /// never delivers its report; the coordinator reassigns the task after
    /// its timeout, and the duplicate completion that may follow is dropped
    /// on the coordinator side.
    pub async fn run(self) -> anyhow::Result<()> {
        let stream = UnixStream::connect(&self.sock)
            .await
            .with_context(|| format!("cannot dial coordinator at {}", self.sock.display()))?;
        let framed = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_framed(stream);
        let transport = tarpc::serde_transport::new(framed, Json::default());
        let client = TaskServiceClient::new(client::Config::default(), transport).spawn();

        let mut report = Report::None;
        loop {
            let assignment = match client.get_task(context::current(), report).await {
                Ok(a) => a,
                Err(e) => {
                    // The coordinator tears down once the job is done, so a
                    // transport error is the normal end of a worker's life.
                    info!("coordinator gone ({}), exiting", e);
                    return Ok(());
                }
            };
            report = match assignment {
                Assignment::Map { id, file, n_reduce } => {
                    trace!("map task {} on {}", id, file.display());
                    self.run_map(id, &file, n_reduce)?
                }
                Assignment::Reduce { id, files } => {
                    trace!("reduce task {} over {} files", id, files.len());
                    self.run_reduce(id, &files)?
                }
                Assignment::Sleep => {
                    tokio::time::sleep(SLEEP_INTERVAL).await;
                    Report::None
                }
                Assignment::Exit => return Ok(()),
            };
        }
    }

    /// Run the map function over one input file and scatter its records
    /// into one intermediate file per non-empty reduce partition.
    fn run_map(&self, id: usize, file: &Path, n_reduce: usize) -> anyhow::Result<Report> {
        let contents =
            fs::read_to_string(file).with_context(|| format!("cannot read {}", file.display()))?;
        let records = (self.map)(file, &contents);

        let mut partitions: Vec<Vec<KeyValue>> = vec![Vec::new(); n_reduce];
        for kv in records {
            let r = ihash(&kv.key) as usize % n_reduce;
            partitions[r].push(kv);
        }

        let mut files = vec![String::new(); n_reduce];
        for (r, records) in partitions.iter().enumerate() {
            if records.is_empty() {
                continue;
            }
            let path = self.dir.join(format!("mr-{}-{}", id, r));
            AtomicFile::new(&path, AllowOverwrite)
                .write(|f| {
                    let mut w = BufWriter::new(f);
                    for kv in records {
                        serde_json::to_writer(&mut w, kv).map_err(io::Error::from)?;
                        w.write_all(b"\n")?;
                    }
                    w.flush()
                })
                .with_context(|| format!("cannot write {}", path.display()))?;
            files[r] = path.display().to_string();
        }
        Ok(Report::Map { id, files })
    }

    /// Assemble one partition from its intermediate files, group by key, and
    /// write one output line per key in ascending key order.
    fn run_reduce(&self, id: usize, files: &[PathBuf]) -> anyhow::Result<Report> {
        let mut records: Vec<KeyValue> = Vec::new();
        for path in files {
            let file =
                File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
            for kv in serde_json::Deserializer::from_reader(BufReader::new(file))
                .into_iter::<KeyValue>()
            {
                records.push(kv.with_context(|| format!("corrupt record in {}", path.display()))?);
            }
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));

        let path = self.dir.join(format!("mr-out-{}", id));
        AtomicFile::new(&path, AllowOverwrite)
            .write(|f| {
                let mut w = BufWriter::new(f);
                let mut i = 0;
                while i < records.len() {
                    let mut j = i + 1;
                    while j < records.len() && records[j].key == records[i].key {
                        j += 1;
                    }
                    let values: Vec<String> =
                        records[i..j].iter().map(|kv| kv.value.clone()).collect();
                    let output = (self.reduce)(&records[i].key, &values);
                    writeln!(w, "{} {}", records[i].key, output)?;
                    i = j;
                }
                w.flush()
            })
            .with_context(|| format!("cannot write {}", path.display()))?;
        Ok(Report::Reduce { id, output: path })
    }
}
