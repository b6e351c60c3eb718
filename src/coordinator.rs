//! The coordinator: task state for one job, served over a local socket.
//!
//! All mutable state sits behind a single mutex; the RPC handler applies the
//! caller's completion report and picks its next assignment in one critical
//! section. Timeouts are evaluated lazily on each call, so there are no
//! background timers to race with.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use futures::StreamExt;
use log::{info, trace, warn};
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Json;
use tokio::net::UnixListener;
use tokio_util::codec::LengthDelimitedCodec;

use crate::{Assignment, Report, TaskService};

/// Window after which an unfinished assignment becomes eligible for another
/// worker.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Debug)]
struct MapTask {
    id: usize,
    file: PathBuf,
    started_at: Option<Instant>,
    done: bool,
}

#[derive(Debug)]
struct ReduceTask {
    id: usize,
    files: Vec<PathBuf>,
    started_at: Option<Instant>,
    done: bool,
}

#[derive(Debug)]
struct State {
    map_tasks: Vec<MapTask>,
    reduce_tasks: Vec<ReduceTask>,
    map_remain: usize,
    reduce_remain: usize,
    timeout: Duration,
}

fn expired(started_at: Option<Instant>, now: Instant, timeout: Duration) -> bool {
    match started_at {
        // Never assigned.
        None => true,
        Some(t) => now.duration_since(t) > timeout,
    }
}

impl State {
    fn new(files: Vec<PathBuf>, n_reduce: usize, timeout: Duration) -> Self {
        let map_tasks: Vec<MapTask> = files
            .into_iter()
            .enumerate()
            .map(|(id, file)| MapTask {
                id,
                file,
                started_at: None,
                done: false,
            })
            .collect();
        let reduce_tasks: Vec<ReduceTask> = (0..n_reduce)
            .map(|id| ReduceTask {
                id,
                files: Vec::new(),
                started_at: None,
                done: false,
            })
            .collect();
        State {
            map_remain: map_tasks.len(),
            reduce_remain: reduce_tasks.len(),
            map_tasks,
            reduce_tasks,
            timeout,
        }
    }

    /// Step 1 of the handler: fold the worker's completion report into the
    /// task tables. Reports for already-done tasks are dropped, so a slow
    /// duplicate execution can never double-count or re-grow a shuffle.
    fn apply_report(&mut self, report: Report) {
        match report {
            Report::None => {}
            Report::Map { id, files } => {
                let task = match self.map_tasks.get_mut(id) {
                    Some(t) => t,
                    None => {
                        warn!("completion report for unknown map task {}", id);
                        return;
                    }
                };
                if task.done {
                    return;
                }
                task.done = true;
                for (reduce_id, file) in files.into_iter().enumerate() {
                    // "" marks a partition the map emitted nothing for.
                    if !file.is_empty() {
                        if let Some(t) = self.reduce_tasks.get_mut(reduce_id) {
                            t.files.push(PathBuf::from(file));
                        }
                    }
                }
                self.map_remain -= 1;
                trace!("map task {} done, {} remaining", id, self.map_remain);
                if self.map_remain == 0 {
                    info!("map phase complete, entering reduce phase");
                }
            }
            Report::Reduce { id, output } => {
                let task = match self.reduce_tasks.get_mut(id) {
                    Some(t) => t,
                    None => {
                        warn!("completion report for unknown reduce task {}", id);
                        return;
                    }
                };
                if task.done {
                    return;
                }
                task.done = true;
                self.reduce_remain -= 1;
                trace!(
                    "reduce task {} done ({}), {} remaining",
                    id,
                    output.display(),
                    self.reduce_remain
                );
            }
        }
    }

    /// Step 2 of the handler: hand out the lowest-index task that is not
    /// done and not within its timeout window, stamping its start time.
    /// Reduce tasks only become assignable once every map task is done, so a
    /// reduce assignment always carries its partition's full file list.
    fn next_assignment(&mut self) -> Assignment {
        let now = Instant::now();
        let timeout = self.timeout;
        if self.map_remain > 0 {
            for t in self.map_tasks.iter_mut() {
                if !t.done && expired(t.started_at, now, timeout) {
                    if t.started_at.is_some() {
                        info!("map task {} timed out, reassigning", t.id);
                    }
                    t.started_at = Some(now);
                    return Assignment::Map {
                        id: t.id,
                        file: t.file.clone(),
                        n_reduce: self.reduce_tasks.len(),
                    };
                }
            }
            Assignment::Sleep
        } else if self.reduce_remain > 0 {
            for t in self.reduce_tasks.iter_mut() {
                if !t.done && expired(t.started_at, now, timeout) {
                    if t.started_at.is_some() {
                        info!("reduce task {} timed out, reassigning", t.id);
                    }
                    t.started_at = Some(now);
                    return Assignment::Reduce {
                        id: t.id,
                        files: t.files.clone(),
                    };
                }
            }
            Assignment::Sleep
        } else {
            Assignment::Exit
        }
    }
}

#[derive(Clone)]
struct CoordinatorServer {
    state: Arc<Mutex<State>>,
}

impl TaskService for CoordinatorServer {
    async fn get_task(self, _: tarpc::context::Context, report: Report) -> Assignment {
        let mut state = self.state.lock().unwrap();
        state.apply_report(report);
        state.next_assignment()
    }
}

/// Handle to a running coordinator. The RPC server runs on a background
/// task; the launcher polls [`Coordinator::done`] and tears the process down
/// once it returns true, which is also what tells lingering workers (via the
/// resulting transport error) that the job is over.
pub struct Coordinator {
    state: Arc<Mutex<State>>,
}

impl Coordinator {
    /// Create the task tables for `files` and `n_reduce` partitions and
    /// start serving assignments on the socket at `sock`. A stale socket
    /// file from a previous run is removed before binding.
    pub async fn serve(
        files: Vec<PathBuf>,
        n_reduce: usize,
        sock: &Path,
        timeout: Duration,
    ) -> anyhow::Result<Coordinator> {
        assert!(n_reduce > 0, "n_reduce must be non-zero");
        let state = Arc::new(Mutex::new(State::new(files, n_reduce, timeout)));
        {
            let s = state.lock().unwrap();
            info!(
                "coordinator has {} map tasks and {} reduce tasks to distribute",
                s.map_remain, s.reduce_remain
            );
        }

        let _ = fs::remove_file(sock);
        let listener = UnixListener::bind(sock)
            .with_context(|| format!("cannot bind {}", sock.display()))?;
        info!("coordinator listening on {}", sock.display());

        let server = CoordinatorServer {
            state: Arc::clone(&state),
        };
        tokio::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("accept error: {}", e);
                        continue;
                    }
                };
                let framed = LengthDelimitedCodec::builder()
                    .max_frame_length(MAX_FRAME_LENGTH)
                    .new_framed(stream);
                let transport = tarpc::serde_transport::new(framed, Json::default());
                let channel = server::BaseChannel::with_defaults(transport);
                let server = server.clone();
                tokio::spawn(channel.execute(server.serve()).for_each(|resp| async {
                    tokio::spawn(resp);
                }));
            }
        });

        Ok(Coordinator { state })
    }

    /// True once every map and reduce task has completed.
    pub fn done(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.map_remain == 0 && state.reduce_remain == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(n_map: usize, n_reduce: usize) -> State {
        let files = (0..n_map).map(|i| PathBuf::from(format!("in-{}", i))).collect();
        State::new(files, n_reduce, TASK_TIMEOUT)
    }

    fn check_counters(s: &State) {
        assert_eq!(s.map_remain, s.map_tasks.iter().filter(|t| !t.done).count());
        assert_eq!(
            s.reduce_remain,
            s.reduce_tasks.iter().filter(|t| !t.done).count()
        );
    }

    fn map_report(id: usize, files: &[&str]) -> Report {
        Report::Map {
            id,
            files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn rewind(started_at: &mut Option<Instant>, by: Duration) {
        *started_at = Some(started_at.unwrap() - by);
    }

    #[test]
    fn assigns_map_tasks_lowest_index_first() {
        let mut s = state(2, 1);
        match s.next_assignment() {
            Assignment::Map { id, file, n_reduce } => {
                assert_eq!(id, 0);
                assert_eq!(file, PathBuf::from("in-0"));
                assert_eq!(n_reduce, 1);
            }
            other => panic!("expected map assignment, got {:?}", other),
        }
        match s.next_assignment() {
            Assignment::Map { id, .. } => assert_eq!(id, 1),
            other => panic!("expected map assignment, got {:?}", other),
        }
        // Both in flight and within their window: nothing to hand out.
        assert!(matches!(s.next_assignment(), Assignment::Sleep));
        check_counters(&s);
    }

    #[test]
    fn no_reduce_assignment_until_all_maps_done() {
        let mut s = state(2, 2);
        s.next_assignment();
        s.next_assignment();
        s.apply_report(map_report(0, &["mr-0-0", "mr-0-1"]));
        check_counters(&s);
        assert_eq!(s.map_remain, 1);
        assert!(matches!(s.next_assignment(), Assignment::Sleep));

        s.apply_report(map_report(1, &["mr-1-0", ""]));
        assert_eq!(s.map_remain, 0);
        match s.next_assignment() {
            Assignment::Reduce { id, files } => {
                assert_eq!(id, 0);
                assert_eq!(files, vec![PathBuf::from("mr-0-0"), PathBuf::from("mr-1-0")]);
            }
            other => panic!("expected reduce assignment, got {:?}", other),
        }
        check_counters(&s);
    }

    #[test]
    fn timed_out_task_is_reassigned_with_fresh_start() {
        let mut s = state(1, 1);
        assert!(matches!(s.next_assignment(), Assignment::Map { id: 0, .. }));
        assert!(matches!(s.next_assignment(), Assignment::Sleep));

        rewind(&mut s.map_tasks[0].started_at, Duration::from_secs(11));
        let stale = s.map_tasks[0].started_at.unwrap();
        assert!(matches!(s.next_assignment(), Assignment::Map { id: 0, .. }));
        assert!(s.map_tasks[0].started_at.unwrap() > stale);
        // Freshly restarted, so back inside its window.
        assert!(matches!(s.next_assignment(), Assignment::Sleep));
        check_counters(&s);
    }

    #[test]
    fn duplicate_map_completion_is_ignored() {
        let mut s = state(1, 2);
        s.next_assignment();
        s.apply_report(map_report(0, &["mr-0-0", "mr-0-1"]));
        assert_eq!(s.map_remain, 0);
        assert_eq!(s.reduce_tasks[0].files, vec![PathBuf::from("mr-0-0")]);

        // The loser of a duplicate execution reports the same layout.
        s.apply_report(map_report(0, &["mr-0-0", "mr-0-1"]));
        assert_eq!(s.map_remain, 0);
        assert_eq!(s.reduce_tasks[0].files, vec![PathBuf::from("mr-0-0")]);
        assert_eq!(s.reduce_tasks[1].files, vec![PathBuf::from("mr-0-1")]);
        check_counters(&s);
    }

    #[test]
    fn duplicate_reduce_completion_is_ignored() {
        let mut s = state(0, 1);
        let report = Report::Reduce {
            id: 0,
            output: PathBuf::from("mr-out-0"),
        };
        s.apply_report(report.clone());
        assert_eq!(s.reduce_remain, 0);
        s.apply_report(report);
        assert_eq!(s.reduce_remain, 0);
        check_counters(&s);
    }

    #[test]
    fn empty_partition_adds_no_shuffle_file() {
        let mut s = state(1, 3);
        s.next_assignment();
        s.apply_report(map_report(0, &["mr-0-0", "", "mr-0-2"]));
        assert_eq!(s.reduce_tasks[0].files.len(), 1);
        assert!(s.reduce_tasks[1].files.is_empty());
        assert_eq!(s.reduce_tasks[2].files.len(), 1);
    }

    #[test]
    fn exit_once_everything_is_done() {
        let mut s = state(1, 1);
        s.next_assignment();
        s.apply_report(map_report(0, &["mr-0-0"]));
        assert!(matches!(s.next_assignment(), Assignment::Reduce { id: 0, .. }));
        s.apply_report(Report::Reduce {
            id: 0,
            output: PathBuf::from("mr-out-0"),
        });
        assert!(matches!(s.next_assignment(), Assignment::Exit));
        // Every later poll keeps replying Exit.
        assert!(matches!(s.next_assignment(), Assignment::Exit));
        check_counters(&s);
    }

    #[test]
    fn late_report_after_reassignment_is_a_noop() {
        let mut s = state(1, 1);
        s.next_assignment();
        rewind(&mut s.map_tasks[0].started_at, Duration::from_secs(11));
        // Worker B picks up the expired task and finishes it.
        s.next_assignment();
        s.apply_report(map_report(0, &["mr-0-0"]));
        let files = s.reduce_tasks[0].files.clone();
        // Worker A limps in afterwards.
        s.apply_report(map_report(0, &["mr-0-0"]));
        assert_eq!(s.map_remain, 0);
        assert_eq!(s.reduce_tasks[0].files, files);
        check_counters(&s);
    }

    #[test]
    fn reports_for_unknown_ids_are_dropped() {
        let mut s = state(1, 1);
        s.apply_report(map_report(7, &["mr-7-0"]));
        s.apply_report(Report::Reduce {
            id: 7,
            output: PathBuf::from("mr-out-7"),
        });
        assert_eq!(s.map_remain, 1);
        assert_eq!(s.reduce_remain, 1);
        check_counters(&s);
    }

    #[test]
    fn job_with_no_inputs_goes_straight_to_reduce() {
        let mut s = state(0, 2);
        assert_eq!(s.map_remain, 0);
        assert!(matches!(s.next_assignment(), Assignment::Reduce { id: 0, files } if files.is_empty()));
    }
}
