//! A minimal MapReduce runtime for a single machine.
//!
//! A [`Coordinator`] owns the task state for one job and hands out work over
//! a local RPC socket; any number of [`Worker`] processes poll it, run the
//! user's map and reduce functions, and report results on their next poll.
//! Lost workers are tolerated by reassigning tasks that stay unfinished past
//! a timeout.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub mod app;
pub mod coordinator;
pub mod worker;

pub use coordinator::Coordinator;
pub use worker::Worker;

/// A single record emitted by a map function.
///
/// Serialized as `{"Key": "...", "Value": "..."}` in intermediate files, one
/// record per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: String,
}

/// A map function: `(input filename, full contents) -> records`.
pub type MapFn = fn(&Path, &str) -> Vec<KeyValue>;

/// A reduce function: `(key, all values for that key) -> one output value`.
pub type ReduceFn = fn(&str, &[String]) -> String;

/// What a worker finished since its previous poll, piggybacked on the next
/// [`TaskService::get_task`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Report {
    /// Nothing to report: first contact, or the worker just slept.
    None,
    /// A map task finished. `files[r]` is the intermediate file for reduce
    /// partition `r`, or `""` if the map emitted nothing for that partition.
    Map { id: usize, files: Vec<String> },
    /// A reduce task finished. The output path is informational only.
    Reduce { id: usize, output: PathBuf },
}

/// One unit of work (or a control directive) handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Assignment {
    /// Run the map function over one input file and partition the output
    /// into `n_reduce` intermediate files.
    Map {
        id: usize,
        file: PathBuf,
        n_reduce: usize,
    },
    /// Run the reduce function over one partition, assembled from the listed
    /// intermediate files.
    Reduce { id: usize, files: Vec<PathBuf> },
    /// No task is currently eligible; poll again shortly.
    Sleep,
    /// The job is finished; terminate.
    Exit,
}

#[tarpc::service]
pub trait TaskService {
    /// Report the previous task's outcome (if any) and get the next
    /// assignment. The coordinator applies the report and picks the
    /// assignment atomically, so duplicate reports are dropped and a reduce
    /// assignment always carries the complete file list for its partition.
    async fn get_task(report: Report) -> Assignment;
}

const FNV_OFFSET: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

/// 32-bit FNV-1a hash of the key, masked to a non-negative value.
/// The reduce partition for a key is `ihash(key) % n_reduce`.
pub fn ihash(key: &str) -> u32 {
    let mut h = FNV_OFFSET;
    for b in key.bytes() {
        h ^= u32::from(b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h & 0x7fffffff
}

/// Per-user socket path the coordinator binds and workers dial.
pub fn default_sock_path() -> PathBuf {
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/var/tmp/mapred-mr-{}", uid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ihash_matches_fnv1a_reference_vectors() {
        // Standard 32-bit FNV-1a vectors, high bit masked off.
        assert_eq!(ihash(""), 0x811c9dc5 & 0x7fffffff);
        assert_eq!(ihash("a"), 0xe40c292c & 0x7fffffff);
        assert_eq!(ihash("foobar"), 0xbf9cf968 & 0x7fffffff);
    }

    #[test]
    fn intermediate_record_wire_format() {
        let kv = KeyValue {
            key: "cat".to_owned(),
            value: "1".to_owned(),
        };
        assert_eq!(
            serde_json::to_string(&kv).unwrap(),
            r#"{"Key":"cat","Value":"1"}"#
        );
        let back: KeyValue = serde_json::from_str(r#"{"Key":"cat","Value":"1"}"#).unwrap();
        assert_eq!(back, kv);
    }
}
