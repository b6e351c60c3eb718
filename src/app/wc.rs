//! Word count: the canonical MapReduce application.

use std::path::Path;

use crate::KeyValue;

pub fn map(_filename: &Path, contents: &str) -> Vec<KeyValue> {
    let mut cnt = Vec::new();
    for w in contents.split_whitespace() {
        cnt.push(KeyValue {
            key: w.to_owned(),
            value: "1".to_owned(),
        });
    }
    cnt
}

pub fn reduce(_key: &str, values: &[String]) -> String {
    values.len().to_string()
}
