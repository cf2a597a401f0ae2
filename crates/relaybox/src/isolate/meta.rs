//! Meta file parsing for isolate
//!
//! Isolate writes `key:value` lines describing how the sandboxed process
//! ended. Unknown keys are kept, malformed lines are skipped.

use std::collections::HashMap;
use std::path::Path;

use crate::isolate::IsolateError;
use crate::types::{ExecutionResult, ExecutionStatus, LimitExceeded};

#[derive(Debug, Clone, Default)]
pub struct MetaFile {
    pub entries: HashMap<String, String>,
}

impl MetaFile {
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim(), value.trim()))
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        Self { entries }
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, IsolateError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(Self::parse(&content))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn status(&self) -> ExecutionStatus {
        self.get("status")
            .map(ExecutionStatus::from_isolate_status)
            .unwrap_or(ExecutionStatus::Ok)
    }

    /// CPU time used in seconds
    pub fn time(&self) -> f64 {
        self.get_parsed("time").unwrap_or(0.0)
    }

    /// Wall clock time used in seconds
    pub fn wall_time(&self) -> f64 {
        self.get_parsed("time-wall").unwrap_or(0.0)
    }

    /// Peak memory in kilobytes, preferring the cgroup figure
    pub fn memory(&self) -> u64 {
        self.get_parsed("cg-mem")
            .or_else(|| self.get_parsed("max-rss"))
            .unwrap_or(0)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.get_parsed("exitcode")
    }

    pub fn signal(&self) -> Option<i32> {
        self.get_parsed("exitsig")
    }

    pub fn message(&self) -> Option<String> {
        self.get("message").map(String::from)
    }

    /// Determine which limit was exceeded based on status and message
    pub fn limit_exceeded(&self) -> LimitExceeded {
        let from_message = LimitExceeded::from_message(self.get("message"));
        if from_message.is_exceeded() {
            return from_message;
        }
        if self.status() == ExecutionStatus::TimeLimitExceeded {
            return LimitExceeded::Time;
        }
        LimitExceeded::NotExceeded
    }

    pub fn to_execution_result(&self) -> ExecutionResult {
        ExecutionResult {
            status: self.status(),
            limit_exceeded: self.limit_exceeded(),
            time: self.time(),
            wall_time: self.wall_time(),
            memory: self.memory(),
            exit_code: self.exit_code(),
            signal: self.signal(),
            message: self.message(),
        }
    }
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn parse_does_not_panic(content in ".*") {
            let _ = MetaFile::parse(&content);
        }

        #[test]
        fn parse_valid_key_value_pairs(
            key in "[a-z_-]+",
            value in "[a-zA-Z0-9._-]*"
        ) {
            let meta = MetaFile::parse(&format!("{key}:{value}"));
            prop_assert_eq!(meta.get(&key), Some(value.as_str()));
        }
    }
}
