use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::JobRecord;

/// Outcome of one processing attempt.
///
/// A failure is data, not an error: it is recorded on the job and drives the
/// retry / dead-letter path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResult {
    pub success: bool,
    pub transaction_hash: Option<String>,
    pub error: Option<String>,

    /// `false` sends a failed job straight to the dead-letter queue
    #[serde(default = "retryable_default")]
    pub retryable: bool,
}

fn retryable_default() -> bool {
    true
}

impl ProcessResult {
    pub fn success(transaction_hash: impl Into<String>) -> Self {
        Self {
            success: true,
            transaction_hash: Some(transaction_hash.into()),
            error: None,
            retryable: true,
        }
    }

    /// Success without a result token
    pub fn done() -> Self {
        Self {
            success: true,
            transaction_hash: None,
            error: None,
            retryable: true,
        }
    }

    /// Retryable failure
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction_hash: None,
            error: Some(error.into()),
            retryable: true,
        }
    }

    /// Failure that no amount of retrying will fix
    pub fn permanent(error: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::failure(error)
        }
    }

    /// Error message recorded on the job for a failed attempt
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "processor reported failure without a message".to_string())
    }
}

impl<E: std::fmt::Display> From<Result<String, E>> for ProcessResult {
    fn from(result: Result<String, E>) -> Self {
        match result {
            Ok(hash) => Self::success(hash),
            Err(e) => Self::failure(e.to_string()),
        }
    }
}

/// Performs one attempt of the actual work, e.g. submitting a transaction.
///
/// Must be safe to call again for the same job after a transient failure.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &JobRecord) -> ProcessResult;
}

#[async_trait]
impl<F, Fut> Processor for F
where
    F: Fn(JobRecord) -> Fut + Send + Sync,
    Fut: Future<Output = ProcessResult> + Send + 'static,
{
    async fn process(&self, job: &JobRecord) -> ProcessResult {
        (self)(job.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_constructors() {
        let ok = ProcessResult::success("0x123");
        assert!(ok.success);
        assert_eq!(ok.transaction_hash.as_deref(), Some("0x123"));

        let failed = ProcessResult::failure("nonce too low");
        assert!(!failed.success);
        assert!(failed.retryable);
        assert_eq!(failed.error_message(), "nonce too low");

        let permanent = ProcessResult::permanent("contract reverted");
        assert!(!permanent.retryable);
    }

    #[test]
    fn test_from_result() {
        let ok: ProcessResult = Ok::<_, String>("0xabc".to_string()).into();
        assert_eq!(ok, ProcessResult::success("0xabc"));

        let err: ProcessResult = Err::<String, _>("rpc down").into();
        assert_eq!(err, ProcessResult::failure("rpc down"));
    }

    #[tokio::test]
    async fn test_closure_processor() {
        let processor = |job: JobRecord| async move {
            ProcessResult::success(format!("0x{}", job.job_type.len()))
        };
        let job = JobRecord::new(
            "MINT_TOKEN".to_string(),
            json!({}),
            "k".to_string(),
            1,
            Utc::now(),
        );
        assert_eq!(processor.process(&job).await, ProcessResult::success("0x10"));
    }
}
