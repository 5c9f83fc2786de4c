use thiserror::Error;

/// Errors surfaced by the ingestion, storage and fan-out pipeline.
///
/// Transient kinds are absorbed by the calling loop with counters and
/// backoff; fatal kinds escalate to the operator surface.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No rate-governor permit became available before the acquire timeout.
    #[error("rate governor stalled: no permit within {waited_ms} ms")]
    RateStalled { waited_ms: u64 },

    /// Retries against the upstream provider were exhausted.
    #[error("upstream unavailable after {attempts} attempts: {last_error}")]
    UpstreamUnavailable { attempts: u32, last_error: String },

    /// The provider rejected the request with a non-429 4xx.
    #[error("upstream rejected request: HTTP {status}: {body}")]
    UpstreamRejected { status: u16, body: String },

    /// The provider answered but the payload failed shape validation.
    #[error("upstream payload malformed: {cause}")]
    UpstreamMalformed { cause: String },

    /// Storage failure that survived the per-batch retry policy.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Catch-up was requested for a sequence older than the served horizon.
    #[error("catch-up unavailable: requested seq {requested} is beyond the horizon (oldest {oldest})")]
    CatchupUnavailable { requested: u64, oldest: u64 },

    /// A subscriber could not drain its send buffer in time.
    #[error("slow consumer disconnected after {stalled_secs} s of back-pressure")]
    SlowConsumer { stalled_secs: u64 },

    /// A typed queue refused a message (full or closed).
    #[error("queue {queue} rejected message: {reason}")]
    QueueRejected { queue: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid job schedule `{spec}`: {cause}")]
    Schedule { spec: String, cause: String },
}

impl EngineError {
    /// Transient errors are retried or skipped; everything else fails the task.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::RateStalled { .. }
                | EngineError::UpstreamUnavailable { .. }
                | EngineError::Storage(sqlx::Error::PoolTimedOut)
                | EngineError::Storage(sqlx::Error::Io(_))
        )
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
