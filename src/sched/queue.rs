use crate::error::{EngineError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Workload classes. Each gets its own bounded queue and worker pool so a
/// slow class never starves another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Live,
    Fixtures,
    Prematch,
    Frames,
    Finalizer,
    Maintenance,
}

impl QueueName {
    pub const ALL: [QueueName; 6] = [
        QueueName::Live,
        QueueName::Fixtures,
        QueueName::Prematch,
        QueueName::Frames,
        QueueName::Finalizer,
        QueueName::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Live => "live",
            QueueName::Fixtures => "fixtures",
            QueueName::Prematch => "prematch",
            QueueName::Frames => "frames",
            QueueName::Finalizer => "finalizer",
            QueueName::Maintenance => "maintenance",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "live" => QueueName::Live,
            "fixtures" => QueueName::Fixtures,
            "prematch" => QueueName::Prematch,
            "frames" => QueueName::Frames,
            "finalizer" => QueueName::Finalizer,
            "maintenance" => QueueName::Maintenance,
            _ => return None,
        })
    }

    /// Per-class defaults: (max length, message TTL, worker concurrency).
    pub fn settings(&self) -> QueueSettings {
        match self {
            QueueName::Live => QueueSettings {
                max_len: 8,
                ttl: Duration::from_secs(25),
                concurrency: 2,
            },
            QueueName::Fixtures => QueueSettings {
                max_len: 4,
                ttl: Duration::from_secs(3600),
                concurrency: 1,
            },
            QueueName::Prematch => QueueSettings {
                max_len: 4,
                ttl: Duration::from_secs(3600),
                concurrency: 1,
            },
            QueueName::Frames => QueueSettings {
                max_len: 4,
                ttl: Duration::from_secs(55),
                concurrency: 1,
            },
            QueueName::Finalizer => QueueSettings {
                max_len: 8,
                ttl: Duration::from_secs(600),
                concurrency: 1,
            },
            QueueName::Maintenance => QueueSettings {
                max_len: 4,
                ttl: Duration::from_secs(6 * 3600),
                concurrency: 1,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub max_len: usize,
    pub ttl: Duration,
    pub concurrency: usize,
}

/// One unit of work flowing through a queue.
#[derive(Debug, Clone)]
pub struct JobMessage {
    pub run_id: Uuid,
    pub job_name: String,
    pub attempt: u32,
    pub enqueued_at: Instant,
    pub ttl: Duration,
    pub soft_limit: Duration,
    pub hard_limit: Duration,
    pub max_retries: u32,
}

impl JobMessage {
    pub fn expired(&self) -> bool {
        self.enqueued_at.elapsed() > self.ttl
    }
}

/// Bounded producer side of a typed queue; depth is tracked for the health
/// probe.
pub struct WorkQueue {
    name: QueueName,
    tx: mpsc::Sender<JobMessage>,
    depth: Arc<AtomicUsize>,
}

pub struct WorkQueueConsumer {
    pub name: QueueName,
    pub rx: mpsc::Receiver<JobMessage>,
    pub depth: Arc<AtomicUsize>,
    pub concurrency: usize,
}

impl WorkQueue {
    pub fn bounded(name: QueueName) -> (Self, WorkQueueConsumer) {
        let settings = name.settings();
        let (tx, rx) = mpsc::channel(settings.max_len);
        let depth = Arc::new(AtomicUsize::new(0));
        (
            Self {
                name,
                tx,
                depth: depth.clone(),
            },
            WorkQueueConsumer {
                name,
                rx,
                depth,
                concurrency: settings.concurrency,
            },
        )
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Non-blocking enqueue; a full queue rejects the message.
    pub fn enqueue(&self, message: JobMessage) -> Result<()> {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(EngineError::QueueRejected {
                queue: self.name.as_str(),
                reason: "queue full".into(),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::QueueRejected {
                queue: self.name.as_str(),
                reason: "queue closed".into(),
            }),
        }
    }
}

impl WorkQueueConsumer {
    /// Receive the next message, decrementing the depth gauge.
    pub async fn recv(&mut self) -> Option<JobMessage> {
        let message = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(name: &str) -> JobMessage {
        JobMessage {
            run_id: Uuid::new_v4(),
            job_name: name.to_string(),
            attempt: 0,
            enqueued_at: Instant::now(),
            ttl: Duration::from_secs(30),
            soft_limit: Duration::from_secs(10),
            hard_limit: Duration::from_secs(20),
            max_retries: 0,
        }
    }

    #[tokio::test]
    async fn queue_tracks_depth_and_rejects_overflow() {
        let (queue, mut consumer) = WorkQueue::bounded(QueueName::Frames);
        let max = QueueName::Frames.settings().max_len;
        for _ in 0..max {
            queue.enqueue(message("frame_maker")).unwrap();
        }
        assert_eq!(queue.depth(), max);
        let err = queue.enqueue(message("frame_maker")).unwrap_err();
        assert!(matches!(err, EngineError::QueueRejected { queue: "frames", .. }));

        let received = consumer.recv().await.unwrap();
        assert_eq!(received.job_name, "frame_maker");
        assert_eq!(queue.depth(), max - 1);
        // Room again after consuming one.
        queue.enqueue(message("frame_maker")).unwrap();
    }

    #[test]
    fn ttl_expiry() {
        let mut msg = message("live_trigger");
        assert!(!msg.expired());
        msg.enqueued_at = Instant::now() - Duration::from_secs(60);
        assert!(msg.expired());
    }

    #[test]
    fn queue_names_round_trip() {
        for name in QueueName::ALL {
            assert_eq!(QueueName::parse(name.as_str()), Some(name));
        }
        assert_eq!(QueueName::parse("nope"), None);
    }
}
