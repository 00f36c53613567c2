use crate::runtime::spawn_detached;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Serial executor backing a connection: jobs run one at a time, in order,
/// on a dedicated drain task. Every mutation of a connection's subscriptions
/// and every event delivery runs as a job here, which is what makes the
/// connection single-writer.
pub(crate) struct WorkQueue {
    tx: async_channel::Sender<Job>,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = async_channel::unbounded::<Job>();
        spawn_detached(async move {
            while let Ok(job) = rx.recv().await {
                job();
            }
        });
        Self { tx }
    }

    /// Enqueues a job. Sending never blocks (the channel is unbounded); a
    /// closed queue silently drops the job, which is the behaviour late
    /// callbacks want after a connection is disposed.
    pub(crate) fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.try_send(Box::new(job));
    }

    pub(crate) fn close(&self) {
        self.tx.close();
    }
}
