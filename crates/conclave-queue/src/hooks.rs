use crate::types::EventRecord;
use conclave_core::ConclaveResult;

/// Side effect run after a new record is committed (wake a worker, mirror to a
/// dashboard, ...). Failures are logged and never undo the append.
pub trait EnqueueHook: Send + Sync {
    fn on_enqueued(&self, record: &EventRecord) -> ConclaveResult<()>;
}

impl<F> EnqueueHook for F
where
    F: Fn(&EventRecord) -> ConclaveResult<()> + Send + Sync,
{
    fn on_enqueued(&self, record: &EventRecord) -> ConclaveResult<()> {
        self(record)
    }
}
