use fanout_transport::PeerId;

use crate::phase::WorkUnitIndex;

/// Error returned by a [`WorkProcessor`]. Any error type converts into it.
pub type ProcessError = Box<dyn std::error::Error + Send + Sync>;

/// Executor-side compute callback.
///
/// Called from worker threads with the thread index, the unit to compute and
/// a buffer for the result payload. An error is fatal for the whole process:
/// it triggers early exit and surfaces from `distribute_work`.
pub trait WorkProcessor: Send + Sync {
    fn process(
        &self,
        thread: usize,
        unit: WorkUnitIndex,
        output: &mut Vec<u8>,
    ) -> Result<(), ProcessError>;
}

impl<F> WorkProcessor for F
where
    F: Fn(usize, WorkUnitIndex, &mut Vec<u8>) -> Result<(), ProcessError> + Send + Sync,
{
    fn process(
        &self,
        thread: usize,
        unit: WorkUnitIndex,
        output: &mut Vec<u8>,
    ) -> Result<(), ProcessError> {
        self(thread, unit, output)
    }
}

/// Coordinator-side merge callback, invoked once per accepted unit.
pub trait WorkReceiver: Send {
    fn receive(&mut self, unit: WorkUnitIndex, payload: &[u8], from: PeerId);
}

impl<F> WorkReceiver for F
where
    F: FnMut(WorkUnitIndex, &[u8], PeerId) + Send,
{
    fn receive(&mut self, unit: WorkUnitIndex, payload: &[u8], from: PeerId) {
        self(unit, payload, from)
    }
}

/// Receiver for executors, which never merge results.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardResults;

impl WorkReceiver for DiscardResults {
    fn receive(&mut self, _unit: WorkUnitIndex, _payload: &[u8], _from: PeerId) {}
}
