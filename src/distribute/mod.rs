//! Collective communication between ranks.
//!
//! A [`Communicator`] connects `size` ranks; rank [`ROOT`] owns the full
//! operands and the final result. Only collectives are offered: every rank
//! must call the same collectives in the same order. The non-blocking
//! variants start the operation and return a [`Request`]; the data must not
//! be used before [`Request::wait`] returns it.

pub mod engine;
pub mod local;

pub use engine::{distributed_nearest, DistributedEngine};
pub use local::{LocalCluster, LocalComm};

use crate::error::{dimension_error, Result};
use crate::partition::Partition;

/// Rank that scatters operands and gathers results.
pub const ROOT: usize = 0;

/// An outstanding non-blocking collective.
#[must_use = "a request must be waited before its data is used"]
pub struct Request<'c, T> {
    complete: Box<dyn FnOnce() -> Result<T> + 'c>,
}

impl<'c, T: 'c> Request<'c, T> {
    /// A request whose data is already available.
    pub fn ready(value: T) -> Self {
        Request {
            complete: Box::new(move || Ok(value)),
        }
    }

    /// A request completed by `complete` on [`Request::wait`].
    pub fn deferred(complete: impl FnOnce() -> Result<T> + 'c) -> Self {
        Request {
            complete: Box::new(complete),
        }
    }

    /// Blocks until the collective has delivered this rank's data.
    pub fn wait(self) -> Result<T> {
        (self.complete)()
    }
}

pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn is_root(&self) -> bool {
        self.rank() == ROOT
    }

    /// Starts a broadcast of the root's `value`. Only the root passes `Some`;
    /// other ranks pass `None` and receive the root's value.
    fn ibroadcast<T>(&self, value: Option<T>) -> Result<Request<'_, T>>
    where
        T: Clone + Send + 'static;

    /// Starts scattering `data[partition.range(r)]` from the root to every
    /// rank `r`. `data` is only read on the root.
    fn iscatterv<T>(&self, data: &[T], partition: &Partition) -> Result<Request<'_, Vec<T>>>
    where
        T: Copy + Send + 'static;

    /// Starts gathering every rank's `local` slice into the root at the
    /// offsets of `partition`. The root's request yields `Some(all)`, every
    /// other rank's yields `None`.
    fn igatherv<T>(&self, local: &[T], partition: &Partition) -> Result<Request<'_, Option<Vec<T>>>>
    where
        T: Copy + Send + 'static;

    /// Blocks until every rank has reached the barrier.
    fn barrier(&self) -> Result<()>;

    fn broadcast<T>(&self, value: Option<T>) -> Result<T>
    where
        T: Clone + Send + 'static,
    {
        self.ibroadcast(value)?.wait()
    }

    fn scatterv<T>(&self, data: &[T], partition: &Partition) -> Result<Vec<T>>
    where
        T: Copy + Send + 'static,
    {
        self.iscatterv(data, partition)?.wait()
    }

    fn gatherv<T>(&self, local: &[T], partition: &Partition) -> Result<Option<Vec<T>>>
    where
        T: Copy + Send + 'static,
    {
        self.igatherv(local, partition)?.wait()
    }
}

/// Broadcasts the dimensions the root validated. If the root rejected its
/// operands, every rank returns an error instead of waiting on collectives
/// the root will never start.
pub fn share_dims<C, const N: usize>(comm: &C, dims: Result<[usize; N]>) -> Result<[usize; N]>
where
    C: Communicator,
{
    if comm.is_root() {
        comm.broadcast(Some(dims.as_ref().ok().copied()))?;
        dims
    } else {
        comm.broadcast::<Option<[usize; N]>>(None)?
            .ok_or_else(|| dimension_error("root rejected the operands"))
    }
}

/// Checks that `partition` assigns one range to every rank of `comm`.
pub(crate) fn check_partition<C: Communicator>(comm: &C, partition: &Partition) -> Result<()> {
    if partition.workers() != comm.size() {
        return Err(dimension_error(format!(
            "partition has {} ranges for {} ranks",
            partition.workers(),
            comm.size()
        )));
    }
    Ok(())
}
