//! Distributed product and nearest search.
//!
//! Both follow the same shape: the root broadcasts the problem size, scatters
//! its rows of the left operand by the shared partition policy, broadcasts
//! the right operand, every rank computes its rows locally, and the root
//! gathers the rows back in rank order.

use std::sync::Arc;

use tracing::{debug, info};

use crate::distribute::{share_dims, Communicator};
use crate::engine::{check_shapes, multiply_padded, TileEngine};
use crate::error::{dimension_error, Result};
use crate::kernel::TileOp;
use crate::matrix::Matrix;
use crate::nearest::{check_queries, Nearest, ReferenceSet};
use crate::partition::Partition;
use crate::reduce::ArgMin;
use crate::TILE;

/// Runs a local engine on each rank's rows of the output.
pub struct DistributedEngine<'c, C: Communicator, E: TileEngine> {
    comm: &'c C,
    local: E,
    non_blocking: bool,
}

impl<'c, C: Communicator, E: TileEngine> DistributedEngine<'c, C, E> {
    pub fn new(comm: &'c C, local: E) -> Self {
        DistributedEngine {
            comm,
            local,
            non_blocking: false,
        }
    }

    /// Issues the row scatter and the broadcast of `B` together and waits
    /// on both afterwards.
    pub fn with_non_blocking(mut self, non_blocking: bool) -> Self {
        self.non_blocking = non_blocking;
        self
    }

    pub fn comm(&self) -> &C {
        self.comm
    }
}

impl<C: Communicator, E: TileEngine> TileEngine for DistributedEngine<'_, C, E> {
    fn name(&self) -> &'static str {
        "distributed"
    }

    fn alignment(&self) -> usize {
        TILE
    }

    fn row_partition(&self, rows: usize) -> Result<Partition> {
        Partition::rows(rows, TILE, self.comm.size())
    }

    /// Only the root's operands are read and only the root's `c` is written.
    /// Every rank must call this together.
    fn multiply<Op: TileOp>(
        &self,
        a: &Matrix<Op::Elem>,
        b: &Matrix<Op::Elem>,
        c: &mut Matrix<Op::Acc>,
    ) -> Result<()> {
        let comm = self.comm;
        let dims = if comm.is_root() {
            check_shapes::<Op>(a, b, c).map(|()| [a.rows(), a.cols(), b.cols()])
        } else {
            Ok([0; 3])
        };
        let [p, q, r] = share_dims(comm, dims)?;
        let partition = self.row_partition(p)?;

        let a_part = partition.scaled(q);
        let b_root = comm.is_root().then(|| Arc::<[Op::Elem]>::from(b.as_slice()));
        let (a_local, b_shared) = if self.non_blocking {
            let scatter = comm.iscatterv(a.as_slice(), &a_part)?;
            let bcast = comm.ibroadcast(b_root)?;
            (scatter.wait()?, bcast.wait()?)
        } else {
            let a_local = comm.scatterv(a.as_slice(), &a_part)?;
            (a_local, comm.broadcast(b_root)?)
        };

        let rows = partition.range(comm.rank()).len();
        debug!(rank = comm.rank(), rows, "local rows received");
        let c_local = if rows == 0 {
            Vec::new()
        } else {
            let a_local = Matrix::new(rows, q, a_local)?;
            let b_local = Matrix::new(q, r, b_shared.to_vec())?;
            multiply_padded::<E, Op>(&self.local, &a_local, &b_local)?.into_vec()
        };

        if let Some(gathered) = comm.gatherv(&c_local, &partition.scaled(r))? {
            c.as_mut_slice().copy_from_slice(&gathered);
            info!(ranks = comm.size(), p, q, r, "distributed multiply done");
        }
        Ok(())
    }
}

/// Distributed nearest search. The root passes `Some` queries and
/// references; every other rank passes `None`. Queries are scattered one
/// feature vector at a time, the reference set is broadcast, and each rank
/// searches its share with `search`. The root returns `Some` results in query
/// order.
pub fn distributed_nearest<C, S>(
    comm: &C,
    search: &S,
    queries: Option<&Matrix<u8>>,
    refs: Option<&ReferenceSet>,
    non_blocking: bool,
) -> Result<Option<Vec<ArgMin>>>
where
    C: Communicator,
    S: Nearest + ?Sized,
{
    let dims = match (comm.is_root(), queries, refs) {
        (false, _, _) => Ok([0; 2]),
        (true, Some(queries), Some(refs)) => {
            check_queries(queries, refs).map(|()| [queries.rows(), refs.dim()])
        }
        (true, _, _) => Err(dimension_error("root must supply queries and references")),
    };
    let [total, dim] = share_dims(comm, dims)?;
    let partition = Partition::even(total, comm.size())?;

    let bytes: &[u8] = queries.map(Matrix::as_slice).unwrap_or_default();
    let refs_root = refs.filter(|_| comm.is_root()).cloned();
    let (local_bytes, refs) = if non_blocking {
        let scatter = comm.iscatterv(bytes, &partition.scaled(dim))?;
        let bcast = comm.ibroadcast(refs_root)?;
        (scatter.wait()?, bcast.wait()?)
    } else {
        let local_bytes = comm.scatterv(bytes, &partition.scaled(dim))?;
        (local_bytes, comm.broadcast(refs_root)?)
    };

    let rows = partition.range(comm.rank()).len();
    let local = if rows == 0 {
        Vec::new()
    } else {
        search.nearest(&Matrix::new(rows, dim, local_bytes)?, &refs)?
    };
    debug!(rank = comm.rank(), rows, "local search done");

    let indices: Vec<usize> = local.iter().map(|m| m.index).collect();
    let distances: Vec<i32> = local.iter().map(|m| m.distance).collect();
    let indices = comm.gatherv(&indices, &partition)?;
    let distances = comm.gatherv(&distances, &partition)?;
    Ok(indices.zip(distances).map(|(indices, distances)| {
        distances
            .into_iter()
            .zip(indices)
            .map(|(distance, index)| ArgMin::new(distance, index))
            .collect()
    }))
}
