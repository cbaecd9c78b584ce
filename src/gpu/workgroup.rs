//! Work-group execution model.
//!
//! A launch covers a global range of lanes cut into work-groups of the local
//! size. Each group is run by one host thread: every [`WorkGroup::phase`]
//! runs the given body for all lanes of the group before returning, so the
//! boundary between two phases is the actual local-memory fence. Lanes never
//! interleave, which means a kernel that forgets a barrier would still
//! compute the right answer here. To catch that, a phase must be separated
//! from the previous one by [`WorkGroup::barrier`]; a group that runs two
//! phases back to back fails the launch. Groups sharing a row of the grid
//! run one after the other; rows of groups run in parallel.

use std::cell::Cell;

use rayon::prelude::*;

use crate::error::{dimension_error, setup_error, Result};
use crate::gpu::device::DeviceInfo;

/// Global and local sizes of a 2-D launch, `[rows, cols]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NDRange {
    pub global: [usize; 2],
    pub local: [usize; 2],
}

impl NDRange {
    pub fn new(global: [usize; 2], local: [usize; 2]) -> Self {
        NDRange { global, local }
    }

    pub fn group_size(&self) -> usize {
        self.local[0] * self.local[1]
    }

    /// Work-groups along each axis.
    pub fn num_groups(&self) -> [usize; 2] {
        [
            self.global[0] / self.local[0].max(1),
            self.global[1] / self.local[1].max(1),
        ]
    }

    /// Checks the launch against device limits.
    pub fn validate(&self, info: &DeviceInfo, local_mem_bytes: usize) -> Result<()> {
        for axis in 0..2 {
            let (global, local) = (self.global[axis], self.local[axis]);
            if global == 0 || local == 0 || global % local != 0 {
                return Err(dimension_error(format!(
                    "global size {global} is not a non-zero multiple of local size {local} (axis {axis})"
                )));
            }
        }
        if self.group_size() > info.max_group_size {
            return Err(setup_error(
                info.name.clone(),
                format!(
                    "work-group of {} lanes exceeds the maximum {}",
                    self.group_size(),
                    info.max_group_size
                ),
            ));
        }
        if local_mem_bytes > info.local_mem {
            return Err(setup_error(
                info.name.clone(),
                format!(
                    "kernel needs {local_mem_bytes} bytes of local memory, device has {}",
                    info.local_mem
                ),
            ));
        }
        Ok(())
    }
}

/// Position of one lane within the launch.
#[derive(Debug, Clone, Copy)]
pub struct Lane {
    /// Linear index within the group, row-major over the local size.
    pub id: usize,
    pub local: [usize; 2],
    pub global: [usize; 2],
}

/// One executing work-group.
#[derive(Debug)]
pub struct WorkGroup {
    id: [usize; 2],
    num_groups: [usize; 2],
    local: [usize; 2],
    barriers: usize,
    /// A phase ran since the last barrier.
    open_phase: Cell<bool>,
    unfenced: Cell<usize>,
}

impl WorkGroup {
    fn new(id: [usize; 2], range: &NDRange) -> Self {
        WorkGroup {
            id,
            num_groups: range.num_groups(),
            local: range.local,
            barriers: 0,
            open_phase: Cell::new(false),
            unfenced: Cell::new(0),
        }
    }

    pub fn id(&self) -> [usize; 2] {
        self.id
    }

    pub fn num_groups(&self) -> [usize; 2] {
        self.num_groups
    }

    pub fn local_size(&self) -> [usize; 2] {
        self.local
    }

    pub fn size(&self) -> usize {
        self.local[0] * self.local[1]
    }

    /// Runs `body` once for every lane of the group. All lanes finish before
    /// this returns.
    pub fn phase(&self, mut body: impl FnMut(Lane)) {
        if self.open_phase.replace(true) {
            self.unfenced.set(self.unfenced.get() + 1);
        }
        let [ly_max, lx_max] = self.local;
        for ly in 0..ly_max {
            for lx in 0..lx_max {
                body(Lane {
                    id: ly * lx_max + lx,
                    local: [ly, lx],
                    global: [self.id[0] * ly_max + ly, self.id[1] * lx_max + lx],
                });
            }
        }
    }

    /// Local-memory fence between two phases. The ordering itself comes
    /// from [`WorkGroup::phase`]; this records the fence for [`LaunchStats`]
    /// and lets the next phase start.
    pub fn barrier(&mut self) {
        self.barriers += 1;
        self.open_phase.set(false);
    }

    pub fn barriers(&self) -> usize {
        self.barriers
    }

    /// Phases that started without a barrier after the previous one.
    pub fn unfenced_phases(&self) -> usize {
        self.unfenced.get()
    }
}

/// Outcome of one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchStats {
    pub groups: usize,
    /// Barriers executed by each group. Uniform across the launch.
    pub barriers_per_group: usize,
}

/// Runs `kernel` for every work-group of `range`.
///
/// `rows` holds one output view per row of groups; the groups of row `gy`
/// receive `rows[gy]` in turn, so writes from different rows never alias.
pub fn dispatch<O, F>(range: &NDRange, rows: Vec<O>, kernel: F) -> Result<LaunchStats>
where
    O: Send,
    F: Fn(&mut WorkGroup, &mut O) + Sync,
{
    let [groups_y, groups_x] = range.num_groups();
    if rows.len() != groups_y {
        return Err(dimension_error(format!(
            "launch has {groups_y} rows of groups but {} output views",
            rows.len()
        )));
    }

    let groups = rows
        .into_par_iter()
        .enumerate()
        .map(|(gy, mut view)| {
            (0..groups_x)
                .map(|gx| {
                    let mut group = WorkGroup::new([gy, gx], range);
                    kernel(&mut group, &mut view);
                    (group.barriers(), group.unfenced_phases())
                })
                .collect::<Vec<_>>()
        })
        .flatten()
        .collect::<Vec<_>>();

    let unfenced: usize = groups.iter().map(|&(_, u)| u).sum();
    if unfenced > 0 {
        return Err(setup_error(
            "work-group",
            format!("{unfenced} phases started without a barrier after the previous phase"),
        ));
    }
    let barriers = groups.into_iter().map(|(b, _)| b).collect::<Vec<_>>();

    let barriers_per_group = barriers.first().copied().unwrap_or(0);
    if barriers.iter().any(|&b| b != barriers_per_group) {
        return Err(setup_error("work-group", "barrier count diverged between groups"));
    }
    Ok(LaunchStats {
        groups: barriers.len(),
        barriers_per_group,
    })
}
