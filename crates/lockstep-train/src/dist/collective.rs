//! Cross-rank collective operations.
//!
//! Every backend sums contributions in rank order, so all ranks end a
//! reduction holding bit-identical buffers.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::{JobError, JobResult};

/// Blocking collective primitives over a fixed group of ranks.
///
/// Calls have no timeout: a rank that never arrives stalls the group.
pub trait Collective: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Replace `buf` on every rank with the element-wise sum over all ranks.
    fn all_reduce_sum(&mut self, buf: &mut [f32]) -> JobResult<()>;

    /// Replace `buf` on every rank with the contents of `root`'s buffer.
    fn broadcast(&mut self, buf: &mut [f32], root: usize) -> JobResult<()>;

    fn is_main(&self) -> bool {
        self.rank() == 0
    }

    /// Mean of one scalar across ranks.
    fn all_reduce_mean(&mut self, value: f64) -> JobResult<f64> {
        let mut buf = [value as f32];
        self.all_reduce_sum(&mut buf)?;
        Ok(buf[0] as f64 / self.world_size() as f64)
    }
}

/// A group of one. Reductions are identity operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&mut self, _buf: &mut [f32]) -> JobResult<()> {
        Ok(())
    }

    fn broadcast(&mut self, _buf: &mut [f32], root: usize) -> JobResult<()> {
        check_root(0, 1, root)
    }
}

struct LocalShared {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Vec<f32>>>>,
}

/// One rank of an in-process group; every rank runs on its own thread.
pub struct LocalCollective {
    rank: usize,
    world_size: usize,
    shared: Arc<LocalShared>,
}

/// Builds the ranks of an in-process group.
pub struct LocalGroup;

impl LocalGroup {
    pub fn new(world_size: usize) -> Vec<LocalCollective> {
        let world_size = world_size.max(1);
        let shared = Arc::new(LocalShared {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });
        (0..world_size)
            .map(|rank| LocalCollective {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl LocalCollective {
    fn publish(&self, buf: &[f32]) -> JobResult<()> {
        let mut slots = self.shared.slots.lock().map_err(|_| self.poisoned())?;
        slots[self.rank] = Some(buf.to_vec());
        Ok(())
    }

    fn poisoned(&self) -> JobError {
        JobError::Collective {
            rank: self.rank,
            message: "peer thread panicked while holding the exchange lock".to_string(),
        }
    }

    fn length_mismatch(&self, peer: usize, expected: usize, got: usize) -> JobError {
        JobError::Collective {
            rank: self.rank,
            message: format!(
                "buffer length mismatch: rank {} sent {} elements, expected {}",
                peer, got, expected
            ),
        }
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&mut self, buf: &mut [f32]) -> JobResult<()> {
        self.publish(buf)?;
        self.shared.barrier.wait();

        let result = (|| {
            let slots = self.shared.slots.lock().map_err(|_| self.poisoned())?;
            let mut acc = vec![0.0f32; buf.len()];
            for (peer, slot) in slots.iter().enumerate() {
                let contribution = slot.as_deref().unwrap_or(&[]);
                if contribution.len() != buf.len() {
                    return Err(self.length_mismatch(peer, buf.len(), contribution.len()));
                }
                for (a, &v) in acc.iter_mut().zip(contribution) {
                    *a += v;
                }
            }
            Ok(acc)
        })();

        // Nobody may republish until every rank has read the slots.
        self.shared.barrier.wait();
        buf.copy_from_slice(&result?);
        Ok(())
    }

    fn broadcast(&mut self, buf: &mut [f32], root: usize) -> JobResult<()> {
        check_root(self.rank, self.world_size, root)?;
        if self.rank == root {
            self.publish(buf)?;
        }
        self.shared.barrier.wait();

        let result = (|| {
            let slots = self.shared.slots.lock().map_err(|_| self.poisoned())?;
            let source = slots[root].as_deref().unwrap_or(&[]);
            if source.len() != buf.len() {
                return Err(self.length_mismatch(root, buf.len(), source.len()));
            }
            Ok(source.to_vec())
        })();

        self.shared.barrier.wait();
        buf.copy_from_slice(&result?);
        Ok(())
    }
}

pub(crate) fn check_root(rank: usize, world_size: usize, root: usize) -> JobResult<()> {
    if root >= world_size {
        return Err(JobError::Collective {
            rank,
            message: format!("broadcast root {} out of range for world size {}", root, world_size),
        });
    }
    Ok(())
}
