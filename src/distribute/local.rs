//! In-process ranks connected by channels.
//!
//! [`LocalCluster::run`] starts one scoped thread per rank and hands each a
//! [`LocalComm`]. Every collective call takes the next sequence number as its
//! tag; since all ranks issue collectives in the same order, matching calls
//! carry matching tags. A message that arrives while a rank is waiting for a
//! different tag is stashed until it is asked for.
//!
//! When a rank's endpoint is dropped (its closure returned or panicked) it
//! tells every peer it has left. Channels keep per-sender order, so anything
//! the rank sent before leaving is still delivered first; a peer waiting for
//! a message that can no longer come gets a transfer error instead of
//! blocking.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use tracing::{debug, trace};

use crate::distribute::{check_partition, Communicator, Request, ROOT};
use crate::error::{dimension_error, setup_error, transfer_error, validation_error, Result};
use crate::partition::Partition;

struct Envelope {
    from: usize,
    tag: u64,
    payload: Box<dyn Any + Send>,
}

enum Message {
    Data(Envelope),
    Exited(usize),
}

/// One rank's endpoint.
pub struct LocalComm {
    rank: usize,
    size: usize,
    /// Senders to every other rank; `None` at this rank's own index so the
    /// inbox disconnects once all peers are gone.
    peers: Vec<Option<Sender<Message>>>,
    inbox: Receiver<Message>,
    stash: RefCell<Vec<Envelope>>,
    exited: RefCell<Vec<bool>>,
    seq: Cell<u64>,
}

impl LocalComm {
    fn next_tag(&self) -> u64 {
        let tag = self.seq.get();
        self.seq.set(tag + 1);
        tag
    }

    fn send<T: Send + 'static>(&self, to: usize, tag: u64, payload: T) -> Result<()> {
        trace!(from = self.rank, to, tag, "send");
        let peer = self.peers[to]
            .as_ref()
            .ok_or_else(|| transfer_error(to, "a rank cannot send to itself"))?;
        peer.send(Message::Data(Envelope {
            from: self.rank,
            tag,
            payload: Box::new(payload),
        }))
        .map_err(|_| transfer_error(to, "rank has exited"))
    }

    fn recv<T: 'static>(&self, from: usize, tag: u64) -> Result<T> {
        let envelope = match self.take_stashed(from, tag) {
            Some(envelope) => envelope,
            None => loop {
                if self.exited.borrow()[from] {
                    return Err(transfer_error(
                        from,
                        format!("rank exited before sending tag {tag}"),
                    ));
                }
                match self.inbox.recv() {
                    Ok(Message::Data(envelope)) if envelope.from == from && envelope.tag == tag => {
                        break envelope;
                    }
                    Ok(Message::Data(envelope)) => self.stash.borrow_mut().push(envelope),
                    Ok(Message::Exited(rank)) => {
                        debug!(rank = self.rank, peer = rank, "peer exited");
                        self.exited.borrow_mut()[rank] = true;
                    }
                    Err(_) => return Err(transfer_error(from, "all peers disconnected")),
                }
            },
        };
        envelope
            .payload
            .downcast::<T>()
            .map(|payload| *payload)
            .map_err(|_| transfer_error(from, format!("unexpected payload type for tag {tag}")))
    }

    fn take_stashed(&self, from: usize, tag: u64) -> Option<Envelope> {
        let mut stash = self.stash.borrow_mut();
        let pos = stash.iter().position(|e| e.from == from && e.tag == tag)?;
        Some(stash.swap_remove(pos))
    }
}

impl Drop for LocalComm {
    fn drop(&mut self) {
        for peer in self.peers.iter().flatten() {
            // A peer that already left has nobody to tell.
            let _ = peer.send(Message::Exited(self.rank));
        }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn ibroadcast<T>(&self, value: Option<T>) -> Result<Request<'_, T>>
    where
        T: Clone + Send + 'static,
    {
        let tag = self.next_tag();
        if self.is_root() {
            let value =
                value.ok_or_else(|| validation_error("root must supply the broadcast value"))?;
            for peer in (0..self.size).filter(|&r| r != ROOT) {
                self.send(peer, tag, value.clone())?;
            }
            Ok(Request::ready(value))
        } else {
            Ok(Request::deferred(move || self.recv::<T>(ROOT, tag)))
        }
    }

    fn iscatterv<T>(&self, data: &[T], partition: &Partition) -> Result<Request<'_, Vec<T>>>
    where
        T: Copy + Send + 'static,
    {
        check_partition(self, partition)?;
        let tag = self.next_tag();
        if self.is_root() {
            if data.len() != partition.total() {
                return Err(dimension_error(format!(
                    "scatter of {} elements with a partition of {}",
                    data.len(),
                    partition.total()
                )));
            }
            for peer in (0..self.size).filter(|&r| r != ROOT) {
                self.send(peer, tag, data[partition.range(peer)].to_vec())?;
            }
            Ok(Request::ready(data[partition.range(ROOT)].to_vec()))
        } else {
            let expected = partition.range(self.rank).len();
            Ok(Request::deferred(move || {
                let part = self.recv::<Vec<T>>(ROOT, tag)?;
                if part.len() != expected {
                    return Err(transfer_error(
                        ROOT,
                        format!("expected {expected} elements, got {}", part.len()),
                    ));
                }
                Ok(part)
            }))
        }
    }

    fn igatherv<T>(&self, local: &[T], partition: &Partition) -> Result<Request<'_, Option<Vec<T>>>>
    where
        T: Copy + Send + 'static,
    {
        check_partition(self, partition)?;
        let own = partition.range(self.rank);
        if local.len() != own.len() {
            return Err(dimension_error(format!(
                "rank {} gathers {} elements, partition assigns {}",
                self.rank,
                local.len(),
                own.len()
            )));
        }
        let tag = self.next_tag();
        if !self.is_root() {
            self.send(ROOT, tag, local.to_vec())?;
            return Ok(Request::ready(None));
        }

        let mut all = Vec::with_capacity(partition.total());
        all.extend_from_slice(local);
        let partition = partition.clone();
        Ok(Request::deferred(move || {
            // Ranges are contiguous and ordered, so appending rank by rank
            // places every part at its offset.
            for peer in (0..self.size).filter(|&r| r != ROOT) {
                let part = self.recv::<Vec<T>>(peer, tag)?;
                if part.len() != partition.range(peer).len() {
                    return Err(transfer_error(
                        peer,
                        format!(
                            "expected {} elements, got {}",
                            partition.range(peer).len(),
                            part.len()
                        ),
                    ));
                }
                all.extend_from_slice(&part);
            }
            Ok(Some(all))
        }))
    }

    fn barrier(&self) -> Result<()> {
        let tag = self.next_tag();
        if self.is_root() {
            for peer in (0..self.size).filter(|&r| r != ROOT) {
                self.recv::<()>(peer, tag)?;
            }
            for peer in (0..self.size).filter(|&r| r != ROOT) {
                self.send(peer, tag, ())?;
            }
        } else {
            self.send(ROOT, tag, ())?;
            self.recv::<()>(ROOT, tag)?;
        }
        Ok(())
    }
}

/// A group of in-process ranks.
pub struct LocalCluster;

impl LocalCluster {
    /// Runs `f` on `size` ranks, each on its own thread, and returns the
    /// per-rank results in rank order.
    pub fn run<F, R>(size: usize, f: F) -> Result<Vec<R>>
    where
        F: Fn(LocalComm) -> R + Sync,
        R: Send,
    {
        if size == 0 {
            return Err(setup_error("cluster", "rank count must be at least 1"));
        }
        let (senders, inboxes): (Vec<_>, Vec<_>) = (0..size).map(|_| mpsc::channel()).unzip();
        let comms = inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalComm {
                rank,
                size,
                peers: senders
                    .iter()
                    .enumerate()
                    .map(|(peer, sender)| (peer != rank).then(|| sender.clone()))
                    .collect(),
                inbox,
                stash: RefCell::new(Vec::new()),
                exited: RefCell::new(vec![false; size]),
                seq: Cell::new(0),
            })
            .collect::<Vec<_>>();
        drop(senders);
        debug!(size, "starting local cluster");

        let f = &f;
        thread::scope(|s| {
            let handles = comms
                .into_iter()
                .map(|comm| {
                    let rank = comm.rank;
                    thread::Builder::new()
                        .name(format!("rank-{rank}"))
                        .spawn_scoped(s, move || f(comm))
                        .map_err(|e| setup_error(format!("rank {rank}"), e.to_string()))
                })
                .collect::<Result<Vec<_>>>()?;

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .map_err(|_| transfer_error(rank, "rank panicked"))
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_and_size() {
        let ranks = LocalCluster::run(3, |comm| (comm.rank(), comm.size())).unwrap();
        assert_eq!(ranks, vec![(0, 3), (1, 3), (2, 3)]);
        assert!(LocalCluster::run(0, |_| ()).is_err());
    }

    #[test]
    fn test_broadcast() {
        let values = LocalCluster::run(4, |comm| {
            let value = comm.is_root().then(|| vec![1, 2, 3]);
            comm.broadcast(value).unwrap()
        })
        .unwrap();
        assert!(values.iter().all(|v| *v == vec![1, 2, 3]));
    }

    #[test]
    fn test_scatter_gather_uneven() {
        let data: Vec<u32> = (0..10).collect();
        let results = LocalCluster::run(4, |comm| {
            let partition = Partition::even(10, comm.size()).unwrap();
            let local = comm.scatterv(&data, &partition).unwrap();
            let doubled: Vec<u32> = local.iter().map(|x| x * 2).collect();
            (local.len(), comm.gatherv(&doubled, &partition).unwrap())
        })
        .unwrap();

        let sizes: Vec<usize> = results.iter().map(|(n, _)| *n).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2]);
        assert_eq!(results[0].1, Some((0..10u32).map(|x| x * 2).collect::<Vec<_>>()));
        assert!(results[1..].iter().all(|(_, g)| g.is_none()));
    }

    #[test]
    fn test_nonblocking_out_of_order_wait() {
        let results = LocalCluster::run(3, |comm| {
            let partition = Partition::even(6, 3).unwrap();
            let data = [10u8, 11, 12, 13, 14, 15];
            let bcast = comm.ibroadcast(comm.is_root().then_some(7u64)).unwrap();
            let scatter = comm.iscatterv(&data, &partition).unwrap();
            // Waited in the opposite order of issue.
            let part = scatter.wait().unwrap();
            let value = bcast.wait().unwrap();
            (value, part)
        })
        .unwrap();
        assert_eq!(results[2], (7, vec![14, 15]));
        assert_eq!(results[0], (7, vec![10, 11]));
    }

    #[test]
    fn test_barrier() {
        let done = LocalCluster::run(5, |comm| {
            comm.barrier().unwrap();
            comm.barrier().is_ok()
        })
        .unwrap();
        assert!(done.into_iter().all(|ok| ok));
    }

    #[test]
    fn test_root_fails_when_rank_exits_before_gather() {
        let results = LocalCluster::run(3, |comm| {
            if comm.rank() == 1 {
                return Err(validation_error("rank 1 gave up"));
            }
            let partition = Partition::even(3, 3).unwrap();
            comm.gatherv(&[comm.rank() as u8], &partition)
        })
        .unwrap();
        assert!(results[0].is_err());
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().ok(), Some(&None));
    }

    #[test]
    fn test_barrier_fails_on_every_rank_after_an_exit() {
        let results = LocalCluster::run(4, |comm| {
            if comm.rank() == 2 {
                return false;
            }
            comm.barrier().is_err()
        })
        .unwrap();
        assert_eq!(results, vec![true, true, false, true]);
    }

    #[test]
    fn test_messages_sent_before_exit_are_delivered() {
        let values = LocalCluster::run(2, |comm| {
            let value = comm.is_root().then_some(42u32);
            comm.broadcast(value).unwrap()
        })
        .unwrap();
        assert_eq!(values, vec![42, 42]);

        let gathered = LocalCluster::run(3, |comm| {
            let partition = Partition::even(3, 3).unwrap();
            let local = [comm.rank() as u8 * 2];
            if !comm.is_root() {
                comm.gatherv(&local, &partition).unwrap();
                return None;
            }
            // Peers send and leave before the root starts waiting.
            std::thread::sleep(std::time::Duration::from_millis(20));
            comm.gatherv(&local, &partition).unwrap()
        })
        .unwrap();
        assert_eq!(gathered[0], Some(vec![0, 2, 4]));
    }

    #[test]
    fn test_gather_length_mismatch() {
        let results = LocalCluster::run(2, |comm| {
            let partition = Partition::even(4, 2).unwrap();
            comm.gatherv(&[1u8], &partition).is_err()
        })
        .unwrap();
        assert_eq!(results, vec![true, true]);
    }
}
