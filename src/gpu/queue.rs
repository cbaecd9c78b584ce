//! In-order command queues and completion events.
//!
//! Every queue owns a worker thread that executes its commands in submission
//! order. A command starts only after every event in its wait list has
//! completed, which is how work on one queue is ordered after work on
//! another. If a waited event failed, the command is skipped and its own
//! event fails with the same error.

use std::ops::Range;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use crate::error::{dimension_error, setup_error, transfer_error, Result, TileError};
use crate::gpu::device::{Device, DeviceBuffer};
use crate::gpu::kernels::Kernel;
use crate::gpu::workgroup::LaunchStats;

#[derive(Default)]
struct EventState {
    status: Mutex<Option<Result<()>>>,
    done: Condvar,
}

/// Completion of one command.
#[derive(Clone, Default)]
pub struct Event {
    state: Arc<EventState>,
}

impl Event {
    /// An event that has already completed successfully.
    pub fn completed() -> Self {
        let event = Event::default();
        event.complete(Ok(()));
        event
    }

    /// An event that has already failed with `error`.
    pub fn failed(error: TileError) -> Self {
        let event = Event::default();
        event.complete(Err(error));
        event
    }

    fn complete(&self, result: Result<()>) {
        let mut status = self
            .state
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *status = Some(result);
        self.state.done.notify_all();
    }

    /// Blocks until the command has run and returns its outcome.
    pub fn wait(&self) -> Result<()> {
        let mut status = self
            .state
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = status.as_ref() {
                return result.clone();
            }
            status = self
                .state
                .done
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

type Slot<T> = Arc<Mutex<Option<T>>>;

fn take_slot<T>(slot: &Slot<T>, device: usize) -> Result<T> {
    slot.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .ok_or_else(|| transfer_error(device, "command completed without a result"))
}

/// A non-blocking read. The data is only available through [`PendingRead::wait`].
pub struct PendingRead<T> {
    event: Event,
    slot: Slot<Vec<T>>,
    device: usize,
}

impl<T> PendingRead<T> {
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Blocks until the read has landed on the host.
    pub fn wait(self) -> Result<Vec<T>> {
        self.event.wait()?;
        take_slot(&self.slot, self.device)
    }
}

/// A kernel launch in flight.
pub struct PendingLaunch {
    event: Event,
    slot: Slot<LaunchStats>,
    device: usize,
}

impl PendingLaunch {
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn wait(self) -> Result<LaunchStats> {
        self.event.wait()?;
        take_slot(&self.slot, self.device)
    }
}

type Command = Box<dyn FnOnce() -> Result<()> + Send>;

struct Job {
    label: &'static str,
    wait: Vec<Event>,
    command: Command,
    done: Event,
}

/// An in-order queue bound to one device.
pub struct CommandQueue {
    device: Device,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl CommandQueue {
    pub fn new(device: Device) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let id = device.id();
        let worker = thread::Builder::new()
            .name(format!("gpu-queue-{id}"))
            .spawn(move || {
                for job in receiver {
                    let result = job
                        .wait
                        .iter()
                        .try_for_each(Event::wait)
                        .and_then(|()| (job.command)());
                    if let Err(e) = &result {
                        debug!(device = id, command = job.label, error = %e, "command failed");
                    } else {
                        trace!(device = id, command = job.label, "command done");
                    }
                    job.done.complete(result);
                }
            })
            .map_err(|e| setup_error(format!("queue {id}"), e.to_string()))?;

        Ok(CommandQueue {
            device,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn submit(&self, label: &'static str, wait: &[Event], command: Command) -> Result<Event> {
        let done = Event::default();
        let job = Job {
            label,
            wait: wait.to_vec(),
            command,
            done: done.clone(),
        };
        self.sender
            .as_ref()
            .ok_or_else(|| transfer_error(self.device.id(), "queue is shut down"))?
            .send(job)
            .map_err(|_| transfer_error(self.device.id(), "queue worker has exited"))?;
        Ok(done)
    }

    fn check_buffer<T>(&self, buf: &DeviceBuffer<T>) -> Result<()> {
        if buf.device_id() != self.device.id() {
            return Err(setup_error(
                self.device.info().name.clone(),
                format!("buffer belongs to device {}", buf.device_id()),
            ));
        }
        Ok(())
    }

    /// Copies `src[src_range]` to `buf[dst_offset..]` once `wait` completes.
    pub fn enqueue_write<T>(
        &self,
        buf: &DeviceBuffer<T>,
        dst_offset: usize,
        src: &Arc<[T]>,
        src_range: Range<usize>,
        wait: &[Event],
    ) -> Result<Event>
    where
        T: Copy + Send + Sync + 'static,
    {
        self.check_buffer(buf)?;
        if src_range.start > src_range.end || src_range.end > src.len() {
            return Err(dimension_error(format!(
                "write source range {src_range:?} out of bounds for {} elements",
                src.len()
            )));
        }
        if dst_offset + src_range.len() > buf.len() {
            return Err(dimension_error(format!(
                "write of {} elements at offset {dst_offset} overflows buffer of {}",
                src_range.len(),
                buf.len()
            )));
        }

        let (buf, src) = (buf.clone(), Arc::clone(src));
        self.submit(
            "write",
            wait,
            Box::new(move || {
                let len = src_range.len();
                let mut dst = buf.write()?;
                dst[dst_offset..dst_offset + len].copy_from_slice(&src[src_range]);
                Ok(())
            }),
        )
    }

    /// Copies `buf[range]` back to the host once `wait` completes.
    pub fn enqueue_read<T>(
        &self,
        buf: &DeviceBuffer<T>,
        range: Range<usize>,
        wait: &[Event],
    ) -> Result<PendingRead<T>>
    where
        T: Copy + Send + Sync + 'static,
    {
        self.check_buffer(buf)?;
        if range.start > range.end || range.end > buf.len() {
            return Err(dimension_error(format!(
                "read range {range:?} out of bounds for buffer of {}",
                buf.len()
            )));
        }

        let slot: Slot<Vec<T>> = Arc::default();
        let (buf, out) = (buf.clone(), Arc::clone(&slot));
        let event = self.submit(
            "read",
            wait,
            Box::new(move || {
                let data = buf.read()?[range].to_vec();
                *out.lock().unwrap_or_else(PoisonError::into_inner) = Some(data);
                Ok(())
            }),
        )?;
        Ok(PendingRead {
            event,
            slot,
            device: self.device.id(),
        })
    }

    /// Launches `kernel` once `wait` completes. The launch configuration is
    /// checked against the device before anything is queued.
    pub fn enqueue_kernel(&self, kernel: Arc<dyn Kernel>, wait: &[Event]) -> Result<PendingLaunch> {
        kernel
            .range()
            .validate(self.device.info(), kernel.local_mem_bytes())?;
        for id in kernel.buffer_devices() {
            if id != self.device.id() {
                return Err(setup_error(
                    self.device.info().name.clone(),
                    format!("kernel {} uses a buffer of device {id}", kernel.name()),
                ));
            }
        }

        let slot: Slot<LaunchStats> = Arc::default();
        let out = Arc::clone(&slot);
        let event = self.submit(
            kernel.name(),
            wait,
            Box::new(move || {
                let stats = kernel.execute()?;
                *out.lock().unwrap_or_else(PoisonError::into_inner) = Some(stats);
                Ok(())
            }),
        )?;
        Ok(PendingLaunch {
            event,
            slot,
            device: self.device.id(),
        })
    }

    /// Blocks until every command submitted so far has run.
    pub fn finish(&self) -> Result<()> {
        self.submit("finish", &[], Box::new(|| Ok(())))?.wait()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::Platform;

    fn queue() -> CommandQueue {
        let platform = Platform::discover(1).unwrap();
        CommandQueue::new(platform.devices()[0].clone()).unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let queue = queue();
        let buf = queue.device().alloc::<i32>(8).unwrap();
        let src: Arc<[i32]> = Arc::from(vec![1, 2, 3, 4]);

        let written = queue.enqueue_write(&buf, 2, &src, 1..4, &[]).unwrap();
        let read = queue.enqueue_read(&buf, 0..8, &[written]).unwrap();
        assert_eq!(read.wait().unwrap(), vec![0, 0, 2, 3, 4, 0, 0, 0]);
    }

    #[test]
    fn test_cross_queue_dependency() {
        let platform = Platform::discover(1).unwrap();
        let device = platform.devices()[0].clone();
        let q1 = CommandQueue::new(device.clone()).unwrap();
        let q2 = CommandQueue::new(device.clone()).unwrap();
        let buf = device.alloc::<u8>(4).unwrap();
        let src: Arc<[u8]> = Arc::from(vec![9u8; 4]);

        let written = q1.enqueue_write(&buf, 0, &src, 0..4, &[]).unwrap();
        let read = q2.enqueue_read(&buf, 0..4, &[written]).unwrap();
        assert_eq!(read.wait().unwrap(), vec![9, 9, 9, 9]);
    }

    #[test]
    fn test_failed_dependency_propagates() {
        let queue = queue();
        let buf = queue.device().alloc::<u8>(4).unwrap();
        let failed = Event::failed(transfer_error(3, "peer gone"));

        let read = queue.enqueue_read(&buf, 0..4, &[failed]).unwrap();
        let err = read.wait().unwrap_err();
        assert!(matches!(err, TileError::TransferError { peer: 3, .. }));
    }

    #[test]
    fn test_out_of_bounds_rejected_before_queueing() {
        let queue = queue();
        let buf = queue.device().alloc::<u8>(4).unwrap();
        let src: Arc<[u8]> = Arc::from(vec![0u8; 8]);
        assert!(queue.enqueue_write(&buf, 0, &src, 0..8, &[]).is_err());
        assert!(queue.enqueue_write(&buf, 2, &src, 0..3, &[]).is_err());
        assert!(queue.enqueue_read(&buf, 2..5, &[]).is_err());
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let platform = Platform::discover(2).unwrap();
        let queue = CommandQueue::new(platform.devices()[0].clone()).unwrap();
        let other = platform.devices()[1].alloc::<u8>(4).unwrap();
        assert!(queue.enqueue_read(&other, 0..4, &[]).is_err());
    }

    #[test]
    fn test_finish_and_events() {
        let queue = queue();
        assert!(Event::completed().is_complete());
        queue.finish().unwrap();
    }
}
