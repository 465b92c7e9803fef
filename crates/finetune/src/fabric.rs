//! SPMD worker model: every worker runs the same training loop on its own
//! device and only talks to the others through [`Fabric`] collectives.

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread,
};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device, Tensor,
};
use log::{info, warn};

use crate::error::{to_runtime_error, Result, TrainingError};

pub trait Fabric: Send + Sync {
    fn global_rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_global_zero(&self) -> bool {
        self.global_rank() == 0
    }

    fn device(&self) -> &Device;

    /// Blocks until every worker has reached the same barrier.
    fn barrier(&self) -> Result<()>;

    /// Element-wise mean of each tensor across workers.
    ///
    /// A `None` entry counts as zeros; the entry stays `None` only when it is
    /// missing on every worker.
    fn all_reduce_mean(&self, tensors: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>>;

    /// Logs `message` on global rank zero only.
    fn print(&self, message: &str) {
        if self.is_global_zero() {
            info!("{message}");
        }
    }
}

/// The whole run on one device.
#[derive(Debug, Clone)]
pub struct SingleDevice {
    device: Device,
}

impl SingleDevice {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

impl Fabric for SingleDevice {
    fn global_rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_reduce_mean(&self, tensors: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        Ok(tensors)
    }
}

#[derive(Debug, Default)]
struct RendezvousState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// Reusable barrier that can be torn down when a worker fails, so the
/// survivors return an error instead of waiting forever.
#[derive(Debug)]
struct Rendezvous {
    parties: usize,
    state: Mutex<RendezvousState>,
    released: Condvar,
}

impl Rendezvous {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(RendezvousState::default()),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, RendezvousState>> {
        self.state
            .lock()
            .map_err(|_| TrainingError::runtime("worker barrier poisoned"))
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.aborted {
            return Err(TrainingError::runtime("another worker failed"));
        }
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            state = self
                .released
                .wait(state)
                .map_err(|_| TrainingError::runtime("worker barrier poisoned"))?;
        }
        if state.generation == generation {
            return Err(TrainingError::runtime("another worker failed"));
        }
        Ok(())
    }

    fn abort(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.aborted = true;
        }
        self.released.notify_all();
    }
}

#[derive(Debug)]
struct Shared {
    rendezvous: Rendezvous,
    slots: Mutex<Vec<Vec<Option<Tensor>>>>,
}

/// One worker thread of a [`launch`]ed group.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    device: Device,
    shared: Arc<Shared>,
}

impl ThreadGroup {
    fn slots(&self) -> Result<MutexGuard<'_, Vec<Vec<Option<Tensor>>>>> {
        self.shared
            .slots
            .lock()
            .map_err(|_| TrainingError::runtime("all-reduce buffer poisoned"))
    }
}

impl Fabric for ThreadGroup {
    fn global_rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn barrier(&self) -> Result<()> {
        self.shared.rendezvous.wait()
    }

    fn all_reduce_mean(&self, tensors: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        let staged = tensors
            .iter()
            .map(|t| t.as_ref().map(|t| t.to_device(&Device::Cpu)).transpose())
            .collect::<candle_core::Result<Vec<_>>>()
            .map_err(to_runtime_error)?;
        self.slots()?[self.rank] = staged;
        // Everyone has published.
        self.barrier()?;

        let reduced = {
            let slots = self.slots()?;
            let mut reduced = Vec::with_capacity(tensors.len());
            for index in 0..tensors.len() {
                let mut sum: Option<Tensor> = None;
                for worker in slots.iter() {
                    let Some(Some(value)) = worker.get(index) else {
                        continue;
                    };
                    sum = Some(match sum {
                        Some(acc) => acc.add(value).map_err(to_runtime_error)?,
                        None => value.clone(),
                    });
                }
                let mean = sum
                    .map(|total| {
                        total
                            .affine(1.0 / self.world_size as f64, 0.0)
                            .and_then(|mean| mean.to_device(&self.device))
                    })
                    .transpose()
                    .map_err(to_runtime_error)?;
                reduced.push(mean);
            }
            reduced
        };
        // Nobody overwrites a slot until everyone has read.
        self.barrier()?;
        Ok(reduced)
    }
}

/// Runs `f` on `devices` workers and returns rank zero's result.
///
/// With a single device `f` runs on the calling thread. Otherwise each rank
/// gets a scoped thread and a device from `device_factory`; the first error
/// (in rank order) wins and releases any worker stuck in a collective.
pub fn launch<T, D, F>(devices: usize, device_factory: D, f: F) -> Result<T>
where
    T: Send,
    D: Fn(usize) -> Result<Device> + Sync,
    F: Fn(&dyn Fabric) -> Result<T> + Sync,
{
    if devices == 0 {
        return Err(TrainingError::initialization("devices must be at least 1"));
    }
    if devices == 1 {
        let fabric = SingleDevice::new(device_factory(0)?);
        return f(&fabric);
    }

    let shared = Arc::new(Shared {
        rendezvous: Rendezvous::new(devices),
        slots: Mutex::new(vec![Vec::new(); devices]),
    });

    let results: Vec<Result<T>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..devices)
            .map(|rank| {
                let shared = Arc::clone(&shared);
                let (device_factory, f) = (&device_factory, &f);
                scope.spawn(move || {
                    let outcome = device_factory(rank).and_then(|device| {
                        let worker = ThreadGroup {
                            rank,
                            world_size: devices,
                            device,
                            shared: Arc::clone(&shared),
                        };
                        f(&worker)
                    });
                    if outcome.is_err() {
                        shared.rendezvous.abort();
                    }
                    outcome
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle.join().unwrap_or_else(|_| {
                    shared.rendezvous.abort();
                    Err(TrainingError::runtime(format!("worker {rank} panicked")))
                })
            })
            .collect()
    });

    let mut first = None;
    for result in results {
        match result {
            Ok(value) if first.is_none() => first = Some(value),
            Ok(_) => {}
            Err(err) => return Err(err),
        }
    }
    first.ok_or_else(|| TrainingError::runtime("no worker produced a result"))
}

/// Picks the accelerator for worker `ordinal`: Metal, then CUDA, then CPU.
pub fn select_device(ordinal: usize) -> Result<Device> {
    if metal_is_available() {
        match Device::new_metal(ordinal) {
            Ok(device) => return Ok(device),
            Err(err) => warn!("failed to initialize metal device {ordinal}, falling back: {err}"),
        }
    }
    if cuda_is_available() {
        match Device::new_cuda(ordinal) {
            Ok(device) => return Ok(device),
            Err(err) => warn!("cuda reported available but device {ordinal} failed: {err}"),
        }
    }
    Ok(Device::Cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(_: usize) -> Result<Device> {
        Ok(Device::Cpu)
    }

    #[test]
    fn single_device_is_rank_zero() -> Result<()> {
        let ranks = launch(1, cpu, |fabric| {
            fabric.barrier()?;
            Ok((fabric.global_rank(), fabric.world_size(), fabric.is_global_zero()))
        })?;
        assert_eq!(ranks, (0, 1, true));
        Ok(())
    }

    #[test]
    fn all_reduce_averages_across_threads() -> Result<()> {
        let reduced = launch(3, cpu, |fabric| {
            let value = fabric.global_rank() as f32 * 3.0;
            let local = Tensor::from_slice(&[value, 1.0], 2, fabric.device())?;
            let only_rank_two = if fabric.global_rank() == 2 {
                Some(Tensor::from_slice(&[6.0f32], 1, fabric.device())?)
            } else {
                None
            };
            let out = fabric.all_reduce_mean(vec![Some(local), only_rank_two, None])?;
            let values = out
                .iter()
                .map(|t| t.as_ref().map(|t| t.to_vec1::<f32>()).transpose())
                .collect::<candle_core::Result<Vec<_>>>()?;
            Ok(values)
        })?;
        assert_eq!(reduced[0], Some(vec![3.0, 1.0]));
        assert_eq!(reduced[1], Some(vec![2.0]));
        assert_eq!(reduced[2], None);
        Ok(())
    }

    #[test]
    fn repeated_collectives_stay_in_step() -> Result<()> {
        let total = launch(2, cpu, |fabric| {
            let mut acc = 0.0f32;
            for round in 0..5 {
                let local = Tensor::from_slice(&[(round + fabric.global_rank()) as f32], 1, fabric.device())?;
                let out = fabric.all_reduce_mean(vec![Some(local)])?;
                if let Some(Some(mean)) = out.into_iter().next() {
                    acc += mean.to_vec1::<f32>()?[0];
                }
            }
            Ok(acc)
        })?;
        // means are 0.5, 1.5, 2.5, 3.5, 4.5
        assert_eq!(total, 12.5);
        Ok(())
    }

    #[test]
    fn failing_worker_releases_the_others() {
        let result = launch(2, cpu, |fabric| {
            if fabric.global_rank() == 1 {
                return Err(TrainingError::runtime("boom"));
            }
            fabric.barrier()?;
            Ok(())
        });
        assert!(result.is_err());
    }
}
