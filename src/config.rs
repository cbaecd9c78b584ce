//! Engine configuration.
//!
//! A [`Config`] selects the backend and carries every sizing decision that
//! the surrounding driver makes (threads, devices, tile size, batch size).
//! The engines never discover topology on their own.

use std::fmt;

use clap::ValueEnum;

use crate::error::{setup_error, Result};
use crate::TILE;

/// Which implementation of the tile engine contract to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Backend {
    /// Single-threaded row-streaming triple loop.
    Basic,
    /// Single-threaded blocked engine.
    Tiled,
    /// Fixed thread pool, one row-tile range per worker.
    #[default]
    Threads,
    /// Emulated accelerator devices, one row range per device.
    Gpu,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Basic => "basic",
            Backend::Tiled => "tiled",
            Backend::Threads => "threads",
            Backend::Gpu => "gpu",
        };
        f.write_str(name)
    }
}

/// Per-worker kernel of the CPU thread pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CpuKernel {
    Basic,
    #[default]
    Tiled,
}

/// Device kernel used by the GPU backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum GpuKernel {
    /// 16x16 tiles, one output element per lane.
    Tile16,
    /// 64x64 tiles, 4x4 register block per lane.
    #[default]
    Tile64,
}

impl GpuKernel {
    /// Edge of the output tile computed by one work-group.
    pub fn tile(&self) -> usize {
        match self {
            GpuKernel::Tile16 => 16,
            GpuKernel::Tile64 => 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub backend: Backend,
    /// CPU cache-blocking tile edge.
    pub tile: usize,
    /// Worker threads of the CPU pool.
    pub threads: usize,
    pub cpu_kernel: CpuKernel,
    /// Emulated devices of the GPU backend.
    pub devices: usize,
    pub gpu_kernel: GpuKernel,
    /// Queries per nearest-search batch (per device on the GPU backend).
    pub batch_size: usize,
    /// Issue scatter and broadcast together before waiting on either.
    pub non_blocking: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend: Backend::default(),
            tile: TILE,
            threads: std::thread::available_parallelism().map_or(4, |n| n.get()),
            cpu_kernel: CpuKernel::default(),
            devices: 1,
            gpu_kernel: GpuKernel::default(),
            batch_size: 1024,
            non_blocking: false,
        }
    }
}

impl Config {
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_tile(mut self, tile: usize) -> Self {
        self.tile = tile;
        self
    }

    pub fn with_gpu_kernel(mut self, kernel: GpuKernel) -> Self {
        self.gpu_kernel = kernel;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_non_blocking(mut self, non_blocking: bool) -> Self {
        self.non_blocking = non_blocking;
        self
    }

    /// Rejects configurations no backend can run.
    pub fn validate(&self) -> Result<()> {
        if self.tile == 0 {
            return Err(setup_error("config", "tile size must be non-zero"));
        }
        if self.threads == 0 {
            return Err(setup_error("config", "thread count must be at least 1"));
        }
        if self.devices == 0 {
            return Err(setup_error("config", "device count must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(setup_error("config", "batch size must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tile, 16);
        assert_eq!(config.batch_size, 1024);
    }

    #[test]
    fn test_rejects_zero_workers() {
        assert!(Config::default().with_threads(0).validate().is_err());
        assert!(Config::default().with_devices(0).validate().is_err());
        assert!(Config::default().with_tile(0).validate().is_err());
    }

    #[test]
    fn test_gpu_kernel_tile() {
        assert_eq!(GpuKernel::Tile16.tile(), 16);
        assert_eq!(GpuKernel::Tile64.tile(), 64);
    }
}
