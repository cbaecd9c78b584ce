//! Tiled matrix multiplication and nearest-reference search.
//!
//! One blocked kernel, `C = A (x) B`, in two accumulation modes: the ordinary
//! `f32` product and the `i32` sum of squared `u8` differences used to match
//! image patches. The kernel runs behind the [`engine::TileEngine`] trait on
//! a single thread, on a fixed thread pool, on emulated accelerator devices
//! ([`gpu`]) and across message-passing ranks ([`distribute`]). Every
//! multi-worker backend splits output rows with the same [`Partition`].
//!
//! ```
//! use tilemosaic::{engine::ThreadedEngine, engine::TileEngine, CpuKernel, Matrix, Product};
//!
//! let a = Matrix::<f32>::identity(32);
//! let b = Matrix::from_fn(32, 32, |i, j| (i * 32 + j) as f32);
//! let mut c = Matrix::zeros(32, 32);
//!
//! let engine = ThreadedEngine::new(2, 16, CpuKernel::Tiled).unwrap();
//! engine.multiply::<Product>(&a, &b, &mut c).unwrap();
//! assert_eq!(c, b);
//! ```

pub mod config;
pub mod distribute;
pub mod engine;
pub mod error;
pub mod generate;
pub mod gpu;
pub mod kernel;
pub mod matrix;
pub mod mosaic;
pub mod nearest;
pub mod partition;
pub mod reduce;
pub mod telemetry;
pub mod timer;
pub mod utils;
pub mod validate;

pub use config::{Backend, Config, CpuKernel, GpuKernel};
pub use error::{Result, TileError};
pub use kernel::{Product, SquaredDistance, TileOp};
pub use matrix::Matrix;
pub use nearest::{Nearest, ReferenceSet};
pub use partition::Partition;
pub use reduce::ArgMin;

/// Row granularity of every partition, and the default CPU tile edge.
pub const TILE: usize = 16;
