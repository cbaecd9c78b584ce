use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use tilemosaic::distribute::{distributed_nearest, Communicator, DistributedEngine, LocalCluster};
use tilemosaic::engine::{multiply_padded, Engine, TileEngine};
use tilemosaic::generate::{planted_references, random_bytes, random_image, random_matrix};
use tilemosaic::gpu::GpuNearest;
use tilemosaic::mosaic::{assemble, extract_patches, Image, FEATURE_LEN};
use tilemosaic::nearest::EngineSearch;
use tilemosaic::telemetry::init_subscriber;
use tilemosaic::timer::Timer;
use tilemosaic::validate::{validate_nearest, validate_product};
use tilemosaic::{
    ArgMin, Backend, Config, CpuKernel, GpuKernel, Matrix, Nearest, Product, ReferenceSet, Result,
};

#[derive(Parser, Debug)]
#[command(name = "tilemosaic")]
#[command(about = "Tiled matrix multiplication and photomosaic search on synthetic data")]
struct Cli {
    /// Log at DEBUG unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Multiply two random matrices
    Matmul {
        #[arg(short, default_value_t = 512)]
        p: usize,
        #[arg(short, default_value_t = 512)]
        q: usize,
        #[arg(short, default_value_t = 512)]
        r: usize,

        /// Compare the result with the naive product
        #[arg(long)]
        validate: bool,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Rebuild a random image from its nearest reference patches
    Mosaic {
        #[arg(long, default_value_t = 256)]
        width: usize,
        #[arg(long, default_value_t = 256)]
        height: usize,

        /// Number of reference patches
        #[arg(long, default_value_t = 1000)]
        refs: usize,

        /// Plant a copy of every image patch in the reference set
        #[arg(long)]
        plant: bool,

        /// Compare the matches with a brute-force search
        #[arg(long)]
        validate: bool,

        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short, long, value_enum, default_value_t = Backend::Threads)]
    backend: Backend,

    /// Worker threads of the thread pool backend
    #[arg(short, long)]
    threads: Option<usize>,

    /// Emulated devices of the GPU backend
    #[arg(short, long, default_value_t = 1)]
    devices: usize,

    /// CPU cache-blocking tile edge
    #[arg(long, default_value_t = tilemosaic::TILE)]
    tile: usize,

    #[arg(long, value_enum, default_value_t = CpuKernel::Tiled)]
    cpu_kernel: CpuKernel,

    #[arg(long, value_enum, default_value_t = GpuKernel::Tile64)]
    gpu_kernel: GpuKernel,

    /// Queries per batch in the nearest search
    #[arg(long, default_value_t = tilemosaic::nearest::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// In-process ranks; more than one distributes the work
    #[arg(long, default_value_t = 1)]
    ranks: usize,

    /// Issue scatter and broadcast together before waiting
    #[arg(long)]
    non_blocking: bool,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

impl RunArgs {
    fn config(&self) -> Config {
        let mut config = Config::default()
            .with_backend(self.backend)
            .with_devices(self.devices)
            .with_tile(self.tile)
            .with_gpu_kernel(self.gpu_kernel)
            .with_batch_size(self.batch_size)
            .with_non_blocking(self.non_blocking);
        config.cpu_kernel = self.cpu_kernel;
        if let Some(threads) = self.threads {
            config = config.with_threads(threads);
        }
        config
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_subscriber(cli.verbose);

    let result = match cli.command {
        Commands::Matmul {
            p,
            q,
            r,
            validate,
            run,
        } => run_matmul(p, q, r, validate, &run),
        Commands::Mosaic {
            width,
            height,
            refs,
            plant,
            validate,
            run,
        } => run_mosaic(width, height, refs, plant, validate, &run),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run_matmul(p: usize, q: usize, r: usize, validate: bool, run: &RunArgs) -> Result<()> {
    let config = run.config();
    config.validate()?;
    let mut timer = Timer::new();
    let a = random_matrix(p, q, run.seed);
    let b = random_matrix(q, r, run.seed.wrapping_add(1));

    timer.start("multiply");
    let c = if run.ranks > 1 {
        distributed_product(&config, run.ranks, &a, &b)?
    } else {
        let engine = Engine::from_config(&config)?;
        multiply_padded::<_, Product>(&engine, &a, &b)?
    };
    let seconds = timer.stop("multiply").unwrap_or_default();
    let gflops = 2.0 * (p * q * r) as f64 / seconds.max(f64::EPSILON) / 1e9;
    info!(backend = %config.backend, p, q, r, seconds, gflops, "matmul done");

    if validate {
        let report = timer.time("validate", || validate_product(&a, &b, &c))?;
        println!("{report}");
    }
    Ok(())
}

/// Runs the product on `ranks` in-process ranks, each multiplying its rows
/// with the configured engine. Rows are padded to the partition granularity
/// on the root.
fn distributed_product(
    config: &Config,
    ranks: usize,
    a: &Matrix<f32>,
    b: &Matrix<f32>,
) -> Result<Matrix<f32>> {
    let results = LocalCluster::run(ranks, |comm| -> Result<Option<Matrix<f32>>> {
        let engine = DistributedEngine::new(&comm, Engine::from_config(config)?)
            .with_non_blocking(config.non_blocking);
        if comm.is_root() {
            multiply_padded::<_, Product>(&engine, a, b).map(Some)
        } else {
            let empty = Matrix::zeros(0, 0);
            engine.multiply::<Product>(&empty, &empty, &mut Matrix::zeros(0, 0))?;
            Ok(None)
        }
    })?;
    let mut results = results.into_iter().collect::<Result<Vec<_>>>()?;
    results
        .swap_remove(0)
        .ok_or_else(|| tilemosaic::error::transfer_error(0, "root produced no result"))
}

fn run_mosaic(
    width: usize,
    height: usize,
    refs: usize,
    plant: bool,
    validate: bool,
    run: &RunArgs,
) -> Result<()> {
    let config = run.config();
    config.validate()?;
    let mut timer = Timer::new();
    let image = random_image(width, height, run.seed)?;
    let patches = extract_patches(&image)?;
    let refs = if plant {
        planted_references(&patches, refs.max(patches.rows()), run.seed.wrapping_add(1))?.0
    } else {
        ReferenceSet::from_matrix(&random_bytes(refs, FEATURE_LEN, run.seed.wrapping_add(1)))?
    };

    timer.start("search");
    let best = if run.ranks > 1 {
        distributed_search(&config, run.ranks, &patches, &refs)?
    } else {
        with_search(&config, |search| search.nearest(&patches, &refs))?
    };
    timer.stop("search");

    let indices: Vec<usize> = best.iter().map(|m| m.index).collect();
    let output: Image = timer.time("assemble", || assemble(width, height, &indices, &refs))?;
    info!(
        patches = best.len(),
        exact = best.iter().filter(|m| m.distance == 0).count(),
        unchanged = (output == image),
        "photomosaic done"
    );

    if validate {
        let report = timer.time("validate", || validate_nearest(&patches, &refs, &best))?;
        println!("{report}");
    }
    Ok(())
}

/// Runs `f` with the nearest search of the configured backend.
fn with_search<R>(config: &Config, f: impl FnOnce(&dyn Nearest) -> Result<R>) -> Result<R> {
    if config.backend == Backend::Gpu {
        f(&GpuNearest::new(config.devices, config.batch_size)?)
    } else {
        let engine = Engine::from_config(config)?;
        f(&EngineSearch::new(&engine, config.batch_size)?)
    }
}

fn distributed_search(
    config: &Config,
    ranks: usize,
    patches: &Matrix<u8>,
    refs: &ReferenceSet,
) -> Result<Vec<ArgMin>> {
    let results = LocalCluster::run(ranks, |comm| {
        let (queries, refs) = if comm.is_root() {
            (Some(patches), Some(refs))
        } else {
            (None, None)
        };
        with_search(config, |search| {
            distributed_nearest(&comm, search, queries, refs, config.non_blocking)
        })
    })?;
    let mut results = results.into_iter().collect::<Result<Vec<_>>>()?;
    results
        .swap_remove(0)
        .ok_or_else(|| tilemosaic::error::transfer_error(0, "root produced no result"))
}
