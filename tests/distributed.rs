//! Ranks on in-process channels driving the CPU and device engines.
//!
//! Every case runs a full cluster through `LocalCluster::run`. Most compare
//! the root's result with a single-engine run.

use std::cell::Cell;

use tilemosaic::distribute::{distributed_nearest, Communicator, DistributedEngine, LocalCluster};
use tilemosaic::engine::{BasicEngine, Engine, TileEngine};
use tilemosaic::generate::{planted_references, random_bytes, random_matrix};
use tilemosaic::gpu::{GpuEngine, GpuNearest};
use tilemosaic::nearest::naive_nearest;
use tilemosaic::telemetry::init_test_subscriber;
use tilemosaic::error::validation_error;
use tilemosaic::{Backend, Config, GpuKernel, Matrix, Partition, Product, Result, TileOp};

/// Basic engine that remembers the shape of the last left operand it got.
struct ShapeRecorder<'a> {
    shape: &'a Cell<(usize, usize)>,
}

impl TileEngine for ShapeRecorder<'_> {
    fn name(&self) -> &'static str {
        "shape_recorder"
    }

    fn alignment(&self) -> usize {
        1
    }

    fn multiply<Op: TileOp>(
        &self,
        a: &Matrix<Op::Elem>,
        b: &Matrix<Op::Elem>,
        c: &mut Matrix<Op::Acc>,
    ) -> Result<()> {
        self.shape.set((a.rows(), a.cols()));
        BasicEngine.multiply::<Op>(a, b, c)
    }
}

fn run_product(
    ranks: usize,
    config: &Config,
    a: &Matrix<f32>,
    b: &Matrix<f32>,
) -> Matrix<f32> {
    let results = LocalCluster::run(ranks, |comm| {
        let local = Engine::from_config(config).unwrap();
        let engine =
            DistributedEngine::new(&comm, local).with_non_blocking(config.non_blocking);
        if comm.is_root() {
            let mut c = Matrix::zeros(a.rows(), b.cols());
            engine.multiply::<Product>(a, b, &mut c).unwrap();
            Some(c)
        } else {
            let empty = Matrix::zeros(0, 0);
            engine
                .multiply::<Product>(&empty, &empty, &mut Matrix::zeros(0, 0))
                .unwrap();
            None
        }
    })
    .unwrap();
    results.into_iter().next().flatten().unwrap()
}

/// Waiting on the scatter and broadcast later changes nothing in the result.
#[test]
fn test_non_blocking_matches_blocking() {
    let a = random_matrix(160, 64, 1);
    let b = random_matrix(64, 96, 2);
    let config = Config::default().with_backend(Backend::Tiled);
    let blocking = run_product(4, &config, &a, &b);
    let non_blocking = run_product(4, &config.clone().with_non_blocking(true), &a, &b);
    assert_eq!(blocking, non_blocking);

    let mut expected = Matrix::zeros(160, 96);
    BasicEngine.multiply::<Product>(&a, &b, &mut expected).unwrap();
    assert_eq!(blocking, expected);
}

/// Each rank drives its own pair of emulated devices.
#[test]
fn test_ranks_with_device_engines() {
    let a = random_matrix(96, 64, 3);
    let b = random_matrix(64, 64, 4);
    let config = Config::default()
        .with_backend(Backend::Gpu)
        .with_devices(2)
        .with_gpu_kernel(GpuKernel::Tile16);
    let c = run_product(3, &config, &a, &b);

    let mut expected = Matrix::zeros(96, 64);
    GpuEngine::new(1, GpuKernel::Tile16)
        .unwrap()
        .multiply::<Product>(&a, &b, &mut expected)
        .unwrap();
    assert_eq!(c, expected);
}

/// Threads, devices and ranks hand out the same row blocks.
#[test]
fn test_threads_devices_and_ranks_partition_alike() {
    for workers in 1..=6 {
        let config = Config::default().with_threads(workers).with_devices(workers);
        let threads = Engine::from_config(&config.clone().with_backend(Backend::Threads)).unwrap();
        let gpu = Engine::from_config(&config.with_backend(Backend::Gpu)).unwrap();
        let ranks = LocalCluster::run(workers, |comm| {
            DistributedEngine::new(&comm, BasicEngine)
                .row_partition(320)
                .unwrap()
        })
        .unwrap();

        let expected = Partition::rows(320, 16, workers).unwrap();
        assert_eq!(threads.row_partition(320).unwrap(), expected);
        assert_eq!(gpu.row_partition(320).unwrap(), expected);
        assert!(ranks.iter().all(|p| *p == expected));
    }
}

/// Planted duplicates are found through scattered queries on every rank.
#[test]
fn test_distributed_search_on_devices() {
    let _guard = init_test_subscriber();
    let queries = random_bytes(37, 48, 5);
    let (refs, planted) = planted_references(&queries, 300, 6).unwrap();
    let expected = naive_nearest(&queries, &refs).unwrap();
    assert!(expected
        .iter()
        .zip(&planted)
        .all(|(m, &slot)| m.distance == 0 && m.index == slot));

    for non_blocking in [false, true] {
        let results = LocalCluster::run(3, |comm| {
            let search = GpuNearest::new(2, 4).unwrap();
            let (q, r) = if comm.is_root() {
                (Some(&queries), Some(&refs))
            } else {
                (None, None)
            };
            distributed_nearest(&comm, &search, q, r, non_blocking).unwrap()
        })
        .unwrap();
        assert_eq!(results[0].as_ref(), Some(&expected));
    }
}

/// Ranks left without a row tile still take part in every collective.
#[test]
fn test_more_ranks_than_row_tiles() {
    let a = random_matrix(32, 16, 7);
    let b = random_matrix(16, 16, 8);
    let config = Config::default().with_backend(Backend::Basic);
    let c = run_product(5, &config, &a, &b);

    let mut expected = Matrix::zeros(32, 16);
    BasicEngine.multiply::<Product>(&a, &b, &mut expected).unwrap();
    assert_eq!(c, expected);
}

/// With 7 row tiles over 3 ranks, the first rank gets the extra tile and
/// every rank multiplies exactly the rows the partition assigns it.
#[test]
fn test_uneven_rows_reach_each_rank() {
    let (p, q, r) = (16 * 7, 48, 32);
    let a = random_matrix(p, q, 9);
    let b = random_matrix(q, r, 10);

    let results = LocalCluster::run(3, |comm| {
        let shape = Cell::new((0, 0));
        let engine = DistributedEngine::new(&comm, ShapeRecorder { shape: &shape });
        let c = if comm.is_root() {
            let mut c = Matrix::zeros(p, r);
            engine.multiply::<Product>(&a, &b, &mut c).unwrap();
            Some(c)
        } else {
            let empty = Matrix::zeros(0, 0);
            engine
                .multiply::<Product>(&empty, &empty, &mut Matrix::zeros(0, 0))
                .unwrap();
            None
        };
        (shape.get(), c)
    })
    .unwrap();

    let shapes: Vec<(usize, usize)> = results.iter().map(|(shape, _)| *shape).collect();
    assert_eq!(shapes, vec![(48, q), (32, q), (32, q)]);

    let partition = Partition::rows(p, 16, 3).unwrap();
    assert_eq!(partition.scaled(q).counts(), vec![48 * q, 32 * q, 32 * q]);
    assert_eq!(partition.scaled(r).offsets(), vec![0, 48 * r, 80 * r]);

    let mut expected = Matrix::zeros(p, r);
    BasicEngine.multiply::<Product>(&a, &b, &mut expected).unwrap();
    assert_eq!(results[0].1.as_ref(), Some(&expected));
}

/// A rank that bails out before the multiply makes the root fail instead of
/// waiting forever for its rows.
#[test]
fn test_rank_exit_fails_root() {
    let a = random_matrix(48, 16, 11);
    let b = random_matrix(16, 16, 12);

    let results = LocalCluster::run(3, |comm| {
        if comm.rank() == 2 {
            return Err(validation_error("rank 2 could not start"));
        }
        let engine = DistributedEngine::new(&comm, BasicEngine);
        if comm.is_root() {
            let mut c = Matrix::zeros(48, 16);
            engine.multiply::<Product>(&a, &b, &mut c)
        } else {
            let empty = Matrix::zeros(0, 0);
            engine.multiply::<Product>(&empty, &empty, &mut Matrix::zeros(0, 0))
        }
    })
    .unwrap();

    assert!(results[0].is_err());
    assert!(results[2].is_err());
}
