//! Nearest-reference search across the CPU and device backends.
//!
//! Minima are planted where the two-level reduction is most likely to lose
//! them: at group edges, across group boundaries and in the last column.

use tilemosaic::engine::{multiply_padded, BasicEngine, ThreadedEngine, TiledEngine};
use tilemosaic::generate::{planted_references, random_bytes};
use tilemosaic::gpu::GpuNearest;
use tilemosaic::nearest::{naive_nearest, EngineSearch};
use tilemosaic::reduce::{device_style_argmin, row_argmin};
use tilemosaic::kernel::MAX_DISTANCE_LEN;
use tilemosaic::{ArgMin, CpuKernel, Matrix, Nearest, ReferenceSet, SquaredDistance};

const COUNT: usize = 700;
const DIM: usize = 24;

/// Positions relative to the 256-wide reduction groups: start, middle and
/// end of a group, both sides of a group boundary, and the last valid column.
const PLANTED: [usize; 7] = [0, 128, 255, 256, 511, 512, COUNT - 1];

/// References whose row `slot` is a copy of `query`; every other row is random
/// and far from it.
fn refs_with_copy_at(query: &[u8], slot: usize) -> ReferenceSet {
    let mut data = random_bytes(COUNT, DIM, 11).into_vec();
    data[slot * DIM..(slot + 1) * DIM].copy_from_slice(query);
    ReferenceSet::new(data, COUNT, DIM).unwrap()
}

fn query() -> Matrix<u8> {
    random_bytes(1, DIM, 99)
}

/// The device pipeline finds a zero-distance copy at every planted slot.
#[test]
fn test_device_reduction_finds_planted_minimum() {
    let queries = query();
    let search = GpuNearest::new(1, 4).unwrap();
    for slot in PLANTED {
        let refs = refs_with_copy_at(queries.row(0), slot);
        let found = search.nearest(&queries, &refs).unwrap();
        assert_eq!(found, vec![ArgMin::new(0, slot)], "slot {slot}");
    }
}

/// Host two-level and linear reductions agree on every planted slot.
#[test]
fn test_two_level_reduction_finds_planted_minimum() {
    let queries = query();
    for slot in PLANTED {
        let refs = refs_with_copy_at(queries.row(0), slot);
        let dist = multiply_padded::<_, SquaredDistance>(
            &BasicEngine,
            &queries,
            &refs.to_matrix().transpose(),
        )
        .unwrap();
        assert_eq!(
            device_style_argmin(&dist, COUNT).unwrap(),
            vec![ArgMin::new(0, slot)],
            "slot {slot}"
        );
        assert_eq!(row_argmin(&dist, COUNT).unwrap(), vec![ArgMin::new(0, slot)]);
    }
}

/// Several exact copies resolve to the lowest index on CPU and device.
#[test]
fn test_ties_resolve_to_lowest_index() {
    let queries = query();
    let mut data = random_bytes(COUNT, DIM, 5).into_vec();
    for slot in [600, 300, 257] {
        data[slot * DIM..(slot + 1) * DIM].copy_from_slice(queries.row(0));
    }
    let refs = ReferenceSet::new(data, COUNT, DIM).unwrap();

    let gpu = GpuNearest::new(2, 8).unwrap().nearest(&queries, &refs).unwrap();
    let engine = ThreadedEngine::new(2, 16, CpuKernel::Tiled).unwrap();
    let cpu = EngineSearch::new(&engine, 8)
        .unwrap()
        .nearest(&queries, &refs)
        .unwrap();
    assert_eq!(gpu, vec![ArgMin::new(0, 257)]);
    assert_eq!(cpu, gpu);
}

/// Photomosaic-sized vectors with one planted duplicate per query.
#[test]
fn test_planted_duplicates_have_zero_distance() {
    let queries = random_bytes(40, 3 * 32 * 32, 7);
    let (refs, planted) = planted_references(&queries, 90, 8).unwrap();

    let gpu = GpuNearest::new(3, 16).unwrap();
    let engine = ThreadedEngine::new(4, 16, CpuKernel::Tiled).unwrap();
    let cpu = EngineSearch::new(&engine, 16).unwrap();
    for found in [
        gpu.nearest(&queries, &refs).unwrap(),
        cpu.nearest(&queries, &refs).unwrap(),
    ] {
        let expected: Vec<ArgMin> = planted.iter().map(|&slot| ArgMin::new(0, slot)).collect();
        assert_eq!(found, expected);
    }
}

/// Random data on both backends matches the brute-force search.
#[test]
fn test_backends_agree_with_brute_force() {
    let refs = ReferenceSet::from_matrix(&random_bytes(333, 40, 21)).unwrap();
    let queries = random_bytes(77, 40, 22);
    let expected = naive_nearest(&queries, &refs).unwrap();

    let gpu = GpuNearest::new(2, 10).unwrap();
    assert_eq!(gpu.nearest(&queries, &refs).unwrap(), expected);

    let engine = ThreadedEngine::new(3, 16, CpuKernel::Basic).unwrap();
    let cpu = EngineSearch::new(&engine, 32).unwrap();
    assert_eq!(cpu.nearest(&queries, &refs).unwrap(), expected);
}

/// Vectors of exactly the accumulator bound pass through every backend, even
/// though the tiled and device paths pad them past it.
#[test]
fn test_feature_length_at_distance_bound() {
    let dim = MAX_DISTANCE_LEN;
    let mut data = vec![0u8; dim];
    data.extend(std::iter::repeat(1u8).take(dim));
    let refs = ReferenceSet::new(data, 2, dim).unwrap();
    let mut queries = vec![255u8; dim];
    queries.extend(std::iter::repeat(0u8).take(dim));
    let queries = Matrix::new(2, dim, queries).unwrap();

    // Against reference 0 the first query sums 33025 * 255^2, just under i32::MAX.
    let expected = vec![
        ArgMin::new((dim * 254 * 254) as i32, 1),
        ArgMin::new(0, 0),
    ];
    assert_eq!(naive_nearest(&queries, &refs).unwrap(), expected);

    let tiled = TiledEngine::new(16).unwrap();
    let cpu = EngineSearch::new(&tiled, 2).unwrap();
    assert_eq!(cpu.nearest(&queries, &refs).unwrap(), expected);

    let gpu = GpuNearest::new(1, 2).unwrap();
    assert_eq!(gpu.nearest(&queries, &refs).unwrap(), expected);

    let longer = ReferenceSet::new(vec![0u8; dim + 1], 1, dim + 1).unwrap();
    let query = Matrix::new(1, dim + 1, vec![1u8; dim + 1]).unwrap();
    assert!(cpu.nearest(&query, &longer).is_err());
    assert!(gpu.nearest(&query, &longer).is_err());
}
