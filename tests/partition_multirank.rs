mod util;

use mesh_forest::algs::communicator::{Communicator, NoComm};
use mesh_forest::debug_invariants::DebugInvariants;
use mesh_forest::domain::Domain;
use mesh_forest::forest::Connectivity;
use mesh_forest::map::MapContext;
use mesh_forest::mesh_error::MeshForestError;
use mesh_forest::patch::{BuildMode, Patch};
use mesh_forest::solver::PatchSolver;
use mesh_forest::solver::scalar::CellGrid;
use std::sync::Arc;
use util::{advection, disk, mass, on_world, uniform};

#[test]
fn weighted_partition_conserves_patches_and_data() {
    let out = on_world(3, |comm| {
        let solver = advection(disk);
        let mut d = uniform(&comm, 2, &solver);
        let before = mass(&d);
        let weight = |p: &Patch<CellGrid, 2>| if p.info().global_index < 4 { 10 } else { 1 };
        let stats = d.partition(&comm, &solver, weight).unwrap();
        d.validate_invariants().unwrap();
        assert!(!d.is_setup());
        assert_eq!(d.generation(), 1);

        // Moved state is intact: compare with a fresh initialization.
        for p in d.patches() {
            let mut fresh = solver.build(p.info(), BuildMode::ForUpdate).unwrap();
            solver.initialize(p.info(), &mut fresh).unwrap();
            let got: Vec<f64> = p.state().unwrap().interior().collect();
            let want: Vec<f64> = fresh.interior().collect();
            assert_eq!(got, want);
        }
        let globals: Vec<usize> = d.patches().iter().map(|p| p.info().global_index).collect();
        (comm.rank(), d.offsets().to_vec(), globals, before, mass(&d), stats)
    });

    let offsets = &out[0].1;
    assert!(out.iter().all(|o| &o.1 == offsets));
    // Weights 4 * 10 + 12 * 1 = 52; the heavy corner is split over ranks 0 and 1.
    assert_eq!(offsets, &vec![0, 2, 3, 16]);

    let mut all: Vec<usize> = out.iter().flat_map(|o| o.2.clone()).collect();
    all.sort_unstable();
    assert_eq!(all, (0..16).collect::<Vec<_>>());

    let before: f64 = out.iter().map(|o| o.3).sum();
    let after: f64 = out.iter().map(|o| o.4).sum();
    assert!((before - after).abs() < 1e-12);

    let sent: usize = out.iter().map(|o| o.5.sent).sum();
    let received: usize = out.iter().map(|o| o.5.received).sum();
    assert_eq!(sent, received);
    assert!(sent > 0);
}

#[test]
fn uniform_partition_is_stable() {
    let out = on_world(2, |comm| {
        let solver = advection(disk);
        let mut d = uniform(&comm, 2, &solver);
        let first = d.partition_uniform(&comm, &solver).unwrap();
        let second = d.partition_uniform(&comm, &solver).unwrap();
        (first.sent, second.sent, d.offsets().to_vec(), d.generation())
    });
    for (a, b, offsets, generation) in out {
        assert_eq!((a, b), (0, 0));
        assert_eq!(offsets, vec![0, 8, 16]);
        assert_eq!(generation, 2);
    }
}

#[test]
fn diverged_generations_are_detected() {
    let out = on_world(2, |comm| {
        let solver = advection(disk);
        let mut d = if comm.rank() == 1 {
            // A serial domain that has already moved on by one generation.
            let mut d = uniform(&NoComm, 1, &solver);
            d.partition_uniform(&NoComm, &solver).unwrap();
            d
        } else {
            let map = Arc::new(MapContext::nomap());
            let mut d = Domain::new_uniform(&comm, Connectivity::unit(), map, 1).unwrap();
            d.initialize_new(&solver).unwrap();
            d
        };
        d.partition_uniform(&comm, &solver).map(|_| ())
    });
    assert!(out.iter().all(|r| matches!(
        r,
        Err(MeshForestError::GenerationMismatch { .. })
    )));
}
