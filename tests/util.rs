#![allow(dead_code)]
use mesh_forest::algs::communicator::{Communicator, LocalComm};
use mesh_forest::domain::Domain;
use mesh_forest::forest::Connectivity;
use mesh_forest::map::MapContext;
use mesh_forest::solver::scalar::{CellGrid, ScalarAdvection};
use std::sync::Arc;

/// Run `f` once per rank of an in-process world, one thread each.
pub fn on_world<T: Send + 'static>(
    n: usize,
    f: impl Fn(LocalComm) -> T + Send + Sync + Clone + 'static,
) -> Vec<T> {
    let handles: Vec<_> = LocalComm::world(n)
        .into_iter()
        .map(|comm| {
            let f = f.clone();
            std::thread::spawn(move || f(comm))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// A disk of ones in a field of zeros.
pub fn disk(p: [f64; 3]) -> f64 {
    let (dx, dy) = (p[0] - 0.3, p[1] - 0.4);
    if dx * dx + dy * dy < 0.04 { 1.0 } else { 0.0 }
}

/// Smooth linear data; survives refine then coarsen exactly.
pub fn ramp(p: [f64; 3]) -> f64 {
    p[0] + 2.0 * p[1]
}

pub fn advection(initial: fn([f64; 3]) -> f64) -> ScalarAdvection {
    ScalarAdvection::new(
        8,
        8,
        2,
        [1.0, 0.5],
        Arc::new(MapContext::nomap()),
        Arc::new(initial),
    )
    .unwrap()
}

/// Uniform, initialized, set-up domain on the unit square.
pub fn uniform<C: Communicator>(comm: &C, level: u8, solver: &ScalarAdvection) -> Domain<CellGrid, 2> {
    let mut d = Domain::new_uniform(comm, Connectivity::unit(), Arc::new(MapContext::nomap()), level).unwrap();
    d.initialize_new(solver).unwrap();
    d.setup(comm).unwrap();
    d
}

/// Every cell value including ghost layers, row by row.
pub fn full_grid(g: &CellGrid) -> Vec<f64> {
    let b = g.mbc() as isize;
    let mut out = Vec::new();
    for j in -b..g.my() as isize + b {
        for i in -b..g.mx() as isize + b {
            out.push(g.get(i, j));
        }
    }
    out
}

/// Cell-area weighted total of a rank's interior data.
pub fn mass(d: &Domain<CellGrid, 2>) -> f64 {
    d.patches()
        .iter()
        .map(|p| {
            let g = p.state().unwrap();
            let area = p.info().width().powi(2) / (g.mx() * g.my()) as f64;
            g.interior_sum() * area
        })
        .sum()
}
