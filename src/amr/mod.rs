//! The adaptation control loop: initial refinement, regridding and time
//! stepping over a sequence of domain generations.
//!
//! Each adaptation pass tags the current domain, adapts it, sets up and
//! repopulates the successor, releases the old domain, repartitions and
//! rebuilds the ghost pattern. Every step is collective; all ranks must
//! drive their [`Simulation`] through the same calls.

use crate::algs::collective::all_reduce_max_f64;
use crate::algs::communicator::Communicator;
use crate::config::AmrOptions;
use crate::domain::{Domain, PatchSelector, TimerKind, repopulate};
use crate::forest::Connectivity;
use crate::ghost::{GhostExchange, GhostStats};
use crate::map::MapContext;
use crate::mesh_error::MeshForestError;
use crate::solver::{OutputWriter, PatchSolver, PhysicalBc, RefineCriterion};
use log::{debug, info};
use std::sync::Arc;
use std::time::Instant;

/// Result of one [`Simulation::advance`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepReport {
    pub step: u64,
    pub time: f64,
    /// Largest patch CFL number over all ranks.
    pub max_cfl: f64,
    pub regridded: bool,
}

pub struct Simulation<C, P, R, B, const D: usize>
where
    P: PatchSolver<D>,
{
    comm: C,
    solver: P,
    criterion: R,
    bc: B,
    options: AmrOptions,
    connectivity: Connectivity<D>,
    map: Arc<MapContext>,
    domain: Option<Domain<P::State, D>>,
    exchange: Option<GhostExchange<P::State, D>>,
    output: Option<Box<dyn OutputWriter<P::State, D>>>,
    time: f64,
    step: u64,
    /// Ghost layers hold the current patch data.
    ghosts_fresh: bool,
}

fn not_initialized() -> MeshForestError {
    MeshForestError::InvariantViolation("simulation used before initialize".into())
}

impl<C, P, R, B, const D: usize> Simulation<C, P, R, B, D>
where
    C: Communicator,
    P: PatchSolver<D>,
    R: RefineCriterion<P::State, D>,
    B: PhysicalBc<P::State, D>,
{
    /// Validate the configuration. Nothing collective happens until
    /// [`initialize`](Self::initialize).
    pub fn new(
        comm: C,
        solver: P,
        criterion: R,
        bc: B,
        options: AmrOptions,
        connectivity: Connectivity<D>,
        map: Arc<MapContext>,
    ) -> Result<Self, MeshForestError> {
        options.validate::<D>()?;
        if let Some(n) = map.expected_blocks() {
            if n != connectivity.num_blocks() {
                return Err(MeshForestError::InvalidConnectivity(format!(
                    "map expects {n} blocks, connectivity has {}",
                    connectivity.num_blocks()
                )));
            }
        }
        Ok(Self {
            comm,
            solver,
            criterion,
            bc,
            options,
            connectivity,
            map,
            domain: None,
            exchange: None,
            output: None,
            time: 0.0,
            step: 0,
            ghosts_fresh: false,
        })
    }

    pub fn with_output(mut self, writer: Box<dyn OutputWriter<P::State, D>>) -> Self {
        self.output = Some(writer);
        self
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn solver(&self) -> &P {
        &self.solver
    }

    pub fn options(&self) -> &AmrOptions {
        &self.options
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn domain(&self) -> Result<&Domain<P::State, D>, MeshForestError> {
        self.domain.as_ref().ok_or_else(not_initialized)
    }

    pub fn exchange(&self) -> Option<&GhostExchange<P::State, D>> {
        self.exchange.as_ref()
    }

    /// Build the uniform domain at `minlevel`, then refine level by level
    /// until the criterion is satisfied or `maxlevel` is reached.
    pub fn initialize(&mut self) -> Result<(), MeshForestError> {
        let t0 = Instant::now();
        let mut domain = Domain::new_uniform(
            &self.comm,
            self.connectivity.clone(),
            Arc::clone(&self.map),
            self.options.minlevel,
        )?;
        let t_init = Instant::now();
        domain.initialize_new(&self.solver)?;
        domain.timers_mut().add(TimerKind::Init, t_init.elapsed());
        self.domain = Some(domain);
        self.rebuild_pattern()?;
        #[cfg(feature = "rayon")]
        info!("Patch callbacks run on {} threads", rayon::current_num_threads());

        if self.options.init_ghostcell {
            self.fill_ghosts()?;
        }
        if self.options.output_init {
            let label = format!("{}_init_level_{:02}", self.options.prefix, self.options.minlevel);
            self.write_output(&label)?;
        }

        for level in self.options.minlevel..self.options.maxlevel {
            if !self.adapt_pass(true, Some(level))? {
                break;
            }
            info!("Have new initial refinement");
            if self.options.output_init {
                let label = format!("{}_init_level_{:02}_adapt", self.options.prefix, level);
                self.write_output(&label)?;
            }
        }

        if self.options.init_ghostcell {
            self.fill_ghosts()?;
        } else {
            self.apply_bc()?;
        }
        let domain = self.domain.as_mut().ok_or_else(not_initialized)?;
        domain.timers_mut().add(TimerKind::Walltime, t0.elapsed());
        info!(
            "Global minlevel {} maxlevel {}",
            domain.global_min_level(),
            domain.global_max_level()
        );
        Ok(())
    }

    /// Adapt until nothing changes or every level has had a chance to move.
    /// Returns the number of passes that changed the mesh.
    pub fn regrid(&mut self) -> Result<usize, MeshForestError> {
        let mut changed = 0;
        for _ in 0..self.options.level_count() {
            if !self.adapt_pass(false, None)? {
                break;
            }
            changed += 1;
        }
        if changed > 0 {
            self.fill_ghosts()?;
        }
        debug!("regrid at step {}: {changed} passes", self.step);
        Ok(changed)
    }

    /// One time step: periodic regrid, ghost fill, physical boundaries and
    /// the solver update on every local patch.
    pub fn advance(&mut self, dt: f64) -> Result<StepReport, MeshForestError> {
        let interval = self.options.regrid_interval as u64;
        let regridded = interval > 0 && self.step > 0 && self.step % interval == 0 && self.regrid()? > 0;
        if !self.ghosts_fresh {
            self.fill_ghosts()?;
        }

        let t0 = Instant::now();
        let time = self.time;
        let solver = &self.solver;
        let domain = self.domain.as_mut().ok_or_else(not_initialized)?;
        let local_cfl = update_patches(domain, solver, time, dt)?;
        let max_cfl = all_reduce_max_f64(&self.comm, local_cfl)?;
        domain.timers_mut().add(TimerKind::Advance, t0.elapsed());
        self.ghosts_fresh = false;

        self.time += dt;
        self.step += 1;
        debug!("step {} t = {} max cfl {max_cfl}", self.step, self.time);
        Ok(StepReport {
            step: self.step,
            time: self.time,
            max_cfl,
            regridded,
        })
    }

    /// Fill ghosts on every level present, interpolating across level jumps,
    /// then apply physical boundary conditions.
    pub fn fill_ghosts(&mut self) -> Result<GhostStats, MeshForestError> {
        let t0 = Instant::now();
        let domain = self.domain.as_mut().ok_or_else(not_initialized)?;
        let exchange = self.exchange.as_mut().ok_or_else(not_initialized)?;
        let (min_level, max_level) = (domain.global_min_level(), domain.global_max_level());
        let stats = exchange.update(domain, &self.comm, &self.solver, min_level, max_level, self.time, true)?;
        domain.timers_mut().add(TimerKind::GhostExchange, t0.elapsed());
        self.apply_bc()?;
        self.ghosts_fresh = true;
        Ok(stats)
    }

    /// Fill physical-boundary ghost cells of every local patch.
    fn apply_bc(&mut self) -> Result<(), MeshForestError> {
        let domain = self.domain.as_mut().ok_or_else(not_initialized)?;
        let (bc, time) = (&self.bc, self.time);
        domain.iterate_mut(PatchSelector::All, |p| {
            let (info, state) = p.info_and_state_mut()?;
            bc.apply(info, state, time)
        })
    }

    /// Log accumulated timers.
    pub fn report(&self) {
        if let Some(d) = &self.domain {
            d.timers().report();
        }
    }

    fn rebuild_pattern(&mut self) -> Result<(), MeshForestError> {
        self.exchange = None;
        self.ghosts_fresh = false;
        let domain = self.domain.as_mut().ok_or_else(not_initialized)?;
        domain.setup(&self.comm)?;
        self.exchange = Some(GhostExchange::setup(domain, &self.comm)?);
        Ok(())
    }

    fn write_output(&mut self, label: &str) -> Result<(), MeshForestError> {
        let Some(writer) = self.output.as_mut() else {
            return Ok(());
        };
        let domain = self.domain.as_mut().ok_or_else(not_initialized)?;
        let t0 = Instant::now();
        writer.write(domain, label)?;
        domain.timers_mut().add(TimerKind::Output, t0.elapsed());
        Ok(())
    }

    /// Tag, adapt, repopulate, repartition. Returns `false` when the mesh did not change.
    fn adapt_pass(&mut self, initializing: bool, level: Option<u8>) -> Result<bool, MeshForestError> {
        let domain = self.domain.as_mut().ok_or_else(not_initialized)?;

        let t0 = Instant::now();
        domain.tag_patches(&self.criterion, initializing, level)?;
        domain.timers_mut().add(TimerKind::Tagging, t0.elapsed());

        let t0 = Instant::now();
        let Some(mut next) = domain.adapt(&self.comm, &self.options)? else {
            return Ok(false);
        };
        next.timers_mut().add(TimerKind::AdaptComm, t0.elapsed());

        let t0 = Instant::now();
        next.setup(&self.comm)?;
        let stats = repopulate(domain, &mut next, &self.solver, initializing)?;
        next.timers_mut().add(TimerKind::RegridBuild, t0.elapsed());
        debug!(
            "generation {} -> {}: {} unchanged, {} refined, {} coarsened",
            domain.generation(),
            next.generation(),
            stats.unchanged,
            stats.refined,
            stats.coarsened
        );

        self.exchange = None;
        if let Some(old) = self.domain.replace(next) {
            old.reset();
        }

        let domain = self.domain.as_mut().ok_or_else(not_initialized)?;
        let t0 = Instant::now();
        domain.partition_uniform(&self.comm, &self.solver)?;
        domain.timers_mut().add(TimerKind::Partition, t0.elapsed());
        self.rebuild_pattern()?;
        Ok(true)
    }
}

#[cfg(feature = "rayon")]
fn update_patches<P, const D: usize>(
    domain: &mut Domain<P::State, D>,
    solver: &P,
    time: f64,
    dt: f64,
) -> Result<f64, MeshForestError>
where
    P: PatchSolver<D>,
{
    use parking_lot::Mutex;
    let max_cfl = Mutex::new(0.0f64);
    domain.par_iterate_mut(PatchSelector::All, |p| {
        let (info, state) = p.info_and_state_mut()?;
        let cfl = solver.compute_update(info, state, time, dt)?;
        let mut m = max_cfl.lock();
        *m = m.max(cfl);
        Ok(())
    })?;
    Ok(max_cfl.into_inner())
}

#[cfg(not(feature = "rayon"))]
fn update_patches<P, const D: usize>(
    domain: &mut Domain<P::State, D>,
    solver: &P,
    time: f64,
    dt: f64,
) -> Result<f64, MeshForestError>
where
    P: PatchSolver<D>,
{
    let mut max_cfl = 0.0f64;
    domain.iterate_mut(PatchSelector::All, |p| {
        let (info, state) = p.info_and_state_mut()?;
        max_cfl = max_cfl.max(solver.compute_update(info, state, time, dt)?);
        Ok(())
    })?;
    Ok(max_cfl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::patch::PatchInfo;
    use crate::solver::{NoBc, Tag};
    use crate::solver::testing::CountingSolver;

    fn refine_lower_left(info: &PatchInfo<2>, _: &Vec<f64>, _: bool) -> Tag {
        if info.lower == [0.0, 0.0] { Tag::Refine } else { Tag::Stay }
    }

    type Sim = Simulation<NoComm, CountingSolver, fn(&PatchInfo<2>, &Vec<f64>, bool) -> Tag, NoBc, 2>;

    fn sim(options: AmrOptions) -> Sim {
        Simulation::new(
            NoComm,
            CountingSolver::default(),
            refine_lower_left as fn(&PatchInfo<2>, &Vec<f64>, bool) -> Tag,
            NoBc,
            options,
            Connectivity::unit(),
            Arc::new(MapContext::nomap()),
        )
        .unwrap()
    }

    struct Labels(Arc<parking_lot::Mutex<Vec<String>>>);

    impl OutputWriter<Vec<f64>, 2> for Labels {
        fn write(&mut self, _: &Domain<Vec<f64>, 2>, label: &str) -> Result<(), MeshForestError> {
            self.0.lock().push(label.to_string());
            Ok(())
        }
    }

    #[test]
    fn initial_refinement_stops_at_maxlevel() {
        let mut s = sim(AmrOptions::with_levels(1, 3));
        s.initialize().unwrap();
        let d = s.domain().unwrap();
        // The lower-left corner is refined once per level.
        assert_eq!(d.num_global_patches(), 4 + 3 + 3);
        assert_eq!(d.global_min_level(), 1);
        assert_eq!(d.global_max_level(), 3);
        assert!(d.forest().is_balanced());
        assert_eq!(s.exchange().unwrap().pattern().generation(), d.generation());
    }

    #[test]
    fn initialization_outputs_each_level() {
        let labels = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut options = AmrOptions::with_levels(0, 2);
        options.output_init = true;
        options.prefix = "run".into();
        let mut s = sim(options).with_output(Box::new(Labels(Arc::clone(&labels))));
        s.initialize().unwrap();
        assert_eq!(
            *labels.lock(),
            vec!["run_init_level_00", "run_init_level_00_adapt", "run_init_level_01_adapt"]
        );
    }

    #[test]
    fn advance_requires_initialize() {
        let mut s = sim(AmrOptions::with_levels(0, 0));
        assert!(matches!(s.advance(0.1), Err(MeshForestError::InvariantViolation(_))));
        s.initialize().unwrap();
        let r = s.advance(0.1).unwrap();
        assert_eq!(r.step, 1);
        assert!(!r.regridded);
        assert!((s.time() - 0.1).abs() < 1e-15);
    }

    #[test]
    fn fresh_ghosts_are_not_refilled() {
        let mut options = AmrOptions::with_levels(0, 0);
        options.regrid_interval = 0;
        let mut s = sim(options);
        s.initialize().unwrap();
        let fills = |s: &Sim| s.domain().unwrap().timers().calls(TimerKind::GhostExchange);
        let after_init = fills(&s);
        s.advance(0.1).unwrap();
        assert_eq!(fills(&s), after_init);
        s.advance(0.1).unwrap();
        assert_eq!(fills(&s), after_init + 1);
    }

    #[test]
    fn rejects_bad_options() {
        let r = Simulation::<_, _, _, _, 2>::new(
            NoComm,
            CountingSolver::default(),
            refine_lower_left as fn(&PatchInfo<2>, &Vec<f64>, bool) -> Tag,
            NoBc,
            AmrOptions::with_levels(3, 1),
            Connectivity::unit(),
            Arc::new(MapContext::nomap()),
        );
        assert!(matches!(r, Err(MeshForestError::InvalidOptions(_))));
    }
}
