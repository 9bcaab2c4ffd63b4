//! Per-run instrumentation carried from one domain generation to the next.

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Walltime,
    Init,
    RegridBuild,
    Tagging,
    AdaptComm,
    Partition,
    GhostExchange,
    Output,
    Advance,
}

impl TimerKind {
    pub const ALL: [TimerKind; 9] = [
        TimerKind::Walltime,
        TimerKind::Init,
        TimerKind::RegridBuild,
        TimerKind::Tagging,
        TimerKind::AdaptComm,
        TimerKind::Partition,
        TimerKind::GhostExchange,
        TimerKind::Output,
        TimerKind::Advance,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            TimerKind::Walltime => "walltime",
            TimerKind::Init => "init",
            TimerKind::RegridBuild => "regrid build",
            TimerKind::Tagging => "tagging",
            TimerKind::AdaptComm => "adapt comm",
            TimerKind::Partition => "partition",
            TimerKind::GhostExchange => "ghost exchange",
            TimerKind::Output => "output",
            TimerKind::Advance => "advance",
        }
    }
}

/// Accumulated time and call count per [`TimerKind`].
#[derive(Clone, Debug, Default)]
pub struct Timers {
    elapsed: [Duration; 9],
    calls: [u64; 9],
}

impl Timers {
    pub fn add(&mut self, kind: TimerKind, d: Duration) {
        self.elapsed[kind.index()] += d;
        self.calls[kind.index()] += 1;
    }

    pub fn elapsed(&self, kind: TimerKind) -> Duration {
        self.elapsed[kind.index()]
    }

    pub fn calls(&self, kind: TimerKind) -> u64 {
        self.calls[kind.index()]
    }

    /// Log a summary at info level.
    pub fn report(&self) {
        for kind in TimerKind::ALL {
            if self.calls(kind) > 0 {
                log::info!(
                    "timer {:>14}: {:>10.4} s over {} calls",
                    kind.name(),
                    self.elapsed(kind).as_secs_f64(),
                    self.calls(kind)
                );
            }
        }
    }
}
