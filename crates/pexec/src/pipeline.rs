//! Pipeline composer: wires a sequence of `RunningCommand`s together so
//! each stage's chosen output feeds the next stage's stdin.

use std::ffi::OsString;

use pexec_core::{Fault, pick_pipeline_fault};

use crate::command::RunningCommand;
use crate::options::{Options, Piped};

/// One stage of a pipeline: a resolved program, its arguments, and the
/// options it should run with. `piped` is forced to `Piped::Out` for every
/// stage but the last, overriding whatever the caller set.
pub struct Stage {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub opts: Options,
}

/// Run `stages` as `P1 | P2 | ... | Pn`, left to right.
///
/// `fg` on any stage is rejected: a pipeline is inherently multi-stage, and
/// `fg`'s exclusivity with stdin/stdout/stderr wiring is enforced here
/// rather than per-stage.
pub fn run(mut stages: Vec<Stage>) -> Result<Vec<RunningCommand>, Fault> {
    if stages.is_empty() {
        return Err(Fault::UsageFault("pipeline requires at least one stage".into()));
    }
    if stages.iter().any(|s| s.opts.fg) {
        return Err(Fault::UsageFault(
            "fg is incompatible with a multi-stage pipeline".into(),
        ));
    }
    if stages.len() == 1 {
        let stage = stages.remove(0);
        let cmd = RunningCommand::new(stage.program, stage.args, stage.opts)?;
        return Ok(vec![cmd]);
    }

    let last = stages.len() - 1;
    for (idx, stage) in stages.iter_mut().enumerate() {
        if idx != last {
            stage.opts.piped = Piped::Out;
            stage.opts.bg = true;
        }
    }

    let mut commands = Vec::with_capacity(stages.len());
    let mut faults = Vec::new();

    let mut upstream_output: Option<crate::writer::StdinSource> = None;
    for (idx, stage) in stages.into_iter().enumerate() {
        let mut opts = stage.opts;
        if let Some(source) = upstream_output.take() {
            opts.stdin = Some(source);
        }
        let is_last = idx == last;
        if !is_last {
            opts.bg = true;
        }

        let mut cmd = RunningCommand::new(stage.program, stage.args, opts)?;
        upstream_output = Some(cmd.take_piped_queue(false).map_or_else(
            || crate::writer::StdinSource::Bytes(Vec::new()),
            crate::writer::StdinSource::Queue,
        ));
        commands.push(cmd);
    }

    // Reap left to right: `Pn` (the last pushed) only meaningfully
    // completes once every upstream has produced all of its output, which
    // the pipe-queues already enforce; waiting in stage order just
    // surfaces upstream faults before downstream ones when both occur.
    for cmd in commands.iter_mut() {
        if let Err(fault) = cmd.wait(None) {
            faults.push(fault);
        }
    }

    if let Some(fault) = pick_pipeline_fault(faults) {
        return Err(fault);
    }

    Ok(commands)
}
