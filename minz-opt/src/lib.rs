//! MIR optimization passes and the register allocation pre-pass.
//!
//! Passes run in a fixed order, each to its own fixed point, before the
//! module freezes for codegen: dead code, copy propagation, algebraic
//! simplification, constant folding and tail-call recognition. The linear
//! scan allocator then maps virtual registers onto the Z80's physical and
//! shadow registers or spill slots.

#![warn(missing_docs)]

mod liveness;
pub mod passes;
mod regalloc;

pub use liveness::Liveness;
pub use regalloc::{allocate, Allocation, Loc, Reg16, Reg8};

use minz_mir::Module;
use tracing::debug;

/// Run every MIR pass over every function to fixed point.
pub fn optimize(module: &mut Module) {
    let signatures: std::collections::HashMap<String, Vec<minz_types::Type>> = module
        .functions()
        .map(|f| {
            (
                f.name.clone(),
                f.params.iter().map(|p| p.ty.clone()).collect(),
            )
        })
        .collect();

    let names: Vec<String> = module.functions().map(|f| f.name.clone()).collect();
    for name in names {
        let Some(function) = module.function_mut(&name) else {
            continue;
        };
        let mut round = 0usize;
        loop {
            let mut changes = 0;
            changes += passes::constant_fold(function);
            changes += passes::copy_propagation(function);
            changes += passes::algebraic_simplify(function);
            changes += passes::dead_code(function);
            if changes == 0 {
                break;
            }
            round += 1;
            debug!(function = %name, round, changes, "optimizer round");
        }
        let tails = passes::mark_tail_calls(function, &signatures);
        if tails > 0 {
            debug!(function = %name, tails, "tail calls marked");
        }
    }
}
