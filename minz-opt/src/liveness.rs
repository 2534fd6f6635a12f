//! Per-block liveness over virtual registers.

use std::collections::{HashMap, HashSet};

use minz_mir::{BlockId, Function, VReg};

/// Live-in/live-out sets per basic block, from a backward fixed point over
/// the control-flow graph.
#[derive(Debug, Default)]
pub struct Liveness {
    live_in: HashMap<BlockId, HashSet<VReg>>,
    live_out: HashMap<BlockId, HashSet<VReg>>,
}

impl Liveness {
    /// Compute liveness for a function.
    pub fn analyze(function: &Function) -> Self {
        let mut uses: HashMap<BlockId, HashSet<VReg>> = HashMap::new();
        let mut defs: HashMap<BlockId, HashSet<VReg>> = HashMap::new();

        for block in &function.blocks {
            let mut block_uses = HashSet::new();
            let mut block_defs = HashSet::new();
            for instruction in &block.instructions {
                for used in instruction.uses() {
                    if !block_defs.contains(&used) {
                        block_uses.insert(used);
                    }
                }
                if let Some(dst) = instruction.dst() {
                    block_defs.insert(dst);
                }
            }
            if let Some(terminator) = &block.terminator {
                for used in terminator.uses() {
                    if !block_defs.contains(&used) {
                        block_uses.insert(used);
                    }
                }
            }
            uses.insert(block.id, block_uses);
            defs.insert(block.id, block_defs);
        }

        let mut live_in: HashMap<BlockId, HashSet<VReg>> = HashMap::new();
        let mut live_out: HashMap<BlockId, HashSet<VReg>> = HashMap::new();

        loop {
            let mut changed = false;
            for block in function.blocks.iter().rev() {
                let mut out: HashSet<VReg> = HashSet::new();
                if let Some(terminator) = &block.terminator {
                    for successor in terminator.successors() {
                        if let Some(succ_in) = live_in.get(&successor) {
                            out.extend(succ_in.iter().copied());
                        }
                    }
                }
                let mut input: HashSet<VReg> = uses[&block.id].clone();
                for reg in &out {
                    if !defs[&block.id].contains(reg) {
                        input.insert(*reg);
                    }
                }
                if live_out.get(&block.id) != Some(&out) {
                    live_out.insert(block.id, out);
                    changed = true;
                }
                if live_in.get(&block.id) != Some(&input) {
                    live_in.insert(block.id, input);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        Self { live_in, live_out }
    }

    /// Registers live on entry to a block.
    pub fn live_in(&self, block: BlockId) -> impl Iterator<Item = VReg> + '_ {
        self.live_in.get(&block).into_iter().flatten().copied()
    }

    /// Registers live on exit from a block.
    pub fn live_out(&self, block: BlockId) -> impl Iterator<Item = VReg> + '_ {
        self.live_out.get(&block).into_iter().flatten().copied()
    }

    /// Whether `reg` is live across the exit of `block`.
    pub fn is_live_out(&self, block: BlockId, reg: VReg) -> bool {
        self.live_out
            .get(&block)
            .is_some_and(|set| set.contains(&reg))
    }
}
