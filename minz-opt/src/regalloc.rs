//! Linear-scan register allocation over virtual registers.
//!
//! Three tiers, tried in order: the Z80's physical registers, the shadow
//! bank (reached through `EX AF,AF'`/`EXX`), and spill slots in memory.
//! SMC functions address their spill slots absolutely; everything else
//! gets IX-relative frame slots. Copy-related registers are coalesced by
//! assignment hints, which matters most for 16-bit pairs.

use std::collections::HashMap;

use minz_mir::{Function, Instruction, Module, VReg};
use minz_types::Type;
use tracing::trace;

use crate::liveness::Liveness;

/// An 8-bit Z80 register available to the allocator.
///
/// `A` is excluded: the code generator keeps the accumulator as its
/// working register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Reg8 {
    /// B register.
    B,
    /// C register.
    C,
    /// D register.
    D,
    /// E register.
    E,
    /// H register.
    H,
    /// L register.
    L,
}

/// A 16-bit Z80 register pair available to the allocator.
///
/// `HL` is excluded: the code generator keeps it as the 16-bit working
/// register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Reg16 {
    /// BC pair.
    BC,
    /// DE pair.
    DE,
}

impl Reg16 {
    /// The 8-bit halves of the pair.
    pub const fn halves(self) -> (Reg8, Reg8) {
        match self {
            Self::BC => (Reg8::B, Reg8::C),
            Self::DE => (Reg8::D, Reg8::E),
        }
    }
}

/// Where a virtual register lives for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    /// A physical 8-bit register.
    R8(Reg8),
    /// A physical 16-bit pair.
    R16(Reg16),
    /// An 8-bit register in the shadow bank.
    Shadow8(Reg8),
    /// A 16-bit pair in the shadow bank.
    Shadow16(Reg16),
    /// A memory spill slot, numbered per function.
    Spill(u16),
}

impl Loc {
    /// Whether this location survives only through the shadow bank.
    pub const fn is_shadow(&self) -> bool {
        matches!(self, Self::Shadow8(_) | Self::Shadow16(_))
    }
}

/// The allocator's result for one function.
#[derive(Debug, Default)]
pub struct Allocation {
    /// Assigned location per virtual register.
    pub locs: HashMap<VReg, Loc>,
    /// Number of spill slots the function frame needs.
    pub spill_slots: u16,
    /// Whether each register holds a 16-bit value.
    pub wide: HashMap<VReg, bool>,
}

impl Allocation {
    /// Location of a register, defaulting to a fresh description of a
    /// spilled value for registers the scan never saw (dead code).
    pub fn loc(&self, reg: VReg) -> Option<Loc> {
        self.locs.get(&reg).copied()
    }
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    reg: VReg,
    start: usize,
    end: usize,
    wide: bool,
}

/// Infer whether each register holds a 16-bit value.
fn widths(function: &Function, module: &Module) -> HashMap<VReg, bool> {
    let mut wide: HashMap<VReg, bool> = HashMap::new();
    for param in &function.params {
        wide.insert(param.vreg, param.ty.size_of() > 1);
    }
    // One forward pass suffices: definitions precede uses in block order
    // for everything the analyzer emits.
    for instruction in function.instructions() {
        let Some(dst) = instruction.dst() else {
            continue;
        };
        let is_wide = match instruction {
            Instruction::LoadConst { ty, .. } => ty.size_of() > 1,
            Instruction::LoadVar { name, .. } => module
                .globals()
                .find(|g| &g.name == name)
                .map(|g| g.ty.size_of() > 1)
                // Local slots default to wide, which is always safe.
                .unwrap_or(true),
            Instruction::LoadParam { index, .. } => function
                .params
                .get(*index as usize)
                .map(|p| p.ty.size_of() > 1)
                .unwrap_or(false),
            Instruction::LoadString { .. } | Instruction::LoadFunc { .. } => true,
            Instruction::Move { src, .. } => wide.get(src).copied().unwrap_or(true),
            Instruction::Binary { lhs, rhs, .. } => {
                wide.get(lhs).copied().unwrap_or(true)
                    || wide.get(rhs).copied().unwrap_or(true)
            }
            Instruction::Unary { src, .. } => wide.get(src).copied().unwrap_or(true),
            Instruction::Cmp { .. } => false,
            Instruction::Call { callee, .. } => module
                .function(callee)
                .map(|f| f.ret.size_of() > 1)
                .unwrap_or(true),
            Instruction::CallIndirect { .. } => true,
            Instruction::AnchorLoad { function: owner, param, .. } => module
                .function(owner)
                .and_then(|f| f.params.get(*param as usize))
                .map(|p| p.ty.size_of() > 1)
                .unwrap_or(true),
            Instruction::PortIn { .. } => false,
            _ => true,
        };
        wide.insert(dst, is_wide);
    }
    wide
}

fn intervals(function: &Function, wide: &HashMap<VReg, bool>) -> Vec<Interval> {
    let mut first: HashMap<VReg, usize> = HashMap::new();
    let mut last: HashMap<VReg, usize> = HashMap::new();
    let mut position = 0usize;

    // Parameters are defined by the prologue and must keep distinct
    // locations at least through the first instruction.
    for param in &function.params {
        first.insert(param.vreg, 0);
        last.insert(param.vreg, 1);
    }

    for block in &function.blocks {
        for instruction in &block.instructions {
            position += 1;
            for used in instruction.uses() {
                last.insert(used, position);
            }
            if let Some(dst) = instruction.dst() {
                first.entry(dst).or_insert(position);
                last.entry(dst).or_insert(position);
            }
        }
        position += 1;
        if let Some(terminator) = &block.terminator {
            for used in terminator.uses() {
                last.insert(used, position);
            }
        }
    }

    // Values live across a back edge must survive the whole loop body;
    // extending every cross-block value to the function end is the
    // conservative linear-scan approximation.
    let liveness = Liveness::analyze(function);
    for block in &function.blocks {
        for reg in liveness.live_out(block.id) {
            let end = last.entry(reg).or_insert(position);
            *end = (*end).max(position);
        }
    }

    let mut out: Vec<Interval> = first
        .iter()
        .map(|(&reg, &start)| Interval {
            reg,
            start,
            end: last.get(&reg).copied().unwrap_or(start),
            wide: wide.get(&reg).copied().unwrap_or(true),
        })
        .collect();
    out.sort_by_key(|i| (i.start, i.reg));
    out
}

/// Collect coalescing hints from `mov` instructions.
fn move_hints(function: &Function) -> HashMap<VReg, VReg> {
    let mut hints = HashMap::new();
    for instruction in function.instructions() {
        if let Instruction::Move { dst, src } = instruction {
            hints.insert(*dst, *src);
        }
    }
    hints
}

/// Run linear scan for one function.
pub fn allocate(function: &Function, module: &Module) -> Allocation {
    let wide = widths(function, module);
    let intervals = intervals(function, &wide);
    let hints = move_hints(function);

    let mut allocation = Allocation {
        wide: wide.clone(),
        ..Allocation::default()
    };
    // The emitter stages values through A, HL, E and DE; only B, C and
    // the BC pair are allocatable in the main bank. The shadow bank is
    // untouched by staging, so all of it is available.
    let mut free8: Vec<Reg8> = vec![Reg8::C, Reg8::B];
    let mut free16: Vec<Reg16> = vec![Reg16::BC];
    let mut free8_shadow: Vec<Reg8> = vec![Reg8::L, Reg8::H, Reg8::E, Reg8::D, Reg8::C, Reg8::B];
    let mut free16_shadow: Vec<Reg16> = vec![Reg16::DE, Reg16::BC];
    let mut active: Vec<(Interval, Loc)> = Vec::new();

    // Taking a pair removes its halves from the byte pool and vice
    // versa, in both banks.
    fn take8(free8: &mut Vec<Reg8>, free16: &mut Vec<Reg16>) -> Option<Reg8> {
        let reg = free8.pop()?;
        free16.retain(|p| {
            let (hi, lo) = p.halves();
            hi != reg && lo != reg
        });
        Some(reg)
    }
    fn take16(free8: &mut Vec<Reg8>, free16: &mut Vec<Reg16>) -> Option<Reg16> {
        let pair = free16.pop()?;
        let (hi, lo) = pair.halves();
        free8.retain(|r| *r != hi && *r != lo);
        Some(pair)
    }
    fn give8(free8: &mut Vec<Reg8>, free16: &mut Vec<Reg16>, reg: Reg8, all16: &[Reg16]) {
        free8.push(reg);
        for pair in all16 {
            let (hi, lo) = pair.halves();
            if free8.contains(&hi) && free8.contains(&lo) && !free16.contains(pair) {
                free16.push(*pair);
            }
        }
    }
    fn give16(free8: &mut Vec<Reg8>, free16: &mut Vec<Reg16>, pair: Reg16) {
        let (hi, lo) = pair.halves();
        if !free8.contains(&hi) {
            free8.push(hi);
        }
        if !free8.contains(&lo) {
            free8.push(lo);
        }
        free16.push(pair);
    }
    const MAIN_PAIRS: &[Reg16] = &[Reg16::BC];
    const SHADOW_PAIRS: &[Reg16] = &[Reg16::BC, Reg16::DE];

    for interval in intervals {
        // Expire finished intervals, returning their registers. An
        // interval ending exactly where this one starts may hand its
        // register over: operands are staged through the accumulator, so
        // a definition may reuse the register of its last-use operand.
        active.retain(|(live, loc)| {
            if live.end <= interval.start {
                match loc {
                    Loc::R8(r) => give8(&mut free8, &mut free16, *r, MAIN_PAIRS),
                    Loc::R16(p) => give16(&mut free8, &mut free16, *p),
                    Loc::Shadow8(r) => {
                        give8(&mut free8_shadow, &mut free16_shadow, *r, SHADOW_PAIRS)
                    }
                    Loc::Shadow16(p) => give16(&mut free8_shadow, &mut free16_shadow, *p),
                    Loc::Spill(_) => {}
                }
                false
            } else {
                true
            }
        });

        // A copy-related register reuses its partner's location when the
        // partner is already retired; this is what coalesces 16-bit
        // pairs.
        let hinted = hints.get(&interval.reg).and_then(|partner| {
            let loc = allocation.loc(*partner)?;
            let free = match loc {
                Loc::R8(r) => free8.contains(&r),
                Loc::R16(p) => free16.contains(&p),
                Loc::Shadow8(r) => free8_shadow.contains(&r),
                Loc::Shadow16(p) => free16_shadow.contains(&p),
                Loc::Spill(_) => false,
            };
            free.then_some(loc)
        });

        let loc = if let Some(loc) = hinted {
            match loc {
                Loc::R8(r) => {
                    free8.retain(|x| *x != r);
                    free16.retain(|p| {
                        let (hi, lo) = p.halves();
                        hi != r && lo != r
                    });
                }
                Loc::R16(p) => {
                    let (hi, lo) = p.halves();
                    free16.retain(|x| *x != p);
                    free8.retain(|r| *r != hi && *r != lo);
                }
                Loc::Shadow8(r) => {
                    free8_shadow.retain(|x| *x != r);
                    free16_shadow.retain(|p| {
                        let (hi, lo) = p.halves();
                        hi != r && lo != r
                    });
                }
                Loc::Shadow16(p) => {
                    let (hi, lo) = p.halves();
                    free16_shadow.retain(|x| *x != p);
                    free8_shadow.retain(|r| *r != hi && *r != lo);
                }
                Loc::Spill(_) => {}
            }
            loc
        } else if interval.wide {
            take16(&mut free8, &mut free16)
                .map(Loc::R16)
                .or_else(|| take16(&mut free8_shadow, &mut free16_shadow).map(Loc::Shadow16))
                .unwrap_or_else(|| {
                    let slot = allocation.spill_slots;
                    allocation.spill_slots += 2;
                    Loc::Spill(slot)
                })
        } else {
            take8(&mut free8, &mut free16)
                .map(Loc::R8)
                .or_else(|| take8(&mut free8_shadow, &mut free16_shadow).map(Loc::Shadow8))
                .unwrap_or_else(|| {
                    let slot = allocation.spill_slots;
                    allocation.spill_slots += 1;
                    Loc::Spill(slot)
                })
        };

        trace!(function = %function.name, reg = %interval.reg, ?loc, "assigned");
        allocation.locs.insert(interval.reg, loc);
        active.push((interval, loc));
    }

    allocation
}

#[cfg(test)]
mod tests {
    use super::*;
    use minz_mir::{BinOp, Instruction, Terminator};
    use minz_types::SourceSpan;

    fn module_with(function: Function) -> Module {
        let mut module = Module::new("m");
        module.add_function(function);
        module
    }

    #[test]
    fn narrow_values_get_byte_registers() {
        let mut f = Function::new("t", Type::U8, SourceSpan::synthesized());
        let a = f.add_param("a", Type::U8);
        let b = f.add_param("b", Type::U8);
        let sum = f.alloc_vreg();
        let entry = f.entry();
        f.push(
            entry,
            Instruction::Binary {
                op: BinOp::Add,
                dst: sum,
                lhs: a,
                rhs: b,
            },
        );
        f.terminate(entry, Terminator::Return(Some(sum)));
        let module = module_with(f.clone());

        let allocation = allocate(module.function("t").unwrap(), &module);
        for reg in [a, b, sum] {
            assert!(
                matches!(allocation.loc(reg), Some(Loc::R8(_))),
                "{reg} should get an 8-bit register"
            );
        }
    }

    #[test]
    fn wide_values_get_pairs() {
        let mut f = Function::new("t", Type::U16, SourceSpan::synthesized());
        let a = f.add_param("a", Type::U16);
        let entry = f.entry();
        f.terminate(entry, Terminator::Return(Some(a)));
        let module = module_with(f);

        let allocation = allocate(module.function("t").unwrap(), &module);
        assert!(matches!(allocation.loc(a), Some(Loc::R16(_))));
    }

    #[test]
    fn pressure_overflows_into_shadow_then_spill() {
        let mut f = Function::new("t", Type::U8, SourceSpan::synthesized());
        let entry = f.entry();
        let mut regs = Vec::new();
        for i in 0..16 {
            let dst = f.alloc_vreg();
            f.push(
                entry,
                Instruction::LoadConst {
                    dst,
                    value: i,
                    ty: Type::U8,
                },
            );
            regs.push(dst);
        }
        // Keep everything live to the end.
        let mut acc = regs[0];
        for &reg in &regs[1..] {
            let dst = f.alloc_vreg();
            f.push(
                entry,
                Instruction::Binary {
                    op: BinOp::Add,
                    dst,
                    lhs: acc,
                    rhs: reg,
                },
            );
            acc = dst;
        }
        f.terminate(entry, Terminator::Return(Some(acc)));
        let module = module_with(f);

        let allocation = allocate(module.function("t").unwrap(), &module);
        let shadows = allocation
            .locs
            .values()
            .filter(|loc| loc.is_shadow())
            .count();
        assert!(shadows > 0, "pressure should reach the shadow bank");
    }

    #[test]
    fn copies_coalesce_when_possible() {
        let mut f = Function::new("t", Type::U16, SourceSpan::synthesized());
        let a = f.add_param("a", Type::U16);
        let b = f.alloc_vreg();
        let entry = f.entry();
        f.push(entry, Instruction::Move { dst: b, src: a });
        f.terminate(entry, Terminator::Return(Some(b)));
        let module = module_with(f);

        let allocation = allocate(module.function("t").unwrap(), &module);
        // `a` dies at the move, so `b` may take the same pair.
        assert_eq!(allocation.loc(a), allocation.loc(b));
    }
}
