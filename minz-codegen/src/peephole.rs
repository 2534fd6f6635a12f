//! Pattern rewrites on the emitted instruction stream.
//!
//! Every rewrite is guarded by a register liveness check: a pattern only
//! fires when the registers it clobbers differently are provably dead at
//! the rewrite's exit. Note that `XOR A; LD (addr),A` is deliberately not
//! rewritten to a store of an immediate zero: the XOR also clears carry,
//! which following code may rely on.

use tracing::trace;

use crate::asm::Line;

/// Run the peephole until no pattern fires.
pub fn run(lines: &mut Vec<Line>) -> usize {
    let mut total = 0;
    loop {
        let changed = pass(lines);
        if changed == 0 {
            break;
        }
        total += changed;
    }
    total
}

fn pass(lines: &mut Vec<Line>) -> usize {
    let mut index = 0;
    let mut changes = 0;
    while index < lines.len() {
        // `LD L,E ; LD H,D` -> `EX DE,HL`, when DE is dead afterwards:
        // the exchange also moves the old HL into DE.
        if matches_ld(lines.get(index), "L", "E")
            && matches_ld(lines.get(index + 1), "H", "D")
            && is_dead_after(lines, index + 2, "D")
            && is_dead_after(lines, index + 2, "E")
        {
            trace!("peephole: LD L,E; LD H,D -> EX DE,HL");
            lines.splice(index..index + 2, [Line::inst("EX", &["DE", "HL"])]);
            changes += 1;
            continue;
        }

        // Two consecutive exchanges cancel out; no register differs at
        // the exit, so no guard is needed.
        if is_ex_de_hl(lines.get(index)) && is_ex_de_hl(lines.get(index + 1)) {
            trace!("peephole: double EX DE,HL removed");
            lines.drain(index..index + 2);
            changes += 1;
            continue;
        }

        // `LD X,A ; LD A,X`: A is unchanged in between, so the reload is
        // redundant regardless of liveness.
        let redundant_reload = match lines.get(index) {
            Some(Line::Inst { op, args, .. })
                if op == "LD" && args.len() == 2 && args[1] == "A"
                    && is_plain_reg8(&args[0]) =>
            {
                matches_ld(lines.get(index + 1), "A", &args[0])
            }
            _ => false,
        };
        if redundant_reload {
            trace!("peephole: redundant reload of A removed");
            lines.remove(index + 1);
            changes += 1;
            continue;
        }

        // A register load whose destination is dead is itself dead.
        // Labeled loads are exempt: a labeled `LD A,0` is a TSMC anchor
        // whose immediate byte is patched by callers.
        let labeled = index == 0 || matches!(lines.get(index - 1), Some(Line::Label(_)));
        let dead_load = !labeled
            && match lines.get(index) {
                Some(Line::Inst { op, args, .. })
                    if op == "LD" && args.len() == 2 && !args[0].starts_with('(') =>
                {
                    if is_plain_reg8(&args[0]) {
                        is_dead_after(lines, index + 1, &args[0])
                    } else if let Some((hi, lo)) = pair_containing(&args[0]) {
                        is_dead_after(lines, index + 1, hi)
                            && is_dead_after(lines, index + 1, lo)
                    } else {
                        false
                    }
                }
                _ => false,
            };
        if dead_load {
            trace!("peephole: dead register load removed");
            lines.remove(index);
            changes += 1;
            continue;
        }

        // `LD D,H ; LD E,L ; EX DE,HL` leaves HL unchanged and copies the
        // old HL into DE; deleting all three requires DE to be dead.
        if matches_ld(lines.get(index), "D", "H")
            && matches_ld(lines.get(index + 1), "E", "L")
            && is_ex_de_hl(lines.get(index + 2))
            && is_dead_after(lines, index + 3, "D")
            && is_dead_after(lines, index + 3, "E")
        {
            trace!("peephole: LD D,H; LD E,L; EX DE,HL removed");
            lines.drain(index..index + 3);
            changes += 1;
            continue;
        }

        index += 1;
    }
    changes
}

fn matches_ld(line: Option<&Line>, dst: &str, src: &str) -> bool {
    matches!(
        line,
        Some(Line::Inst { op, args, .. })
            if op == "LD" && args.len() == 2 && args[0] == dst && args[1] == src
    )
}

fn is_ex_de_hl(line: Option<&Line>) -> bool {
    matches!(
        line,
        Some(Line::Inst { op, args, .. })
            if op == "EX" && args.len() == 2 && args[0] == "DE" && args[1] == "HL"
    )
}

/// Conservative forward scan: `reg` is dead at `start` when every path
/// from there writes it before reading it. Any control transfer, label or
/// instruction we cannot classify counts as a read.
fn is_dead_after(lines: &[Line], start: usize, reg: &str) -> bool {
    for line in &lines[start..] {
        match line {
            Line::Inst { op, args, .. } => match classify(op, args, reg) {
                Access::Read => return false,
                Access::Write => return true,
                Access::None => {}
                Access::Unknown => return false,
            },
            // A label is a join point with unknown predecessors.
            Line::Label(_) => return false,
            Line::Comment(_) | Line::Blank => {}
            Line::Directive { .. } | Line::Equ { .. } => return false,
        }
    }
    // Fell off the end of the program: nothing reads it.
    true
}

enum Access {
    Read,
    Write,
    None,
    Unknown,
}

/// How one instruction touches an 8-bit register.
fn classify(op: &str, args: &[String], reg: &str) -> Access {
    let reads_arg = |arg: &String| {
        arg == reg
            || (arg.starts_with('(') && arg.contains(reg))
            || pair_containing(arg).is_some_and(|(hi, lo)| hi == reg || lo == reg)
    };

    match op {
        "LD" if args.len() == 2 => {
            let dst_writes = args[0] == reg
                || pair_containing(&args[0]).is_some_and(|(hi, lo)| hi == reg || lo == reg);
            if reads_arg(&args[1]) || (args[0].starts_with('(') && args[0].contains(reg)) {
                Access::Read
            } else if dst_writes && !args[0].starts_with('(') {
                Access::Write
            } else {
                Access::None
            }
        }
        "INC" | "DEC" if args.len() == 1 => {
            if reads_arg(&args[0]) {
                Access::Read
            } else {
                Access::None
            }
        }
        "ADD" | "ADC" | "SUB" | "SBC" | "AND" | "OR" | "XOR" | "CP" => {
            if args.iter().any(reads_arg) {
                Access::Read
            } else {
                Access::None
            }
        }
        "EX" => {
            if args.iter().any(|a| reads_arg(a)) {
                Access::Read
            } else {
                Access::None
            }
        }
        "PUSH" | "POP" => {
            if args.iter().any(|a| reads_arg(a)) {
                if op == "POP" {
                    Access::Write
                } else {
                    Access::Read
                }
            } else {
                Access::None
            }
        }
        "NEG" | "CPL" | "RLA" | "RRA" | "RLCA" | "RRCA" | "SCF" | "CCF" | "NOP" => Access::None,
        // The calling convention is caller-saved: only a return value in
        // A or HL outlives a RET.
        "RET" if args.is_empty() => {
            if matches!(reg, "A" | "H" | "L") {
                Access::Read
            } else {
                Access::Write
            }
        }
        // Control transfers and anything unrecognized end the scan.
        _ => Access::Unknown,
    }
}

fn is_plain_reg8(arg: &str) -> bool {
    matches!(arg, "A" | "B" | "C" | "D" | "E" | "H" | "L")
}

fn pair_containing(arg: &str) -> Option<(&'static str, &'static str)> {
    match arg {
        "BC" => Some(("B", "C")),
        "DE" => Some(("D", "E")),
        "HL" => Some(("H", "L")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ld(dst: &str, src: &str) -> Line {
        Line::inst("LD", &[dst, src])
    }

    #[test]
    fn fuses_pair_copy_into_exchange_when_de_dies() {
        let mut lines = vec![
            ld("L", "E"),
            ld("H", "D"),
            ld("D", "0"), // DE rewritten before any read
            ld("E", "0"),
            Line::inst("RET", &[]),
        ];
        assert!(run(&mut lines) >= 1);
        assert_eq!(lines[0], Line::inst("EX", &["DE", "HL"]));
    }

    #[test]
    fn keeps_pair_copy_when_de_is_read() {
        let mut lines = vec![
            ld("L", "E"),
            ld("H", "D"),
            Line::inst("ADD", &["A", "D"]), // D still live
            Line::inst("RET", &[]),
        ];
        assert_eq!(run(&mut lines), 0);
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn cancels_double_exchange() {
        let mut lines = vec![
            Line::inst("EX", &["DE", "HL"]),
            Line::inst("EX", &["DE", "HL"]),
            Line::inst("RET", &[]),
        ];
        assert_eq!(run(&mut lines), 1);
        assert_eq!(lines, vec![Line::inst("RET", &[])]);
    }

    #[test]
    fn removes_copy_exchange_sequence_when_dead() {
        let mut lines = vec![
            ld("D", "H"),
            ld("E", "L"),
            Line::inst("EX", &["DE", "HL"]),
            ld("D", "1"),
            ld("E", "2"),
            Line::inst("RET", &[]),
        ];
        assert!(run(&mut lines) >= 1);
        assert!(!lines.contains(&Line::inst("EX", &["DE", "HL"])));
        assert!(lines.len() < 6);
    }

    #[test]
    fn labels_block_the_liveness_scan() {
        // After a label anything may be live; the rewrite must not fire.
        let mut lines = vec![
            ld("L", "E"),
            ld("H", "D"),
            Line::Label("join".into()),
            Line::inst("RET", &[]),
        ];
        assert_eq!(run(&mut lines), 0);
    }

    #[test]
    fn xor_store_is_left_alone() {
        // XOR A clears carry; turning the store into an immediate write
        // would lose that.
        let mut lines = vec![
            Line::inst("XOR", &["A"]),
            Line::inst("LD", &["(score)", "A"]),
            Line::inst("RET", &[]),
        ];
        assert_eq!(run(&mut lines), 0);
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn dead_at_end_of_program() {
        let mut lines = vec![ld("L", "E"), ld("H", "D")];
        assert_eq!(run(&mut lines), 1);
    }
}
