//! The runtime helper library and its tree shaking.
//!
//! Helpers are emitted lazily: after the function bodies are generated,
//! every `CALL` target that names a helper pulls its code in, and the scan
//! repeats over the freshly emitted helpers until no new name appears.
//!
//! Register contract: 8-bit helpers take their first operand in `A` and
//! their second in `E`; 16-bit helpers take `HL` and `DE`. Results come
//! back in `A` or `HL`. `BC` is preserved, everything else is scratch.

use std::collections::HashSet;

use crate::asm::Line;

/// One library routine: its entry label and verbatim body.
struct Helper {
    name: &'static str,
    body: &'static str,
}

/// The built-in routine table. Bodies are verbatim Z80 assembly; internal
/// labels are prefixed with the helper name to stay collision-free.
const HELPERS: &[Helper] = &[
    Helper {
        name: "call_iy",
        body: "call_iy:
    JP (IY)",
    },
    Helper {
        name: "__mul8",
        // A = A * E.
        body: "__mul8:
    PUSH BC
    LD C, A
    XOR A
    LD B, 8
__mul8.loop:
    SRL E
    JR NC, __mul8.skip
    ADD A, C
__mul8.skip:
    SLA C
    DJNZ __mul8.loop
    POP BC
    RET",
    },
    Helper {
        name: "__div8",
        // A = A / E, remainder in D.
        body: "__div8:
    PUSH BC
    LD B, 8
    LD D, 0
__div8.loop:
    RLA
    RL D
    LD C, A
    LD A, D
    SUB E
    JR C, __div8.restore
    LD D, A
    LD A, C
    SCF
    JR __div8.next
__div8.restore:
    LD A, C
    OR A
__div8.next:
    DJNZ __div8.loop
    RLA
    POP BC
    RET",
    },
    Helper {
        name: "__mod8",
        // A = A % E.
        body: "__mod8:
    CALL __div8
    LD A, D
    RET",
    },
    Helper {
        name: "__sdiv8",
        // A = A / E, signed: divide magnitudes, fix the sign.
        body: "__sdiv8:
    LD D, A
    XOR E
    PUSH AF
    LD A, D
    OR A
    JP P, __sdiv8.lhs_ok
    NEG
__sdiv8.lhs_ok:
    BIT 7, E
    JR Z, __sdiv8.rhs_ok
    PUSH AF
    XOR A
    SUB E
    LD E, A
    POP AF
__sdiv8.rhs_ok:
    CALL __div8
    LD D, A
    POP AF
    LD A, D
    RET P
    NEG
    RET",
    },
    Helper {
        name: "__srem8",
        // A = A % E, signed: remainder takes the dividend's sign.
        body: "__srem8:
    LD D, A
    PUSH AF
    OR A
    JP P, __srem8.lhs_ok
    NEG
__srem8.lhs_ok:
    BIT 7, E
    JR Z, __srem8.rhs_ok
    PUSH AF
    XOR A
    SUB E
    LD E, A
    POP AF
__srem8.rhs_ok:
    CALL __mod8
    LD E, A
    POP AF
    LD A, E
    RET P
    NEG
    RET",
    },
    Helper {
        name: "__shl8",
        // A = A << E.
        body: "__shl8:
    INC E
    JR __shl8.test
__shl8.loop:
    ADD A, A
__shl8.test:
    DEC E
    JR NZ, __shl8.loop
    RET",
    },
    Helper {
        name: "__shr8",
        // A = A >> E, logical.
        body: "__shr8:
    INC E
    JR __shr8.test
__shr8.loop:
    SRL A
__shr8.test:
    DEC E
    JR NZ, __shr8.loop
    RET",
    },
    Helper {
        name: "__sar8",
        // A = A >> E, arithmetic.
        body: "__sar8:
    INC E
    JR __sar8.test
__sar8.loop:
    SRA A
__sar8.test:
    DEC E
    JR NZ, __sar8.loop
    RET",
    },
    Helper {
        name: "__cmp8s",
        // Signed compare of A with E, leaving C/Z as an unsigned CP
        // would for the corresponding ordering: bias both by $80.
        body: "__cmp8s:
    ADD A, $80
    LD D, A
    LD A, E
    ADD A, $80
    LD E, A
    LD A, D
    CP E
    RET",
    },
    Helper {
        name: "__mul16",
        // HL = HL * DE.
        body: "__mul16:
    PUSH BC
    LD B, H
    LD C, L
    LD HL, 0
    LD A, 16
__mul16.loop:
    ADD HL, HL
    EX DE, HL
    ADD HL, HL
    EX DE, HL
    JR NC, __mul16.skip
    ADD HL, BC
__mul16.skip:
    DEC A
    JR NZ, __mul16.loop
    POP BC
    RET",
    },
    Helper {
        name: "__div16",
        // HL = HL / DE, remainder in DE.
        body: "__div16:
    PUSH BC
    LD B, H
    LD C, L
    LD HL, 0
    LD A, 16
__div16.loop:
    SLA C
    RL B
    ADC HL, HL
    SBC HL, DE
    JR NC, __div16.keep
    ADD HL, DE
    JR __div16.next
__div16.keep:
    INC C
__div16.next:
    DEC A
    JR NZ, __div16.loop
    EX DE, HL
    LD H, B
    LD L, C
    POP BC
    RET",
    },
    Helper {
        name: "__mod16",
        // HL = HL % DE.
        body: "__mod16:
    CALL __div16
    EX DE, HL
    RET",
    },
    Helper {
        name: "__sdiv16",
        // HL = HL / DE, signed.
        body: "__sdiv16:
    LD A, H
    XOR D
    PUSH AF
    BIT 7, H
    JR Z, __sdiv16.lhs_ok
    CALL __neg16
__sdiv16.lhs_ok:
    BIT 7, D
    JR Z, __sdiv16.rhs_ok
    EX DE, HL
    CALL __neg16
    EX DE, HL
__sdiv16.rhs_ok:
    CALL __div16
    POP AF
    RET P
    JP __neg16",
    },
    Helper {
        name: "__srem16",
        // HL = HL % DE, signed: takes the dividend's sign.
        body: "__srem16:
    LD A, H
    PUSH AF
    BIT 7, H
    JR Z, __srem16.lhs_ok
    CALL __neg16
__srem16.lhs_ok:
    BIT 7, D
    JR Z, __srem16.rhs_ok
    EX DE, HL
    CALL __neg16
    EX DE, HL
__srem16.rhs_ok:
    CALL __mod16
    POP AF
    RET P
    JP __neg16",
    },
    Helper {
        name: "__neg16",
        // HL = -HL.
        body: "__neg16:
    XOR A
    SUB L
    LD L, A
    SBC A, A
    SUB H
    LD H, A
    RET",
    },
    Helper {
        name: "__shl16",
        // HL = HL << A.
        body: "__shl16:
    OR A
    RET Z
__shl16.loop:
    ADD HL, HL
    DEC A
    JR NZ, __shl16.loop
    RET",
    },
    Helper {
        name: "__shr16",
        // HL = HL >> A, logical.
        body: "__shr16:
    OR A
    RET Z
__shr16.loop:
    SRL H
    RR L
    DEC A
    JR NZ, __shr16.loop
    RET",
    },
    Helper {
        name: "__sar16",
        // HL = HL >> A, arithmetic.
        body: "__sar16:
    OR A
    RET Z
__sar16.loop:
    SRA H
    RR L
    DEC A
    JR NZ, __sar16.loop
    RET",
    },
    Helper {
        name: "__cmp16s",
        // Signed compare of HL with DE: bias both sign bits, then
        // compare unsigned.
        body: "__cmp16s:
    LD A, H
    XOR $80
    LD H, A
    LD A, D
    XOR $80
    LD D, A
    OR A
    SBC HL, DE
    RET",
    },
    Helper {
        name: "print_string",
        // HL points at a length-prefixed string. Preserves BC.
        body: "print_string:
    PUSH BC
    LD B, (HL)
    INC HL
    LD A, B
    OR A
    JR Z, print_string.done
print_string.loop:
    LD A, (HL)
    RST $10
    INC HL
    DJNZ print_string.loop
print_string.done:
    POP BC
    RET",
    },
    Helper {
        name: "print_u8",
        // Decimal print of A. Preserves BC.
        body: "print_u8:
    PUSH BC
    LD B, 100
    CALL print_u8.digit
    LD B, 10
    CALL print_u8.digit
    ADD A, '0'
    RST $10
    POP BC
    RET
print_u8.digit:
    LD C, '0'-1
print_u8.sub:
    INC C
    SUB B
    JR NC, print_u8.sub
    ADD A, B
    LD D, A
    LD A, C
    RST $10
    LD A, D
    RET",
    },
    Helper {
        name: "print_u16",
        // Decimal print of HL. Preserves BC.
        body: "print_u16:
    PUSH BC
    LD DE, 10000
    CALL print_u16.digit
    LD DE, 1000
    CALL print_u16.digit
    LD DE, 100
    CALL print_u16.digit
    LD DE, 10
    CALL print_u16.digit
    LD A, L
    ADD A, '0'
    RST $10
    POP BC
    RET
print_u16.digit:
    LD A, '0'-1
print_u16.sub:
    INC A
    OR A
    SBC HL, DE
    JR NC, print_u16.sub
    ADD HL, DE
    RST $10
    RET",
    },
    Helper {
        name: "print_hex_u8",
        // Hexadecimal print of A.
        body: "print_hex_u8:
    LD D, A
    RRCA
    RRCA
    RRCA
    RRCA
    CALL print_hex_u8.nibble
    LD A, D
print_hex_u8.nibble:
    AND $0F
    ADD A, '0'
    CP '9'+1
    JR C, print_hex_u8.out
    ADD A, 7
print_hex_u8.out:
    RST $10
    RET",
    },
    Helper {
        name: "print_newline",
        body: "print_newline:
    LD A, 13
    RST $10
    RET",
    },
    Helper {
        name: "cls",
        // ZX Spectrum ROM clear-screen.
        body: "cls:
    CALL $0DAF
    RET",
    },
];

/// Whether a name refers to a library routine.
pub fn is_helper(name: &str) -> bool {
    HELPERS.iter().any(|h| h.name == name)
}

fn helper_lines(name: &str) -> Option<Vec<Line>> {
    let helper = HELPERS.iter().find(|h| h.name == name)?;
    let mut lines = Vec::new();
    for raw in helper.body.lines() {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(label) = trimmed.strip_suffix(':') {
            lines.push(Line::Label(label.to_owned()));
        } else {
            let (op, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
            let args: Vec<String> = if rest.is_empty() {
                Vec::new()
            } else {
                rest.split(',').map(|a| a.trim().to_owned()).collect()
            };
            lines.push(Line::inst_owned(op, args));
        }
    }
    Some(lines)
}

/// Emit every helper reachable from the `CALL` and `JP` targets already
/// present in `lines`, re-scanning emitted helpers until the used set
/// stops growing.
pub fn emit_used(lines: &mut Vec<Line>) {
    let mut emitted: HashSet<String> = HashSet::new();
    loop {
        // Scan in emission order so the output is deterministic.
        let mut used: Vec<String> = lines
            .iter()
            .filter_map(|line| match line {
                Line::Inst { op, args, .. } if op == "CALL" || op == "JP" => {
                    args.last().map(|s| s.to_owned())
                }
                _ => None,
            })
            .collect();
        used.dedup();
        let next = used
            .into_iter()
            .find(|name| is_helper(name) && !emitted.contains(name));
        let Some(name) = next else {
            break;
        };
        if let Some(mut body) = helper_lines(&name) {
            lines.push(Line::Blank);
            lines.append(&mut body);
        }
        emitted.insert(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_called_helpers_are_emitted() {
        let mut lines = vec![
            Line::Label("main".into()),
            Line::inst("CALL", &["print_string"]),
            Line::inst("RET", &[]),
        ];
        emit_used(&mut lines);
        let text = crate::asm::render(&lines);
        assert!(text.contains("print_string:"));
        assert!(!text.contains("print_hex_u8:"));
        assert!(!text.contains("cls:"));
    }

    #[test]
    fn helper_dependencies_close_transitively() {
        let mut lines = vec![
            Line::Label("main".into()),
            Line::inst("CALL", &["__srem16"]),
            Line::inst("RET", &[]),
        ];
        emit_used(&mut lines);
        let text = crate::asm::render(&lines);
        // __srem16 -> __mod16 -> __div16, plus __neg16 for the sign fix.
        assert!(text.contains("__mod16:"));
        assert!(text.contains("__div16:"));
        assert!(text.contains("__neg16:"));
    }

    #[test]
    fn every_call_in_output_is_defined() {
        let mut lines = vec![
            Line::Label("main".into()),
            Line::inst("CALL", &["print_u16"]),
            Line::inst("CALL", &["__mod16"]),
            Line::inst("RET", &[]),
        ];
        emit_used(&mut lines);
        let defined: Vec<String> = lines
            .iter()
            .filter_map(|l| match l {
                Line::Label(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        for target in lines.iter().filter_map(Line::call_target) {
            assert!(
                defined.iter().any(|d| d == target),
                "`CALL {target}` has no definition in the output"
            );
        }
    }
}
