//! The emitted instruction stream.
//!
//! Lines stay structured until the very end so the peephole can match
//! mnemonics and operands without re-parsing text.

use std::fmt;

use itertools::Itertools;

/// One line of output assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// A label, emitted as `name:`.
    Label(String),
    /// An instruction with operands.
    Inst {
        /// Mnemonic, upper case.
        op: String,
        /// Operands in order.
        args: Vec<String>,
        /// Trailing comment, included with debug output.
        comment: Option<String>,
    },
    /// An assembler directive such as `ORG`, `DB`, `DW`, `DS` or `END`.
    Directive {
        /// Directive name.
        name: String,
        /// Arguments.
        args: Vec<String>,
    },
    /// A symbol definition: `name EQU expr`.
    Equ {
        /// Defined symbol.
        name: String,
        /// Expression.
        expr: String,
    },
    /// A full-line comment.
    Comment(String),
    /// An empty separator line.
    Blank,
}

impl Line {
    /// Instruction constructor.
    pub fn inst(op: &str, args: &[&str]) -> Self {
        Self::Inst {
            op: op.to_owned(),
            args: args.iter().map(|s| (*s).to_owned()).collect(),
            comment: None,
        }
    }

    /// Instruction constructor from owned operands.
    pub fn inst_owned(op: &str, args: Vec<String>) -> Self {
        Self::Inst {
            op: op.to_owned(),
            args,
            comment: None,
        }
    }

    /// The `CALL` target when this line is a call.
    pub fn call_target(&self) -> Option<&str> {
        match self {
            Self::Inst { op, args, .. } if op == "CALL" => args.last().map(String::as_str),
            _ => None,
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Label(name) => write!(f, "{name}:"),
            Self::Inst { op, args, comment } => {
                write!(f, "    {op}")?;
                if !args.is_empty() {
                    write!(f, " {}", args.iter().join(", "))?;
                }
                if let Some(comment) = comment {
                    write!(f, " ; {comment}")?;
                }
                Ok(())
            }
            Self::Directive { name, args } => {
                if args.is_empty() {
                    write!(f, "    {name}")
                } else {
                    write!(f, "    {name} {}", args.iter().join(", "))
                }
            }
            Self::Equ { name, expr } => write!(f, "{name} EQU {expr}"),
            Self::Comment(text) => write!(f, "; {text}"),
            Self::Blank => Ok(()),
        }
    }
}

/// Render a whole program.
pub fn render(lines: &[Line]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(&line.to_string());
        out.push('\n');
    }
    out
}
