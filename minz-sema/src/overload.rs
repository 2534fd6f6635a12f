//! Overload selection through type-suffix mangling.

use itertools::Itertools;
use minz_types::Type;

use crate::symbol::Symbol;

/// Mangle a function name from its base name and parameter types.
///
/// `print(x: u8)` becomes `print$u8`; a nullary function keeps its base
/// name. The same source always produces the same mangled name, which is
/// what makes separate compilation and overload linking deterministic.
pub fn mangle(base: &str, params: &[Type]) -> String {
    if params.is_empty() {
        return base.to_owned();
    }
    let mut out = String::from(base);
    for ty in params {
        out.push('$');
        out.push_str(&ty.mangle());
    }
    out
}

/// Why overload selection failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OverloadError {
    /// No candidate accepts the argument types.
    #[error("no overload of `{name}` matches ({args})")]
    NoMatch {
        /// Base name.
        name: String,
        /// Rendered argument types.
        args: String,
        /// Candidate signatures for the diagnostic.
        candidates: Vec<String>,
    },
    /// More than one candidate accepts the argument types after widening.
    #[error("ambiguous call to `{name}` ({args})")]
    Ambiguous {
        /// Base name.
        name: String,
        /// Rendered argument types.
        args: String,
        /// The surviving candidate signatures.
        candidates: Vec<String>,
    },
}

impl OverloadError {
    /// Candidate signatures, for hint lines.
    pub fn candidates(&self) -> &[String] {
        match self {
            Self::NoMatch { candidates, .. } | Self::Ambiguous { candidates, .. } => candidates,
        }
    }
}

fn param_types(symbol: &Symbol) -> Option<&[Type]> {
    match &symbol.ty {
        Type::Function(params, _) => Some(params),
        _ => None,
    }
}

fn render_args(args: &[Type]) -> String {
    args.iter().map(ToString::to_string).join(", ")
}

/// Select the unique overload of `name` accepting `args`.
///
/// Exact matches win. Otherwise a candidate is viable when every argument
/// coerces by implicit widening (`u8 -> u16`, `i8 -> i16`, enum literal to
/// its underlying byte); exactly one viable candidate must remain.
pub fn resolve_overload<'a>(
    name: &str,
    candidates: &'a [Symbol],
    args: &[Type],
) -> Result<&'a Symbol, OverloadError> {
    let arity_matched: Vec<&Symbol> = candidates
        .iter()
        .filter(|s| param_types(s).is_some_and(|p| p.len() == args.len()))
        .collect();

    let all_signatures = || {
        candidates
            .iter()
            .filter_map(param_types)
            .map(|p| format!("{}({})", name, render_args(p)))
            .collect::<Vec<_>>()
    };

    if let Some(exact) = arity_matched.iter().find(|s| {
        param_types(s).is_some_and(|params| params.iter().zip(args).all(|(p, a)| p == a))
    }) {
        return Ok(exact);
    }

    let viable: Vec<&&Symbol> = arity_matched
        .iter()
        .filter(|s| {
            param_types(s)
                .is_some_and(|params| args.iter().zip(params).all(|(a, p)| a.coerces_to(p)))
        })
        .collect();

    match viable.as_slice() {
        [] => Err(OverloadError::NoMatch {
            name: name.to_owned(),
            args: render_args(args),
            candidates: all_signatures(),
        }),
        [single] => Ok(**single),
        _ => Err(OverloadError::Ambiguous {
            name: name.to_owned(),
            args: render_args(args),
            candidates: viable
                .iter()
                .filter_map(|s| param_types(s))
                .map(|p| format!("{}({})", name, render_args(p)))
                .collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::{SymbolKind, Visibility};
    use minz_types::SourceSpan;
    use test_case::test_case;

    fn fn_symbol(base: &str, params: Vec<Type>) -> Symbol {
        Symbol {
            name: base.into(),
            mangled: mangle(base, &params),
            ty: Type::Function(params, Box::new(Type::Void)),
            kind: SymbolKind::Function,
            visibility: Visibility::Public,
            span: SourceSpan::synthesized(),
        }
    }

    #[test_case(&[] => "reset"; "nullary keeps base name")]
    #[test_case(&[Type::U8] => "reset$u8"; "one param")]
    #[test_case(&[Type::U8, Type::U16] => "reset$u8$u16"; "two params")]
    fn mangling(params: &[Type]) -> String {
        mangle("reset", params)
    }

    #[test]
    fn exact_match_beats_widening() {
        let set = vec![
            fn_symbol("print", vec![Type::U8]),
            fn_symbol("print", vec![Type::U16]),
        ];
        let chosen = resolve_overload("print", &set, &[Type::U8]).unwrap();
        assert_eq!(chosen.mangled, "print$u8");

        let chosen = resolve_overload("print", &set, &[Type::U16]).unwrap();
        assert_eq!(chosen.mangled, "print$u16");
    }

    #[test]
    fn widening_selects_unique_candidate() {
        let set = vec![fn_symbol("emit", vec![Type::U16])];
        let chosen = resolve_overload("emit", &set, &[Type::U8]).unwrap();
        assert_eq!(chosen.mangled, "emit$u16");
    }

    #[test]
    fn no_match_lists_candidates() {
        let set = vec![
            fn_symbol("f", vec![Type::U8]),
            fn_symbol("f", vec![Type::U8, Type::U8]),
        ];
        let err = resolve_overload("f", &set, &[Type::Bool]).unwrap_err();
        match err {
            OverloadError::NoMatch { candidates, .. } => assert_eq!(candidates.len(), 2),
            other => panic!("expected NoMatch, got {other:?}"),
        }
    }

    #[test]
    fn ambiguity_is_an_error() {
        // u8 widens to u16 and i8 does not apply; two i16/u16 candidates
        // both accept a u8 argument only through widening on u16.
        let set = vec![
            fn_symbol("g", vec![Type::U16]),
            fn_symbol("g", vec![Type::U16]),
        ];
        // Force two distinct mangled names so both stay in the set.
        let mut set = set;
        set[1].mangled = "g$u16$alt".into();

        let err = resolve_overload("g", &set, &[Type::U8]).unwrap_err();
        assert!(matches!(err, OverloadError::Ambiguous { .. }));
    }
}
