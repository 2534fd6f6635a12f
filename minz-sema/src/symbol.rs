//! Symbols and scoped lookup.
//!
//! Top-level insertion is two-phase: every name is declared with its
//! signature first, bodies are checked afterwards, so mutually recursive
//! functions and self-referential structs need no forward declarations.

use std::collections::HashMap;

use minz_types::{SourceSpan, Type};

/// What a symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// A function.
    Function,
    /// A local or global variable.
    Variable,
    /// A function parameter.
    Parameter,
    /// A compile-time constant.
    Constant,
    /// A type name.
    Type,
}

/// Symbol visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    /// Visible to importing modules.
    Public,
    /// Module-local.
    #[default]
    Private,
}

/// A resolved symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    /// Base name.
    pub name: String,
    /// External name; for overloaded functions the `$`-suffixed form.
    pub mangled: String,
    /// Symbol type. For functions, the full function type.
    pub ty: Type,
    /// Kind.
    pub kind: SymbolKind,
    /// Visibility.
    pub visibility: Visibility,
    /// Declaration site.
    pub span: SourceSpan,
}

/// Scoped symbol table.
///
/// Globals live in a per-base-name bucket so overload sets stay together;
/// locals shadow through a scope stack.
#[derive(Debug, Default)]
pub struct SymbolTable {
    globals: HashMap<String, Vec<Symbol>>,
    scopes: Vec<HashMap<String, Symbol>>,
}

impl SymbolTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a top-level symbol. Duplicate mangled names are reported by
    /// the caller; the table keeps the first.
    ///
    /// Returns `false` when an identical mangled name was already present.
    pub fn declare_global(&mut self, symbol: Symbol) -> bool {
        let bucket = self.globals.entry(symbol.name.clone()).or_default();
        if bucket.iter().any(|s| s.mangled == symbol.mangled) {
            return false;
        }
        bucket.push(symbol);
        true
    }

    /// All global symbols sharing a base name: the overload set.
    pub fn overloads(&self, name: &str) -> &[Symbol] {
        self.globals.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Look up a global by its mangled name.
    pub fn global_by_mangled(&self, mangled: &str) -> Option<&Symbol> {
        self.globals
            .values()
            .flatten()
            .find(|s| s.mangled == mangled)
    }

    /// Enter a lexical scope.
    pub fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    /// Leave the innermost scope.
    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// Bind a local in the innermost scope, shadowing outer bindings.
    pub fn bind_local(&mut self, symbol: Symbol) {
        self.scopes
            .last_mut()
            .expect("no open scope")
            .insert(symbol.name.clone(), symbol);
    }

    /// Resolve a name: innermost scope outwards, then globals.
    ///
    /// For globals the first symbol of the overload set is returned; calls
    /// go through [`crate::resolve_overload`] instead.
    pub fn resolve(&self, name: &str) -> Option<&Symbol> {
        for scope in self.scopes.iter().rev() {
            if let Some(symbol) = scope.get(name) {
                return Some(symbol);
            }
        }
        self.globals.get(name).and_then(|bucket| bucket.first())
    }

    /// Whether a local with this name is bound in any open scope.
    pub fn is_local(&self, name: &str) -> bool {
        self.scopes.iter().rev().any(|scope| scope.contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str, mangled: &str, kind: SymbolKind) -> Symbol {
        Symbol {
            name: name.into(),
            mangled: mangled.into(),
            ty: Type::U8,
            kind,
            visibility: Visibility::Private,
            span: SourceSpan::synthesized(),
        }
    }

    #[test]
    fn overload_sets_share_a_bucket() {
        let mut table = SymbolTable::new();
        assert!(table.declare_global(sym("print", "print$u8", SymbolKind::Function)));
        assert!(table.declare_global(sym("print", "print$u16", SymbolKind::Function)));
        assert!(!table.declare_global(sym("print", "print$u8", SymbolKind::Function)));
        assert_eq!(table.overloads("print").len(), 2);
    }

    #[test]
    fn locals_shadow_globals() {
        let mut table = SymbolTable::new();
        table.declare_global(sym("x", "x", SymbolKind::Variable));
        table.push_scope();
        table.bind_local(sym("x", "local.x", SymbolKind::Parameter));

        assert_eq!(table.resolve("x").unwrap().mangled, "local.x");
        table.pop_scope();
        assert_eq!(table.resolve("x").unwrap().mangled, "x");
    }

    #[test]
    fn inner_scopes_shadow_outer() {
        let mut table = SymbolTable::new();
        table.push_scope();
        table.bind_local(sym("v", "outer.v", SymbolKind::Variable));
        table.push_scope();
        table.bind_local(sym("v", "inner.v", SymbolKind::Variable));
        assert_eq!(table.resolve("v").unwrap().mangled, "inner.v");
        table.pop_scope();
        assert_eq!(table.resolve("v").unwrap().mangled, "outer.v");
    }
}
