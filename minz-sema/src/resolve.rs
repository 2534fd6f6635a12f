//! The module graph: imports, aliases and cycle detection.

use std::collections::{HashMap, HashSet};

use minz_types::{Diagnostic, DiagnosticKind, DiagnosticSink};

use crate::ast;

/// Resolved module graph for one program.
///
/// Dotted call paths (`math.abs`) resolve against this graph; an alias
/// (`import math as m`) rebinds a module under a short name within the
/// importing module only.
#[derive(Debug, Default)]
pub struct ModuleGraph {
    modules: HashMap<String, ast::Module>,
    // importer -> binding name -> module name
    bindings: HashMap<String, HashMap<String, String>>,
}

impl ModuleGraph {
    /// Build the graph, reporting unknown imports and import cycles.
    pub fn build(program: &ast::Program, sink: &mut DiagnosticSink) -> Self {
        let mut graph = Self::default();
        for module in &program.modules {
            graph.modules.insert(module.name.clone(), module.clone());
        }

        for module in &program.modules {
            let bindings = graph.bindings.entry(module.name.clone()).or_default();
            for import in &module.imports {
                if !graph.modules.contains_key(&import.path) {
                    sink.report(Diagnostic::new(
                        DiagnosticKind::Name,
                        import.span.clone(),
                        format!("unknown module `{}`", import.path),
                    ));
                    continue;
                }
                let binding = import.alias.clone().unwrap_or_else(|| import.path.clone());
                bindings.insert(binding, import.path.clone());
            }
        }

        graph.check_cycles(program, sink);
        graph
    }

    fn check_cycles(&self, program: &ast::Program, sink: &mut DiagnosticSink) {
        let mut done: HashSet<String> = HashSet::new();
        for module in &program.modules {
            if done.contains(&module.name) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = HashSet::new();
            self.visit(&module.name, &mut path, &mut on_path, &mut done, sink);
        }
    }

    fn visit(
        &self,
        name: &str,
        path: &mut Vec<String>,
        on_path: &mut HashSet<String>,
        done: &mut HashSet<String>,
        sink: &mut DiagnosticSink,
    ) {
        if on_path.contains(name) {
            let cycle_start = path.iter().position(|m| m == name).unwrap_or(0);
            let cycle = path[cycle_start..].join(" -> ");
            let span = self
                .modules
                .get(name)
                .map(|m| m.span.clone())
                .unwrap_or_else(minz_types::SourceSpan::synthesized);
            sink.report(Diagnostic::new(
                DiagnosticKind::Name,
                span,
                format!("circular import: {cycle} -> {name}"),
            ));
            return;
        }
        if !done.insert(name.to_owned()) {
            return;
        }
        on_path.insert(name.to_owned());
        path.push(name.to_owned());

        if let Some(module) = self.modules.get(name) {
            for import in &module.imports {
                self.visit(&import.path, path, on_path, done, sink);
            }
        }

        path.pop();
        on_path.remove(name);
    }

    /// The module a dotted path prefix refers to from `importer`.
    pub fn resolve_prefix(&self, importer: &str, prefix: &str) -> Option<&ast::Module> {
        let target = self.bindings.get(importer)?.get(prefix)?;
        self.modules.get(target)
    }

    /// Iterate all modules.
    pub fn modules(&self) -> impl Iterator<Item = &ast::Module> {
        self.modules.values()
    }

    /// Look up a module by its true name.
    pub fn module(&self, name: &str) -> Option<&ast::Module> {
        self.modules.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minz_types::SourceSpan;

    fn span() -> SourceSpan {
        SourceSpan::new("t.minz", 1, 1)
    }

    fn module(name: &str, imports: &[(&str, Option<&str>)]) -> ast::Module {
        ast::Module {
            name: name.into(),
            imports: imports
                .iter()
                .map(|(path, alias)| ast::Import {
                    path: (*path).into(),
                    alias: alias.map(Into::into),
                    span: span(),
                })
                .collect(),
            decls: vec![],
            span: span(),
        }
    }

    #[test]
    fn aliases_rebind_modules() {
        let program = ast::Program {
            root: "main".into(),
            modules: vec![module("main", &[("math", Some("m"))]), module("math", &[])],
        };
        let mut sink = DiagnosticSink::new();
        let graph = ModuleGraph::build(&program, &mut sink);

        assert!(!sink.has_errors());
        assert_eq!(graph.resolve_prefix("main", "m").unwrap().name, "math");
        assert!(graph.resolve_prefix("main", "math").is_none());
    }

    #[test]
    fn unknown_import_is_reported() {
        let program = ast::Program {
            root: "main".into(),
            modules: vec![module("main", &[("nope", None)])],
        };
        let mut sink = DiagnosticSink::new();
        ModuleGraph::build(&program, &mut sink);
        assert!(sink.has_errors());
        assert!(sink.iter().any(|d| d.message.contains("unknown module")));
    }

    #[test]
    fn circular_imports_are_reported() {
        let program = ast::Program {
            root: "a".into(),
            modules: vec![module("a", &[("b", None)]), module("b", &[("a", None)])],
        };
        let mut sink = DiagnosticSink::new();
        ModuleGraph::build(&program, &mut sink);
        assert!(sink.iter().any(|d| d.message.contains("circular import")));
    }

    #[test]
    fn self_import_is_a_cycle() {
        let program = ast::Program {
            root: "a".into(),
            modules: vec![module("a", &[("a", None)])],
        };
        let mut sink = DiagnosticSink::new();
        ModuleGraph::build(&program, &mut sink);
        assert!(sink.iter().any(|d| d.message.contains("circular import")));
    }
}
