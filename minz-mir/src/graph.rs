//! The call graph and recursion classification.

use std::collections::{HashMap, HashSet};

use crate::{
    function::Recursion,
    instruction::Instruction,
    module::Module,
};

/// How a call edge dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Direct call by name.
    Direct,
    /// Possible target of a call through a function pointer.
    Indirect,
}

/// One edge of the call graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEdge {
    /// Callee name.
    pub callee: String,
    /// Dispatch kind.
    pub kind: CallKind,
}

/// Directed call graph over the functions of one module.
///
/// Indirect calls are resolved conservatively: every function whose address
/// is taken anywhere in the module is a possible target of every indirect
/// call site.
#[derive(Debug, Default)]
pub struct CallGraph {
    edges: HashMap<String, Vec<CallEdge>>,
}

impl CallGraph {
    /// Build the graph from a module.
    pub fn build(module: &Module) -> Self {
        let mut address_taken: HashSet<String> = HashSet::new();
        for function in module.functions() {
            for instruction in function.instructions() {
                if let Instruction::LoadFunc { function: target, .. } = instruction {
                    address_taken.insert(target.clone());
                }
            }
        }

        let mut edges: HashMap<String, Vec<CallEdge>> = HashMap::new();
        for function in module.functions() {
            let out = edges.entry(function.name.clone()).or_default();
            for block in &function.blocks {
                for instruction in &block.instructions {
                    match instruction {
                        Instruction::Call { callee, .. } => out.push(CallEdge {
                            callee: callee.clone(),
                            kind: CallKind::Direct,
                        }),
                        Instruction::CallIndirect { .. } => {
                            out.extend(address_taken.iter().map(|callee| CallEdge {
                                callee: callee.clone(),
                                kind: CallKind::Indirect,
                            }))
                        }
                        _ => {}
                    }
                }
                if let Some(crate::function::Terminator::TailCall { callee, .. }) =
                    &block.terminator
                {
                    out.push(CallEdge {
                        callee: callee.clone(),
                        kind: CallKind::Direct,
                    });
                }
            }
        }
        Self { edges }
    }

    /// Outgoing edges of a function.
    pub fn callees(&self, function: &str) -> &[CallEdge] {
        self.edges.get(function).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Count of direct call sites targeting `callee` across the module.
    pub fn call_site_count(&self, callee: &str) -> usize {
        self.edges
            .values()
            .flatten()
            .filter(|e| e.callee == callee)
            .count()
    }

    /// Classify the recursion of every function.
    ///
    /// Direct wins over mutual; any cycle that traverses an indirect edge
    /// is classified indirect.
    pub fn classify(&self) -> HashMap<String, Recursion> {
        let mut out = HashMap::new();
        for name in self.edges.keys() {
            out.insert(name.clone(), self.classify_one(name));
        }
        out
    }

    fn classify_one(&self, name: &str) -> Recursion {
        // Depth-first search for a cycle back to `name`, remembering
        // whether the path crossed an indirect edge.
        let mut best: Option<Recursion> = None;
        let mut stack = vec![(name.to_owned(), false, 0usize)];
        let mut visited: HashSet<(String, bool)> = HashSet::new();

        while let Some((current, via_indirect, depth)) = stack.pop() {
            for edge in self.callees(&current) {
                let indirect = via_indirect || edge.kind == CallKind::Indirect;
                if edge.callee == name {
                    let found = if indirect {
                        Recursion::Indirect
                    } else if depth == 0 {
                        Recursion::Direct
                    } else {
                        Recursion::Mutual
                    };
                    best = Some(match (best, found) {
                        // A direct self loop is the strongest classification.
                        (Some(Recursion::Direct), _) | (_, Recursion::Direct) => Recursion::Direct,
                        (Some(Recursion::Mutual), _) | (_, Recursion::Mutual) => Recursion::Mutual,
                        _ => Recursion::Indirect,
                    });
                    continue;
                }
                if visited.insert((edge.callee.clone(), indirect)) {
                    stack.push((edge.callee.clone(), indirect, depth + 1));
                }
            }
        }
        best.unwrap_or(Recursion::None)
    }

    /// Write each function's classification back into the module.
    pub fn annotate(&self, module: &mut Module) {
        let classes = self.classify();
        for function in module.functions_mut() {
            if let Some(class) = classes.get(&function.name) {
                function.recursion = *class;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{Function, Terminator};
    use minz_types::{SourceSpan, Type};

    fn call(callee: &str) -> Instruction {
        Instruction::Call {
            dst: None,
            callee: callee.into(),
            args: vec![],
        }
    }

    fn fn_calling(name: &str, callees: &[&str]) -> Function {
        let mut f = Function::new(name, Type::Void, SourceSpan::synthesized());
        let entry = f.entry();
        for callee in callees {
            f.push(entry, call(callee));
        }
        f.terminate(entry, Terminator::Return(None));
        f
    }

    #[test]
    fn classifies_direct_mutual_and_none() {
        let mut module = Module::new("m");
        module.add_function(fn_calling("fact", &["fact"]));
        module.add_function(fn_calling("even", &["odd"]));
        module.add_function(fn_calling("odd", &["even"]));
        module.add_function(fn_calling("leaf", &[]));

        let classes = CallGraph::build(&module).classify();
        assert_eq!(classes["fact"], Recursion::Direct);
        assert_eq!(classes["even"], Recursion::Mutual);
        assert_eq!(classes["odd"], Recursion::Mutual);
        assert_eq!(classes["leaf"], Recursion::None);
    }

    #[test]
    fn address_taken_functions_recurse_indirectly() {
        let mut module = Module::new("m");

        let mut f = Function::new("handler", Type::Void, SourceSpan::synthesized());
        let entry = f.entry();
        let target = f.alloc_vreg();
        f.push(
            entry,
            Instruction::LoadFunc {
                dst: target,
                function: "handler".into(),
            },
        );
        f.push(
            entry,
            Instruction::CallIndirect {
                dst: None,
                target,
                args: vec![],
            },
        );
        f.terminate(entry, Terminator::Return(None));
        module.add_function(f);

        let classes = CallGraph::build(&module).classify();
        assert_eq!(classes["handler"], Recursion::Indirect);
    }

    #[test]
    fn counts_call_sites() {
        let mut module = Module::new("m");
        module.add_function(fn_calling("a", &["helper", "helper"]));
        module.add_function(fn_calling("b", &["helper"]));
        module.add_function(fn_calling("helper", &[]));

        let graph = CallGraph::build(&module);
        assert_eq!(graph.call_site_count("helper"), 3);
        assert_eq!(graph.call_site_count("a"), 0);
    }

    #[test]
    fn tail_calls_are_graph_edges() {
        let mut module = Module::new("m");
        let mut f = Function::new("spin", Type::Void, SourceSpan::synthesized());
        let entry = f.entry();
        f.terminate(
            entry,
            Terminator::TailCall {
                callee: "spin".into(),
                args: vec![],
            },
        );
        module.add_function(f);

        let classes = CallGraph::build(&module).classify();
        assert_eq!(classes["spin"], Recursion::Direct);
    }
}
