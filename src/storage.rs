//! Deferred storage allocation. Declarations are recorded in source order
//! while lowering runs; nothing gets an address until `allocate_all`, once
//! the whole program's needs are known. Assigned addresses are bound into the
//! value graph and are immutable afterwards.

use crate::ast::Span;
use crate::graph::{DuplicateSymbol, NodeId, Num, ResolveError, ValueGraph};

/// Persistence/addressing category of a variable. `Auto`, `ScriptReg` and
/// `Constant` are handled by the scope tree and never reach the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StorageClass {
    Auto,
    ScriptReg,
    Static,
    MapReg,
    WorldReg,
    GlobalReg,
    MapArray,
    WorldArray,
    GlobalArray,
    Constant,
}

impl StorageClass {
    /// Does the deferred allocator hand out addresses for this class?
    pub fn allocated(self) -> bool {
        !matches!(self, StorageClass::Auto | StorageClass::ScriptReg | StorageClass::Constant)
    }

    fn index(self) -> usize {
        match self {
            StorageClass::Static => 0,
            StorageClass::MapReg => 1,
            StorageClass::WorldReg => 2,
            StorageClass::GlobalReg => 3,
            StorageClass::MapArray => 4,
            StorageClass::WorldArray => 5,
            StorageClass::GlobalArray => 6,
            _ => unreachable!("class is not allocator-managed"),
        }
    }
}

impl std::fmt::Display for StorageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageClass::Auto => "frame slot",
            StorageClass::ScriptReg => "script register",
            StorageClass::Static => "static",
            StorageClass::MapReg => "map register",
            StorageClass::WorldReg => "world register",
            StorageClass::GlobalReg => "global register",
            StorageClass::MapArray => "map array",
            StorageClass::WorldArray => "world array",
            StorageClass::GlobalArray => "global array",
            StorageClass::Constant => "constant",
        };
        f.write_str(name)
    }
}

const ALLOC_CLASSES: usize = 7;

/// What a target can actually address: per-class capacity plus the synonym
/// substitutions applied before any address is handed out. Kept as plain
/// configuration data, one table per target.
#[derive(Debug, Clone)]
pub struct TargetCaps {
    capacity: [u32; ALLOC_CLASSES],
    synonyms: &'static [(StorageClass, StorageClass)],
}

impl TargetCaps {
    pub fn for_target(target: crate::emit::Target) -> Self {
        use crate::emit::Target;
        match target {
            // No global register file and no map arrays; globals fall back
            // to the world page.
            Target::Plain => TargetCaps {
                capacity: caps(|c| match c {
                    StorageClass::Static => 0x10000,
                    StorageClass::MapReg => 128,
                    StorageClass::WorldReg => 256,
                    StorageClass::WorldArray => 64,
                    _ => 0,
                }),
                synonyms: &[
                    (StorageClass::GlobalReg, StorageClass::WorldReg),
                    (StorageClass::GlobalArray, StorageClass::WorldArray),
                ],
            },
            // Globals exist but map arrays still do not.
            Target::Portable => TargetCaps {
                capacity: caps(|c| match c {
                    StorageClass::Static => 0x10000,
                    StorageClass::MapReg => 128,
                    StorageClass::WorldReg => 256,
                    StorageClass::GlobalReg => 64,
                    StorageClass::WorldArray => 64,
                    StorageClass::GlobalArray => 64,
                    _ => 0,
                }),
                synonyms: &[],
            },
            Target::Extended => TargetCaps {
                capacity: caps(|c| match c {
                    StorageClass::Static => 0x10000,
                    StorageClass::MapReg => 128,
                    StorageClass::WorldReg => 256,
                    StorageClass::GlobalReg => 64,
                    StorageClass::MapArray => 128,
                    StorageClass::WorldArray => 256,
                    StorageClass::GlobalArray => 64,
                    _ => 0,
                }),
                synonyms: &[],
            },
        }
    }

    /// The class actually allocated for a declared class on this target.
    pub fn resolve_synonym(&self, class: StorageClass) -> StorageClass {
        for (from, to) in self.synonyms {
            if *from == class {
                return *to;
            }
        }
        class
    }

    pub fn capacity(&self, class: StorageClass) -> u32 {
        self.capacity[class.index()]
    }
}

fn caps(f: impl Fn(StorageClass) -> u32) -> [u32; ALLOC_CLASSES] {
    use StorageClass::*;
    [Static, MapReg, WorldReg, GlobalReg, MapArray, WorldArray, GlobalArray].map(f)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("out of {0} storage")]
    Exhausted(StorageClass),

    #[error("storage was already allocated")]
    AlreadyAllocated,

    #[error(transparent)]
    Duplicate(#[from] DuplicateSymbol),
}

/// One recorded declaration. Arrays record no element count: an array
/// occupies exactly one slot, its elements are the runtime's business.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageDecl {
    pub class: StorageClass,
    /// Graph symbol name the assigned address is bound to.
    pub symbol: String,
    pub init: Option<NodeId>,
    pub span: Span,
    /// Filled in by `allocate_all`.
    pub address: Option<i64>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct StorageAllocator {
    decls: Vec<StorageDecl>,
    allocated: bool,
}

impl StorageAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from deserialized declarations (object-file loading).
    pub fn from_decls(decls: Vec<StorageDecl>) -> Self {
        StorageAllocator { decls, allocated: false }
    }

    /// Record a declaration; the graph symbol stays pending until allocation.
    pub fn declare(
        &mut self,
        class: StorageClass,
        symbol: &str,
        init: Option<NodeId>,
        span: Span,
        graph: &mut ValueGraph,
    ) {
        debug_assert!(class.allocated(), "{class} storage is not allocator-managed");
        debug_assert!(!self.allocated, "declaration after allocation");
        graph.declare_symbol(symbol);
        self.decls.push(StorageDecl {
            class,
            symbol: symbol.to_string(),
            init,
            span,
            address: None,
        });
    }

    pub fn decls(&self) -> &[StorageDecl] {
        &self.decls
    }

    /// Assign addresses: synonyms first, then first-declared order per class
    /// starting at 0. Each address is bound into the graph, unblocking every
    /// node that referenced the symbol.
    pub fn allocate_all(
        &mut self,
        caps: &TargetCaps,
        graph: &mut ValueGraph,
    ) -> Result<(), StorageError> {
        if self.allocated {
            return Err(StorageError::AlreadyAllocated);
        }
        self.allocated = true;

        let mut next = [0u32; ALLOC_CLASSES];
        for decl in &mut self.decls {
            let class = caps.resolve_synonym(decl.class);
            let slot = next[class.index()];
            if slot >= caps.capacity(class) {
                return Err(StorageError::Exhausted(class));
            }
            next[class.index()] = slot + 1;
            decl.address = Some(slot as i64);
            graph.bind_address(&decl.symbol, slot as i64)?;
        }
        Ok(())
    }

    pub fn address(&self, symbol: &str) -> Option<i64> {
        self.decls
            .iter()
            .find(|d| d.symbol == symbol)
            .and_then(|d| d.address)
    }

    /// Resolved `(address, value)` pairs for the static-initializer table,
    /// in address order. Only meaningful after `allocate_all` and the
    /// resolution sweep.
    pub fn static_initializers(
        &self,
        graph: &ValueGraph,
    ) -> Result<Vec<(i64, Num)>, ResolveError> {
        let mut table = Vec::new();
        for decl in &self.decls {
            if decl.class != StorageClass::Static {
                continue;
            }
            let Some(init) = decl.init else { continue };
            let address = decl.address.unwrap_or_default();
            table.push((address, graph.resolve(init)?));
        }
        table.sort_by_key(|(addr, _)| *addr);
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinOp;
    use crate::emit::Target;

    fn extended_caps() -> TargetCaps {
        TargetCaps::for_target(Target::Extended)
    }

    #[test]
    fn addresses_unique_per_class_in_declaration_order() {
        let mut graph = ValueGraph::new();
        let mut alloc = StorageAllocator::new();
        alloc.declare(StorageClass::Static, "static$a", None, Span::UNKNOWN, &mut graph);
        alloc.declare(StorageClass::MapReg, "map$m", None, Span::UNKNOWN, &mut graph);
        alloc.declare(StorageClass::Static, "static$b", None, Span::UNKNOWN, &mut graph);
        alloc.allocate_all(&extended_caps(), &mut graph).unwrap();

        assert_eq!(alloc.address("static$a"), Some(0));
        assert_eq!(alloc.address("static$b"), Some(1));
        // Each class counts from zero independently.
        assert_eq!(alloc.address("map$m"), Some(0));
    }

    #[test]
    fn allocation_binds_graph_symbols() {
        let mut graph = ValueGraph::new();
        let mut alloc = StorageAllocator::new();
        let reference = {
            alloc.declare(StorageClass::WorldReg, "world$w", None, Span::UNKNOWN, &mut graph);
            graph.symbol_ref("world$w")
        };
        assert!(graph.resolve(reference).unwrap_err().is_retryable());

        alloc.allocate_all(&extended_caps(), &mut graph).unwrap();
        assert_eq!(graph.resolve(reference), Ok(Num::Int(0)));
    }

    #[test]
    fn arrays_take_one_slot_regardless_of_length() {
        // The declaration records no element count at all; a hundred-element
        // array and a one-element array are indistinguishable here.
        let mut graph = ValueGraph::new();
        let mut alloc = StorageAllocator::new();
        alloc.declare(StorageClass::MapArray, "arr$big", None, Span::UNKNOWN, &mut graph);
        alloc.declare(StorageClass::MapArray, "arr$small", None, Span::UNKNOWN, &mut graph);
        alloc.allocate_all(&extended_caps(), &mut graph).unwrap();
        assert_eq!(alloc.address("arr$big"), Some(0));
        assert_eq!(alloc.address("arr$small"), Some(1));
    }

    #[test]
    fn second_allocation_rejected() {
        let mut graph = ValueGraph::new();
        let mut alloc = StorageAllocator::new();
        alloc.allocate_all(&extended_caps(), &mut graph).unwrap();
        assert_eq!(
            alloc.allocate_all(&extended_caps(), &mut graph),
            Err(StorageError::AlreadyAllocated)
        );
    }

    #[test]
    fn exhaustion_names_the_class() {
        let mut graph = ValueGraph::new();
        let mut alloc = StorageAllocator::new();
        let caps = TargetCaps::for_target(Target::Extended);
        for i in 0..=caps.capacity(StorageClass::GlobalReg) {
            alloc.declare(
                StorageClass::GlobalReg,
                &format!("global$g{i}"),
                None,
                Span::UNKNOWN,
                &mut graph,
            );
        }
        let err = alloc.allocate_all(&caps, &mut graph).unwrap_err();
        assert_eq!(err, StorageError::Exhausted(StorageClass::GlobalReg));
        assert_eq!(err.to_string(), "out of global register storage");
    }

    #[test]
    fn plain_target_aliases_globals_to_world() {
        let mut graph = ValueGraph::new();
        let mut alloc = StorageAllocator::new();
        alloc.declare(StorageClass::WorldReg, "world$w", None, Span::UNKNOWN, &mut graph);
        alloc.declare(StorageClass::GlobalReg, "global$g", None, Span::UNKNOWN, &mut graph);
        alloc
            .allocate_all(&TargetCaps::for_target(Target::Plain), &mut graph)
            .unwrap();
        // The global landed in the world file, after the real world register.
        assert_eq!(alloc.address("world$w"), Some(0));
        assert_eq!(alloc.address("global$g"), Some(1));
    }

    #[test]
    fn plain_target_has_no_map_arrays() {
        let mut graph = ValueGraph::new();
        let mut alloc = StorageAllocator::new();
        alloc.declare(StorageClass::MapArray, "arr$a", None, Span::UNKNOWN, &mut graph);
        assert_eq!(
            alloc.allocate_all(&TargetCaps::for_target(Target::Plain), &mut graph),
            Err(StorageError::Exhausted(StorageClass::MapArray))
        );
    }

    #[test]
    fn static_initializers_resolve_in_address_order() {
        let mut graph = ValueGraph::new();
        let mut alloc = StorageAllocator::new();

        let two = graph.int(2);
        let three = graph.int(3);
        let sum = graph.binary(BinOp::Add, two, three);
        alloc.declare(StorageClass::Static, "static$x", Some(sum), Span::UNKNOWN, &mut graph);

        let seven = graph.int(7);
        alloc.declare(StorageClass::Static, "static$y", Some(seven), Span::UNKNOWN, &mut graph);

        // Uninitialized statics stay out of the table.
        alloc.declare(StorageClass::Static, "static$z", None, Span::UNKNOWN, &mut graph);

        alloc.allocate_all(&extended_caps(), &mut graph).unwrap();
        let table = alloc.static_initializers(&graph).unwrap();
        assert_eq!(table, vec![(0, Num::Int(5)), (1, Num::Int(7))]);
    }

    #[test]
    fn initializer_may_reference_another_address() {
        let mut graph = ValueGraph::new();
        let mut alloc = StorageAllocator::new();
        alloc.declare(StorageClass::WorldReg, "world$w", None, Span::UNKNOWN, &mut graph);
        let addr_of_w = graph.symbol_ref("world$w");
        let one = graph.int(1);
        let init = graph.binary(BinOp::Add, addr_of_w, one);
        alloc.declare(StorageClass::Static, "static$x", Some(init), Span::UNKNOWN, &mut graph);

        alloc.allocate_all(&extended_caps(), &mut graph).unwrap();
        let table = alloc.static_initializers(&graph).unwrap();
        assert_eq!(table, vec![(0, Num::Int(1))]);
    }
}
