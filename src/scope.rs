//! Hierarchical scope tree. Scopes live in an arena and reference their
//! parents by index, so a closed scope stays reachable for label and symbol
//! lookups without any aliasing of owning pointers.
//!
//! Block/Loop/Switch scopes inherit their parent's local slot counters, which
//! is what lets sibling blocks reuse the same frame slots while the owning
//! function still sees the high-water frame size. Function/Script/Namespace
//! scopes start fresh.

use std::collections::{BTreeMap, HashMap};

use crate::ast::Type;
use crate::graph::NodeId;
use crate::storage::StorageClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Namespace,
    Script,
    Function,
    Block,
    Loop,
    Switch,
}

impl ScopeKind {
    /// Does this scope share local slots and local visibility with its parent?
    pub fn inherits(self) -> bool {
        matches!(self, ScopeKind::Block | ScopeKind::Loop | ScopeKind::Switch)
    }
}

/// Which register file a local slot indexes into: function frame slots or
/// script registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Auto,
    Reg,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counter {
    count: u32,
    limit: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindingKind {
    /// Frame slot or script register; invisible across non-inheriting scopes.
    Local { slot_kind: SlotKind, slot: u32 },
    /// Persistent storage; the address is the graph symbol, assigned later.
    Deferred { class: StorageClass, symbol: String },
    Constant(NodeId),
    Function {
        symbol: String,
        params: Vec<Type>,
        return_type: Type,
        defined: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub ty: Type,
    pub kind: BindingKind,
}

#[derive(Debug, Clone)]
struct CaseEntry {
    label: String,
    defined: bool,
}

#[derive(Debug, Clone)]
struct GotoEntry {
    label: String,
    defined: bool,
}

struct Scope {
    parent: Option<ScopeId>,
    kind: ScopeKind,
    /// Label path fragment; empty for anonymous block scopes.
    tag: String,
    vars: HashMap<String, Binding>,
    types: HashMap<String, Type>,
    /// Goto labels; owned by Function/Script scopes.
    gotos: HashMap<String, GotoEntry>,
    /// Case values; owned by Switch scopes. Sorted for deterministic output.
    cases: BTreeMap<i64, CaseEntry>,
    default_case: Option<CaseEntry>,
    counters: [Counter; 2],
    next_label: u32,
    /// Break/continue targets, created when a Loop/Switch scope opens.
    break_label: Option<String>,
    continue_label: Option<String>,
    closed: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScopeError {
    #[error("redefinition of '{0}'")]
    Redefined(String),

    #[error("'{0}' has not been declared")]
    Undeclared(String),

    #[error("redefinition of type '{0}'")]
    TypeRedefined(String),

    #[error("unknown type '{0}'")]
    UnknownType(String),

    #[error("'break' used outside of a loop or switch")]
    NotBreakable,

    #[error("'continue' used outside of a loop")]
    NotContinuable,

    #[error("'case' used outside of a switch")]
    CaseOutsideSwitch,

    #[error("case {0} redefined")]
    CaseRedefined(i64),

    #[error("case {0} referenced but never defined")]
    CaseUndefined(i64),

    #[error("default case redefined")]
    DefaultRedefined,

    #[error("default case referenced but never defined")]
    DefaultUndefined,

    #[error("label '{0}' redefined")]
    LabelRedefined(String),

    #[error("label '{0}' referenced but never defined")]
    LabelUndefined(String),
}

type Result<T> = std::result::Result<T, ScopeError>;

pub struct ScopeTree {
    scopes: Vec<Scope>,
    root: ScopeId,
}

impl ScopeTree {
    /// Create the tree with a root namespace scope tagged with the module
    /// name; the root lives for the whole compilation.
    pub fn new(module_tag: &str) -> Self {
        let root = Scope::new(None, ScopeKind::Namespace, module_tag.to_string());
        ScopeTree { scopes: vec![root], root: ScopeId(0) }
    }

    pub fn root(&self) -> ScopeId {
        self.root
    }

    pub fn kind(&self, id: ScopeId) -> ScopeKind {
        self.scopes[id.0 as usize].kind
    }

    /// Open a child scope. Inheriting kinds pick up the parent's current
    /// slot counts so sibling blocks reuse slots; Loop/Switch scopes mint
    /// their break (and for loops, continue) labels immediately.
    pub fn open(&mut self, parent: ScopeId, kind: ScopeKind, tag: &str) -> ScopeId {
        let mut scope = Scope::new(Some(parent), kind, tag.to_string());
        if kind.inherits() {
            scope.counters = self.scopes[parent.0 as usize].counters;
            // Inherited limits start at the inherited counts; high-water
            // propagation keeps ancestors in sync.
            for c in &mut scope.counters {
                c.limit = c.count;
            }
        }
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(scope);

        match kind {
            ScopeKind::Loop => {
                self.scopes[id.0 as usize].break_label = Some(self.fresh_label(id));
                self.scopes[id.0 as usize].continue_label = Some(self.fresh_label(id));
            }
            ScopeKind::Switch => {
                self.scopes[id.0 as usize].break_label = Some(self.fresh_label(id));
            }
            _ => {}
        }
        id
    }

    /// Close a scope. Closed scopes stay readable but reject mutation;
    /// closing a Function/Script checks that every referenced goto label was
    /// defined.
    pub fn close(&mut self, id: ScopeId) -> Result<()> {
        debug_assert!(!self.scopes[id.0 as usize].closed, "scope closed twice");
        self.scopes[id.0 as usize].closed = true;
        if !self.scopes[id.0 as usize].kind.inherits() {
            for (name, entry) in &self.scopes[id.0 as usize].gotos {
                if !entry.defined {
                    return Err(ScopeError::LabelUndefined(name.clone()));
                }
            }
        }
        Ok(())
    }

    fn assert_open(&self, id: ScopeId) {
        debug_assert!(!self.scopes[id.0 as usize].closed, "mutating a closed scope");
    }

    // ---- Variables ----

    pub fn add_variable(&mut self, id: ScopeId, binding: Binding) -> Result<()> {
        self.assert_open(id);
        let scope = &mut self.scopes[id.0 as usize];
        if scope.vars.contains_key(&binding.name) {
            return Err(ScopeError::Redefined(binding.name));
        }
        scope.vars.insert(binding.name.clone(), binding);
        Ok(())
    }

    /// Declare a local and take the next slot in the owning unit's frame or
    /// register file, bumping the high-water limit through every inheriting
    /// ancestor and into the owning unit itself.
    pub fn add_local(&mut self, id: ScopeId, name: &str, ty: Type) -> Result<u32> {
        self.assert_open(id);
        let slot_kind = self.slot_kind(id);
        let k = slot_kind as usize;

        if self.scopes[id.0 as usize].vars.contains_key(name) {
            return Err(ScopeError::Redefined(name.to_string()));
        }

        let slot = self.scopes[id.0 as usize].counters[k].count;
        self.scopes[id.0 as usize].counters[k].count = slot + 1;

        // High-water propagation: this scope, every inheriting ancestor, and
        // the first non-inheriting (owning) ancestor.
        let new_count = slot + 1;
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let scope = &mut self.scopes[cur.0 as usize];
            if scope.counters[k].limit < new_count {
                scope.counters[k].limit = new_count;
            }
            if scope.kind.inherits() {
                cursor = scope.parent;
            } else {
                break;
            }
        }

        let binding = Binding {
            name: name.to_string(),
            ty,
            kind: BindingKind::Local { slot_kind, slot },
        };
        self.scopes[id.0 as usize]
            .vars
            .insert(name.to_string(), binding);
        Ok(slot)
    }

    /// Which slot kind locals of this scope use, decided by the owning unit:
    /// Function bodies use frame slots, Script bodies use script registers.
    pub fn slot_kind(&self, id: ScopeId) -> SlotKind {
        match self.scopes[self.unit_of(id).0 as usize].kind {
            ScopeKind::Function => SlotKind::Auto,
            _ => SlotKind::Reg,
        }
    }

    /// Nearest non-inheriting ancestor (or self): the scope that owns frame
    /// slots, labels, and goto tables.
    fn unit_of(&self, id: ScopeId) -> ScopeId {
        let mut cur = id;
        loop {
            let scope = &self.scopes[cur.0 as usize];
            if !scope.kind.inherits() {
                return cur;
            }
            cur = scope.parent.expect("inheriting scope must have a parent");
        }
    }

    /// High-water local slot count of the unit owning `id`.
    pub fn frame_limit(&self, id: ScopeId, slot_kind: SlotKind) -> u32 {
        self.scopes[self.unit_of(id).0 as usize].counters[slot_kind as usize].limit
    }

    /// Search this scope and its ancestors. Locals are only visible while
    /// every traversed scope inherits locals and `allow_locals` holds —
    /// a function literal nested in a loop body cannot see the loop's
    /// locals. Non-local bindings are visible regardless.
    pub fn lookup_variable(&self, id: ScopeId, name: &str, allow_locals: bool) -> Result<&Binding> {
        let mut locals_visible = allow_locals;
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let scope = &self.scopes[cur.0 as usize];
            if let Some(binding) = scope.vars.get(name) {
                let is_local = matches!(binding.kind, BindingKind::Local { .. });
                if !is_local || locals_visible {
                    return Ok(binding);
                }
                // An invisible local shadows nothing; keep searching outward.
            }
            if !scope.kind.inherits() {
                locals_visible = false;
            }
            cursor = scope.parent;
        }
        Err(ScopeError::Undeclared(name.to_string()))
    }

    // ---- Types ----

    pub fn add_type(&mut self, id: ScopeId, name: &str, ty: Type) -> Result<()> {
        self.assert_open(id);
        let scope = &mut self.scopes[id.0 as usize];
        if scope.types.contains_key(name) {
            return Err(ScopeError::TypeRedefined(name.to_string()));
        }
        scope.types.insert(name.to_string(), ty);
        Ok(())
    }

    /// Resolve a type, following typedef chains through ancestors.
    pub fn resolve_type(&self, id: ScopeId, ty: &Type) -> Result<Type> {
        let Type::Named(name) = ty else {
            return Ok(ty.clone());
        };
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let scope = &self.scopes[cur.0 as usize];
            if let Some(found) = scope.types.get(name) {
                return self.resolve_type(cur, found);
            }
            cursor = scope.parent;
        }
        Err(ScopeError::UnknownType(name.clone()))
    }

    // ---- Labels ----

    /// Mint a globally-unique label: the dot-path of enclosing scope tags
    /// plus the owning unit's monotonically increasing counter.
    pub fn fresh_label(&mut self, id: ScopeId) -> String {
        let unit = self.unit_of(id);
        let n = self.scopes[unit.0 as usize].next_label;
        self.scopes[unit.0 as usize].next_label = n + 1;
        format!("{}.{}", self.path(unit), n)
    }

    fn path(&self, id: ScopeId) -> String {
        let mut tags = Vec::new();
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let scope = &self.scopes[cur.0 as usize];
            if !scope.tag.is_empty() {
                tags.push(scope.tag.as_str());
            }
            cursor = scope.parent;
        }
        tags.reverse();
        tags.join(".")
    }

    /// The break target of the nearest enclosing Loop or Switch.
    pub fn break_label(&self, id: ScopeId) -> Result<String> {
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let scope = &self.scopes[cur.0 as usize];
            if let Some(label) = &scope.break_label {
                return Ok(label.clone());
            }
            if !scope.kind.inherits() {
                break;
            }
            cursor = scope.parent;
        }
        Err(ScopeError::NotBreakable)
    }

    /// The continue target of the nearest enclosing Loop.
    pub fn continue_label(&self, id: ScopeId) -> Result<String> {
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let scope = &self.scopes[cur.0 as usize];
            if let Some(label) = &scope.continue_label {
                return Ok(label.clone());
            }
            if !scope.kind.inherits() {
                break;
            }
            cursor = scope.parent;
        }
        Err(ScopeError::NotContinuable)
    }

    fn nearest_switch(&self, id: ScopeId) -> Result<ScopeId> {
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let scope = &self.scopes[cur.0 as usize];
            if scope.kind == ScopeKind::Switch {
                return Ok(cur);
            }
            if !scope.kind.inherits() {
                break;
            }
            cursor = scope.parent;
        }
        Err(ScopeError::CaseOutsideSwitch)
    }

    /// Register or reference a case value. Registration always escalates to
    /// the nearest enclosing Switch, however deep the Block/Loop nesting.
    /// `define` marks the `case N:` site; a `goto case N;` only references.
    pub fn case_label(&mut self, id: ScopeId, value: i64, define: bool) -> Result<String> {
        let switch = self.nearest_switch(id)?;
        self.assert_open(switch);
        if let Some(entry) = self.scopes[switch.0 as usize].cases.get_mut(&value) {
            if define {
                if entry.defined {
                    return Err(ScopeError::CaseRedefined(value));
                }
                entry.defined = true;
            }
            return Ok(entry.label.clone());
        }
        let label = self.fresh_label(switch);
        self.scopes[switch.0 as usize]
            .cases
            .insert(value, CaseEntry { label: label.clone(), defined: define });
        Ok(label)
    }

    pub fn default_label(&mut self, id: ScopeId, define: bool) -> Result<String> {
        let switch = self.nearest_switch(id)?;
        self.assert_open(switch);
        if let Some(entry) = &mut self.scopes[switch.0 as usize].default_case {
            if define {
                if entry.defined {
                    return Err(ScopeError::DefaultRedefined);
                }
                entry.defined = true;
            }
            let label = entry.label.clone();
            return Ok(label);
        }
        let label = self.fresh_label(switch);
        self.scopes[switch.0 as usize].default_case =
            Some(CaseEntry { label: label.clone(), defined: define });
        Ok(label)
    }

    /// The sorted `(value, label)` table of a finished switch, failing on any
    /// case that was referenced but never defined.
    pub fn take_cases(&self, id: ScopeId) -> Result<(Vec<(i64, String)>, Option<String>)> {
        let switch = self.nearest_switch(id)?;
        let scope = &self.scopes[switch.0 as usize];
        let mut table = Vec::with_capacity(scope.cases.len());
        for (value, entry) in &scope.cases {
            if !entry.defined {
                return Err(ScopeError::CaseUndefined(*value));
            }
            table.push((*value, entry.label.clone()));
        }
        let default = match &scope.default_case {
            Some(entry) if !entry.defined => return Err(ScopeError::DefaultUndefined),
            Some(entry) => Some(entry.label.clone()),
            None => None,
        };
        Ok((table, default))
    }

    /// Reference a goto label, creating it in the owning unit on first use.
    pub fn goto_label(&mut self, id: ScopeId, name: &str) -> String {
        let unit = self.unit_of(id);
        if let Some(entry) = self.scopes[unit.0 as usize].gotos.get(name) {
            return entry.label.clone();
        }
        let label = self.fresh_label(unit);
        self.scopes[unit.0 as usize]
            .gotos
            .insert(name.to_string(), GotoEntry { label: label.clone(), defined: false });
        label
    }

    /// Define a goto label at its `name:` site.
    pub fn define_goto_label(&mut self, id: ScopeId, name: &str) -> Result<String> {
        let unit = self.unit_of(id);
        self.assert_open(unit);
        if let Some(entry) = self.scopes[unit.0 as usize].gotos.get_mut(name) {
            if entry.defined {
                return Err(ScopeError::LabelRedefined(name.to_string()));
            }
            entry.defined = true;
            return Ok(entry.label.clone());
        }
        let label = self.fresh_label(unit);
        self.scopes[unit.0 as usize]
            .gotos
            .insert(name.to_string(), GotoEntry { label: label.clone(), defined: true });
        Ok(label)
    }
}

impl Scope {
    fn new(parent: Option<ScopeId>, kind: ScopeKind, tag: String) -> Self {
        Scope {
            parent,
            kind,
            tag,
            vars: HashMap::new(),
            types: HashMap::new(),
            gotos: HashMap::new(),
            cases: BTreeMap::new(),
            default_case: None,
            counters: [Counter::default(); 2],
            next_label: 0,
            break_label: None,
            continue_label: None,
            closed: false,
        }
    }
}
