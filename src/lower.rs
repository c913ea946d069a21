//! Lowering: walks the AST once, consulting the scope tree for every name,
//! building value-graph nodes for everything structurally constant and
//! opcode sequences for everything that runs.
//!
//! File-scope declarations are registered in a pre-pass so that bodies may
//! reference functions, constants and storage declared later in the unit;
//! constant forward references stay symbolic in the graph and resolve during
//! the post-allocation sweep.

use std::collections::{HashMap, HashSet};

use crate::ast::{
    AssignOp, BinOp, Decl, Expr, Linkage, Param, Program, Span, Spanned, Stmt, StorageSpec,
    SwitchArm, Type, UnaryOp, VarDecl,
};
use crate::code::{CodeSeq, FunctionEntry, InstrId, Operand, Pcode, ScriptEntry};
use crate::graph::{NodeId, Num, ValueGraph};
use crate::scope::{Binding, BindingKind, ScopeId, ScopeKind, ScopeTree, SlotKind};
use crate::storage::{StorageAllocator, StorageClass, TargetCaps};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct LowerError {
    pub span: Span,
    pub message: String,
}

impl LowerError {
    fn new(span: Span, message: impl Into<String>) -> Self {
        LowerError { span, message: message.into() }
    }
}

type Result<T> = std::result::Result<T, LowerError>;

/// Lower a parsed unit into the given graph, sequence and allocator.
/// `module` tags the scope tree root and therefore every mangled label.
pub fn lower(
    program: &Program,
    module: &str,
    caps: &TargetCaps,
    mangle_types: bool,
    graph: &mut ValueGraph,
    code: &mut CodeSeq,
    storage: &mut StorageAllocator,
) -> Result<()> {
    let mut lowerer = Lowerer {
        graph,
        code,
        storage,
        scopes: ScopeTree::new(module),
        caps,
        mangle_types,
        pending: Vec::new(),
        const_statics: HashMap::new(),
        prefuncs: HashMap::new(),
        assigned: collect_assigned(program),
        script_numbers: HashSet::new(),
        script_count: 0,
    };
    lowerer.run(program)
}

struct PreFunc {
    scope: ScopeId,
    entry: String,
    index: u32,
    argc: u32,
    returns: bool,
}

struct Lowerer<'a> {
    graph: &'a mut ValueGraph,
    code: &'a mut CodeSeq,
    storage: &'a mut StorageAllocator,
    scopes: ScopeTree,
    caps: &'a TargetCaps,
    mangle_types: bool,
    /// Labels waiting for the next emitted instruction.
    pending: Vec<String>,
    /// Statics that are never assigned and carry a constant initializer;
    /// reads of these collapse to a single immediate push.
    const_statics: HashMap<String, NodeId>,
    /// Function declarations registered by the pre-pass, by decl index.
    prefuncs: HashMap<usize, PreFunc>,
    /// Every name the program assigns to anywhere, from a pre-scan.
    assigned: HashSet<String>,
    script_numbers: HashSet<i64>,
    script_count: u32,
}

#[derive(Clone, Copy, PartialEq)]
enum UnitCtx {
    Script,
    Function { returns: bool },
}

impl<'a> Lowerer<'a> {
    fn run(&mut self, program: &Program) -> Result<()> {
        // Pre-pass: file-scope names, so bodies can reference forward.
        for (i, decl) in program.declarations.iter().enumerate() {
            self.predeclare(i, decl)?;
        }

        // Body pass.
        for (i, decl) in program.declarations.iter().enumerate() {
            match decl {
                Decl::Script { number, params, body, span } => {
                    self.lower_script(number, params, body, *span)?;
                }
                Decl::Function { params, body: Some(body), span, .. } => {
                    self.lower_function_body(i, params, body, *span)?;
                }
                _ => {}
            }
        }

        self.scopes.close(self.scopes.root()).map_err(|e| {
            LowerError::new(Span::UNKNOWN, e.to_string())
        })?;
        Ok(())
    }

    // ---- Pre-pass ----

    fn predeclare(&mut self, index: usize, decl: &Decl) -> Result<()> {
        let root = self.scopes.root();
        match decl {
            Decl::Const { name, ty, value, span } => {
                let node = self.const_node(root, value)?;
                let symbol = format!("const${name}");
                self.graph
                    .define_symbol(&symbol, node)
                    .map_err(|e| LowerError::new(*span, e.to_string()))?;
                self.add_binding(root, *span, Binding {
                    name: name.clone(),
                    ty: ty.clone(),
                    kind: BindingKind::Constant(node),
                })?;
            }

            Decl::Typedef { name, ty, span } => {
                self.scopes
                    .add_type(root, name, ty.clone())
                    .map_err(|e| LowerError::new(*span, e.to_string()))?;
            }

            Decl::Var(var) => self.declare_storage_var(root, var, true)?,

            Decl::Function { name, linkage, return_type, params, body, span } => {
                let return_type = self.resolve_type(root, return_type, *span)?;
                let mut param_types = Vec::with_capacity(params.len());
                for p in params {
                    param_types.push(self.resolve_type(root, &p.ty, *span)?);
                }
                let symbol = self.function_symbol(name, *linkage, &param_types);
                let returns = return_type != Type::Void;

                let entry = if body.is_some() {
                    let scope = self.scopes.open(root, ScopeKind::Function, name);
                    let entry = self.scopes.fresh_label(scope);
                    self.prefuncs.insert(index, PreFunc {
                        scope,
                        entry: entry.clone(),
                        index: 0, // patched below
                        argc: params.len() as u32,
                        returns,
                    });
                    Some(entry)
                } else {
                    None
                };

                let fn_index = self
                    .code
                    .add_function(FunctionEntry {
                        name: symbol.clone(),
                        entry,
                        argc: params.len() as u32,
                        locals: 0,
                        returns,
                    })
                    .map_err(|e| LowerError::new(*span, e.to_string()))?;
                if let Some(pf) = self.prefuncs.get_mut(&index) {
                    pf.index = fn_index;
                }

                // Call operands reference the symbol; the driver binds it to
                // the final directory index, which linking may shift.
                self.graph.declare_symbol(&symbol);

                self.add_binding(root, *span, Binding {
                    name: name.clone(),
                    ty: return_type.clone(),
                    kind: BindingKind::Function {
                        symbol,
                        params: param_types,
                        return_type,
                        defined: body.is_some(),
                    },
                })?;
            }

            Decl::Script { .. } => {}
        }
        Ok(())
    }

    /// File-scope or body-level declaration of a persistent variable.
    fn declare_storage_var(&mut self, scope: ScopeId, var: &VarDecl, file_scope: bool) -> Result<()> {
        let is_array = var.size.is_some();
        if let Some(size) = &var.size {
            let node = self.const_node(scope, size)?;
            match self.graph.resolve(node) {
                Ok(Num::Int(n)) if n > 0 => {}
                Ok(_) => {
                    return Err(LowerError::new(size.span, "array size must be positive"));
                }
                Err(_) => {
                    return Err(LowerError::new(
                        size.span,
                        "array size must be a resolved constant",
                    ));
                }
            }
        }

        let class = match (var.storage, file_scope, is_array) {
            (StorageSpec::Static, _, false) => StorageClass::Static,
            (StorageSpec::Static, _, true) => {
                return Err(LowerError::new(var.span, "static arrays are not supported"));
            }
            (StorageSpec::World, _, false) => StorageClass::WorldReg,
            (StorageSpec::World, _, true) => StorageClass::WorldArray,
            (StorageSpec::Global, _, false) => StorageClass::GlobalReg,
            (StorageSpec::Global, _, true) => StorageClass::GlobalArray,
            (StorageSpec::Default, true, false) => StorageClass::MapReg,
            (StorageSpec::Default, true, true) => StorageClass::MapArray,
            (StorageSpec::Default, false, _) => {
                unreachable!("local declarations take the local path")
            }
        };
        // Synonyms apply before anything else so opcode selection, the
        // mangled symbol and the allocator all agree.
        let class = self.caps.resolve_synonym(class);

        let ty = self.resolve_type(scope, &var.ty, var.span)?;
        let symbol = if file_scope {
            format!("{}${}", symbol_prefix(class), var.name)
        } else {
            // Body statics get a unit-qualified symbol so equal names in
            // different scripts stay distinct.
            format!(
                "{}${}${}",
                symbol_prefix(class),
                var.name,
                self.scopes.fresh_label(scope)
            )
        };

        let init = match &var.init {
            None => None,
            Some(init) if class == StorageClass::Static => Some(self.const_node(scope, init)?),
            Some(init) => {
                return Err(LowerError::new(
                    init.span,
                    format!("{class} variables cannot have initializers"),
                ));
            }
        };

        if let Some(node) = init {
            if !self.assigned.contains(&var.name) {
                self.const_statics.insert(symbol.clone(), node);
            }
        }

        self.storage.declare(class, &symbol, init, var.span, self.graph);
        self.add_binding(scope, var.span, Binding {
            name: var.name.clone(),
            ty,
            kind: BindingKind::Deferred { class, symbol },
        })
    }

    // ---- Units ----

    fn lower_script(
        &mut self,
        number: &Spanned<Expr>,
        params: &[Param],
        body: &[Spanned<Stmt>],
        span: Span,
    ) -> Result<()> {
        self.script_count += 1;
        let tag = format!("s{}", self.script_count);
        let root = self.scopes.root();
        let scope = self.scopes.open(root, ScopeKind::Script, &tag);

        let number_node = self.const_node(scope, number)?;
        match self.graph.resolve(number_node) {
            Ok(Num::Int(n)) => {
                if !self.script_numbers.insert(n) {
                    return Err(LowerError::new(number.span, format!("script {n} redefined")));
                }
            }
            Ok(Num::Float(_)) => {
                return Err(LowerError::new(number.span, "script number must be an integer"));
            }
            Err(_) => {
                return Err(LowerError::new(
                    number.span,
                    "script number must be a resolved constant",
                ));
            }
        }

        for p in params {
            let ty = self.resolve_type(scope, &p.ty, span)?;
            self.scopes
                .add_local(scope, &p.name, ty)
                .map_err(|e| LowerError::new(span, e.to_string()))?;
        }

        let entry = self.scopes.fresh_label(scope);
        self.mark(entry.clone());
        self.lower_body(scope, UnitCtx::Script, body)?;
        self.emit(Pcode::Terminate, vec![], span)?;

        self.scopes
            .close(scope)
            .map_err(|e| LowerError::new(span, e.to_string()))?;
        self.code.add_script(ScriptEntry {
            number: number_node,
            entry,
            argc: params.len() as u32,
            flags: 0,
        });
        Ok(())
    }

    fn lower_function_body(
        &mut self,
        decl_index: usize,
        params: &[Param],
        body: &[Spanned<Stmt>],
        span: Span,
    ) -> Result<()> {
        let pf = &self.prefuncs[&decl_index];
        let (scope, entry, fn_index, argc, returns) =
            (pf.scope, pf.entry.clone(), pf.index, pf.argc, pf.returns);

        // Parameters occupy the first frame slots.
        for p in params {
            let ty = self.resolve_type(scope, &p.ty, span)?;
            self.scopes
                .add_local(scope, &p.name, ty)
                .map_err(|e| LowerError::new(span, e.to_string()))?;
        }

        self.mark(entry);
        self.lower_body(scope, UnitCtx::Function { returns }, body)?;
        if returns {
            let zero = self.graph.int(0);
            self.emit(Pcode::PushImmediate, vec![Operand::Value(zero)], span)?;
            self.emit(Pcode::ReturnVal, vec![], span)?;
        } else {
            self.emit(Pcode::ReturnVoid, vec![], span)?;
        }

        self.scopes
            .close(scope)
            .map_err(|e| LowerError::new(span, e.to_string()))?;
        let frame = self.scopes.frame_limit(scope, SlotKind::Auto);
        self.code.set_function_locals(fn_index, frame.saturating_sub(argc));
        Ok(())
    }

    fn lower_body(&mut self, scope: ScopeId, ctx: UnitCtx, body: &[Spanned<Stmt>]) -> Result<()> {
        for stmt in body {
            self.lower_stmt(scope, ctx, stmt)?;
        }
        Ok(())
    }

    // ---- Statements ----

    fn lower_stmt(&mut self, scope: ScopeId, ctx: UnitCtx, stmt: &Spanned<Stmt>) -> Result<()> {
        let span = stmt.span;
        match &stmt.node {
            Stmt::Var(var) => self.lower_local_var(scope, var),

            Stmt::Const { name, ty, value } => {
                let node = self.const_node(scope, value)?;
                let ty = self.resolve_type(scope, ty, value.span)?;
                self.add_binding(scope, value.span, Binding {
                    name: name.clone(),
                    ty,
                    kind: BindingKind::Constant(node),
                })
            }

            Stmt::Assign { target, index, op, value } => {
                self.lower_assign(scope, target, index.as_ref(), *op, value)
            }

            Stmt::If { cond, then_body, else_body } => {
                self.lower_expr(scope, cond)?;
                match else_body {
                    None => {
                        let end = self.scopes.fresh_label(scope);
                        self.emit(Pcode::IfNotGoto, vec![Operand::Label(end.clone())], span)?;
                        let inner = self.scopes.open(scope, ScopeKind::Block, "");
                        self.lower_body(inner, ctx, then_body)?;
                        self.close(inner, span)?;
                        self.mark(end);
                    }
                    Some(else_body) => {
                        let else_l = self.scopes.fresh_label(scope);
                        let end = self.scopes.fresh_label(scope);
                        self.emit(Pcode::IfNotGoto, vec![Operand::Label(else_l.clone())], span)?;
                        let inner = self.scopes.open(scope, ScopeKind::Block, "");
                        self.lower_body(inner, ctx, then_body)?;
                        self.close(inner, span)?;
                        self.emit(Pcode::Jump, vec![Operand::Label(end.clone())], span)?;
                        self.mark(else_l);
                        let inner = self.scopes.open(scope, ScopeKind::Block, "");
                        self.lower_body(inner, ctx, else_body)?;
                        self.close(inner, span)?;
                        self.mark(end);
                    }
                }
                Ok(())
            }

            Stmt::While { cond, body } => {
                let lp = self.scopes.open(scope, ScopeKind::Loop, "");
                let cont = self.scopes.continue_label(lp).expect("loop scope");
                let brk = self.scopes.break_label(lp).expect("loop scope");
                self.mark(cont.clone());
                self.lower_expr(lp, cond)?;
                self.emit(Pcode::IfNotGoto, vec![Operand::Label(brk.clone())], span)?;
                self.lower_body(lp, ctx, body)?;
                self.emit(Pcode::Jump, vec![Operand::Label(cont)], span)?;
                self.mark(brk);
                self.close(lp, span)
            }

            Stmt::For { init, cond, step, body } => {
                let outer = self.scopes.open(scope, ScopeKind::Block, "");
                if let Some(init) = init {
                    self.lower_stmt(outer, ctx, init)?;
                }
                let lp = self.scopes.open(outer, ScopeKind::Loop, "");
                let top = self.scopes.fresh_label(lp);
                let cont = self.scopes.continue_label(lp).expect("loop scope");
                let brk = self.scopes.break_label(lp).expect("loop scope");
                self.mark(top.clone());
                if let Some(cond) = cond {
                    self.lower_expr(lp, cond)?;
                    self.emit(Pcode::IfNotGoto, vec![Operand::Label(brk.clone())], span)?;
                }
                self.lower_body(lp, ctx, body)?;
                // continue lands on the step, not the condition.
                self.mark(cont);
                if let Some(step) = step {
                    self.lower_stmt(lp, ctx, step)?;
                }
                self.emit(Pcode::Jump, vec![Operand::Label(top)], span)?;
                self.mark(brk);
                self.close(lp, span)?;
                self.close(outer, span)
            }

            Stmt::Switch { subject, arms } => self.lower_switch(scope, ctx, subject, arms, span),

            Stmt::Break => {
                let label = self
                    .scopes
                    .break_label(scope)
                    .map_err(|e| LowerError::new(span, e.to_string()))?;
                self.emit(Pcode::Jump, vec![Operand::Label(label)], span)?;
                Ok(())
            }

            Stmt::Continue => {
                let label = self
                    .scopes
                    .continue_label(scope)
                    .map_err(|e| LowerError::new(span, e.to_string()))?;
                self.emit(Pcode::Jump, vec![Operand::Label(label)], span)?;
                Ok(())
            }

            Stmt::GotoCase(value) => {
                let node = self.const_node(scope, value)?;
                let n = match self.graph.resolve(node) {
                    Ok(Num::Int(n)) => n,
                    _ => {
                        return Err(LowerError::new(
                            value.span,
                            "case value must be a resolved integer constant",
                        ));
                    }
                };
                let label = self
                    .scopes
                    .case_label(scope, n, false)
                    .map_err(|e| LowerError::new(span, e.to_string()))?;
                self.emit(Pcode::Jump, vec![Operand::Label(label)], span)?;
                Ok(())
            }

            Stmt::Goto(name) => {
                let label = self.scopes.goto_label(scope, name);
                self.emit(Pcode::Jump, vec![Operand::Label(label)], span)?;
                Ok(())
            }

            Stmt::Label(name) => {
                let label = self
                    .scopes
                    .define_goto_label(scope, name)
                    .map_err(|e| LowerError::new(span, e.to_string()))?;
                self.mark(label);
                Ok(())
            }

            Stmt::Return(value) => match (ctx, value) {
                (UnitCtx::Script, _) => {
                    Err(LowerError::new(span, "'return' used outside of a function"))
                }
                (UnitCtx::Function { returns: true }, Some(value)) => {
                    self.lower_expr(scope, value)?;
                    self.emit(Pcode::ReturnVal, vec![], span)?;
                    Ok(())
                }
                (UnitCtx::Function { returns: true }, None) => {
                    Err(LowerError::new(span, "this function must return a value"))
                }
                (UnitCtx::Function { returns: false }, Some(value)) => {
                    Err(LowerError::new(value.span, "void function returns a value"))
                }
                (UnitCtx::Function { returns: false }, None) => {
                    self.emit(Pcode::ReturnVoid, vec![], span)?;
                    Ok(())
                }
            },

            Stmt::Delay(amount) => {
                self.require_script(ctx, span, "delay")?;
                if self.is_const_expr(scope, amount) {
                    let node = self.const_node(scope, amount)?;
                    self.emit(Pcode::DelayImmediate, vec![Operand::Value(node)], span)?;
                } else {
                    self.lower_expr(scope, amount)?;
                    self.emit(Pcode::Delay, vec![], span)?;
                }
                Ok(())
            }

            Stmt::Suspend => {
                self.require_script(ctx, span, "suspend")?;
                self.emit(Pcode::Suspend, vec![], span)?;
                Ok(())
            }

            Stmt::Terminate => {
                self.require_script(ctx, span, "terminate")?;
                self.emit(Pcode::Terminate, vec![], span)?;
                Ok(())
            }

            Stmt::Restart => {
                self.require_script(ctx, span, "restart")?;
                self.emit(Pcode::Restart, vec![], span)?;
                Ok(())
            }

            Stmt::Print(args) => {
                for arg in args {
                    let string = self.expr_is_str(scope, arg);
                    self.lower_expr(scope, arg)?;
                    let op = if string { Pcode::PrintString } else { Pcode::PrintNumber };
                    self.emit(op, vec![], arg.span)?;
                }
                Ok(())
            }

            Stmt::Expr(expr) => match &expr.node {
                Expr::Call { function, args } => {
                    self.lower_call(scope, function, args, true)?;
                    Ok(())
                }
                _ => {
                    self.lower_expr(scope, expr)?;
                    self.emit(Pcode::Drop, vec![], span)?;
                    Ok(())
                }
            },

            Stmt::Block(body) => {
                let inner = self.scopes.open(scope, ScopeKind::Block, "");
                self.lower_body(inner, ctx, body)?;
                self.close(inner, span)
            }
        }
    }

    fn lower_local_var(&mut self, scope: ScopeId, var: &VarDecl) -> Result<()> {
        // Explicit storage qualifiers make a body declaration persistent.
        if var.storage != StorageSpec::Default {
            return self.declare_storage_var(scope, var, false);
        }
        if var.size.is_some() {
            return Err(LowerError::new(
                var.span,
                "arrays need persistent storage ('world' or 'global', or file scope)",
            ));
        }

        let ty = self.resolve_type(scope, &var.ty, var.span)?;
        let slot = self
            .scopes
            .add_local(scope, &var.name, ty)
            .map_err(|e| LowerError::new(var.span, e.to_string()))?;

        if let Some(init) = &var.init {
            self.lower_expr(scope, init)?;
            let slot_node = self.graph.int(slot as i64);
            let op = match self.scopes.slot_kind(scope) {
                SlotKind::Auto => Pcode::AssignAuto,
                SlotKind::Reg => Pcode::AssignScriptReg,
            };
            self.emit(op, vec![Operand::Value(slot_node)], var.span)?;
        }
        Ok(())
    }

    fn lower_assign(
        &mut self,
        scope: ScopeId,
        target: &Spanned<String>,
        index: Option<&Spanned<Expr>>,
        op: AssignOp,
        value: &Spanned<Expr>,
    ) -> Result<()> {
        let span = target.span;
        let binding = self
            .scopes
            .lookup_variable(scope, target, true)
            .map_err(|e| LowerError::new(span, e.to_string()))?
            .clone();

        match (&binding.kind, index) {
            (BindingKind::Constant(_), _) => {
                Err(LowerError::new(span, format!("cannot assign to constant '{}'", target.node)))
            }
            (BindingKind::Function { .. }, _) => {
                Err(LowerError::new(span, format!("cannot assign to function '{}'", target.node)))
            }

            (BindingKind::Local { slot_kind, slot }, None) => {
                let (push, assign) = match slot_kind {
                    SlotKind::Auto => (Pcode::PushAuto, Pcode::AssignAuto),
                    SlotKind::Reg => (Pcode::PushScriptReg, Pcode::AssignScriptReg),
                };
                let slot_node = self.graph.int(*slot as i64);
                if op != AssignOp::Set {
                    self.emit(push, vec![Operand::Value(slot_node)], span)?;
                }
                self.lower_expr(scope, value)?;
                self.emit_compound(op, span)?;
                self.emit(assign, vec![Operand::Value(slot_node)], span)?;
                Ok(())
            }

            (BindingKind::Local { .. }, Some(index)) => {
                Err(LowerError::new(index.span, format!("'{}' is not an array", target.node)))
            }

            (BindingKind::Deferred { class, symbol }, None) => {
                if class.is_array() {
                    return Err(LowerError::new(
                        span,
                        format!("array '{}' must be indexed", target.node),
                    ));
                }
                let addr = self.graph.symbol_ref(symbol);
                if op != AssignOp::Set {
                    self.emit(push_op(*class), vec![Operand::Value(addr)], span)?;
                }
                self.lower_expr(scope, value)?;
                self.emit_compound(op, span)?;
                self.emit(assign_op(*class), vec![Operand::Value(addr)], span)?;
                Ok(())
            }

            (BindingKind::Deferred { class, symbol }, Some(index)) => {
                if !class.is_array() {
                    return Err(LowerError::new(
                        index.span,
                        format!("'{}' is not an array", target.node),
                    ));
                }
                let addr = self.graph.symbol_ref(symbol);
                self.lower_expr(scope, index)?;
                if op != AssignOp::Set {
                    // Keep the element index for the store, read the element.
                    self.emit(Pcode::Dup, vec![], span)?;
                    self.emit(push_op(*class), vec![Operand::Value(addr)], span)?;
                }
                self.lower_expr(scope, value)?;
                self.emit_compound(op, span)?;
                self.emit(assign_op(*class), vec![Operand::Value(addr)], span)?;
                Ok(())
            }
        }
    }

    fn emit_compound(&mut self, op: AssignOp, span: Span) -> Result<()> {
        match op {
            AssignOp::Set => Ok(()),
            AssignOp::Add => self.emit(Pcode::Add, vec![], span).map(|_| ()),
            AssignOp::Sub => self.emit(Pcode::Sub, vec![], span).map(|_| ()),
        }
    }

    fn lower_switch(
        &mut self,
        scope: ScopeId,
        ctx: UnitCtx,
        subject: &Spanned<Expr>,
        arms: &[SwitchArm],
        span: Span,
    ) -> Result<()> {
        let sw = self.scopes.open(scope, ScopeKind::Switch, "");
        let brk = self.scopes.break_label(sw).expect("switch scope");

        self.lower_expr(sw, subject)?;

        // Register every written case first so the dispatch table can be
        // emitted ahead of the arm bodies.
        let mut table: Vec<(i64, String)> = Vec::new();
        let mut arm_labels: Vec<String> = Vec::with_capacity(arms.len());
        let mut default = None;
        for arm in arms {
            match &arm.case {
                Some(case) => {
                    let node = self.const_node(sw, case)?;
                    let n = match self.graph.resolve(node) {
                        Ok(Num::Int(n)) => n,
                        _ => {
                            return Err(LowerError::new(
                                case.span,
                                "case value must be a resolved integer constant",
                            ));
                        }
                    };
                    let label = self
                        .scopes
                        .case_label(sw, n, true)
                        .map_err(|e| LowerError::new(case.span, e.to_string()))?;
                    table.push((n, label.clone()));
                    arm_labels.push(label);
                }
                None => {
                    let label = self
                        .scopes
                        .default_label(sw, true)
                        .map_err(|e| LowerError::new(span, e.to_string()))?;
                    default = Some(label.clone());
                    arm_labels.push(label);
                }
            }
        }
        table.sort_by_key(|(n, _)| *n);

        for (value, label) in &table {
            let node = self.graph.int(*value);
            self.emit(
                Pcode::CaseGoto,
                vec![Operand::Value(node), Operand::Label(label.clone())],
                span,
            )?;
        }
        // No case matched: discard the subject and fall out (or default).
        self.emit(Pcode::Drop, vec![], span)?;
        let fallthrough = default.unwrap_or_else(|| brk.clone());
        self.emit(Pcode::Jump, vec![Operand::Label(fallthrough)], span)?;

        for (arm, label) in arms.iter().zip(arm_labels) {
            self.mark(label);
            let inner = self.scopes.open(sw, ScopeKind::Block, "");
            self.lower_body(inner, ctx, &arm.body)?;
            self.close(inner, span)?;
        }

        // Any `goto case N` with no matching `case N:` surfaces here.
        self.scopes
            .take_cases(sw)
            .map_err(|e| LowerError::new(span, e.to_string()))?;
        self.mark(brk);
        self.close(sw, span)
    }

    // ---- Expressions ----

    fn lower_expr(&mut self, scope: ScopeId, expr: &Spanned<Expr>) -> Result<()> {
        let span = expr.span;

        // Structurally constant expressions collapse to one immediate push;
        // the value itself may still be symbolic until allocation.
        if self.is_const_expr(scope, expr) {
            let node = self.const_node(scope, expr)?;
            self.emit(Pcode::PushImmediate, vec![Operand::Value(node)], span)?;
            return Ok(());
        }

        match &expr.node {
            Expr::Str(s) => {
                let index = self.code.intern(s);
                let node = self.graph.string_ref(index);
                self.emit(Pcode::PushString, vec![Operand::Value(node)], span)?;
                Ok(())
            }

            Expr::Ref(name) => {
                let binding = self
                    .scopes
                    .lookup_variable(scope, name, true)
                    .map_err(|e| LowerError::new(span, e.to_string()))?
                    .clone();
                match &binding.kind {
                    BindingKind::Constant(node) => {
                        let node = *node;
                        self.emit(Pcode::PushImmediate, vec![Operand::Value(node)], span)?;
                        Ok(())
                    }
                    BindingKind::Local { slot_kind, slot } => {
                        let op = match slot_kind {
                            SlotKind::Auto => Pcode::PushAuto,
                            SlotKind::Reg => Pcode::PushScriptReg,
                        };
                        let slot_node = self.graph.int(*slot as i64);
                        self.emit(op, vec![Operand::Value(slot_node)], span)?;
                        Ok(())
                    }
                    BindingKind::Deferred { class, symbol } => {
                        if class.is_array() {
                            return Err(LowerError::new(
                                span,
                                format!("array '{name}' must be indexed"),
                            ));
                        }
                        // A never-assigned static with a constant initializer
                        // reads as the initializer value itself.
                        if let Some(&node) = self.const_statics.get(symbol) {
                            self.emit(Pcode::PushImmediate, vec![Operand::Value(node)], span)?;
                            return Ok(());
                        }
                        let addr = self.graph.symbol_ref(symbol);
                        self.emit(push_op(*class), vec![Operand::Value(addr)], span)?;
                        Ok(())
                    }
                    BindingKind::Function { .. } => {
                        Err(LowerError::new(span, format!("function '{name}' used as a value")))
                    }
                }
            }

            Expr::Index { name, index } => {
                let binding = self
                    .scopes
                    .lookup_variable(scope, name, true)
                    .map_err(|e| LowerError::new(name.span, e.to_string()))?
                    .clone();
                let BindingKind::Deferred { class, symbol } = &binding.kind else {
                    return Err(LowerError::new(
                        name.span,
                        format!("'{}' is not an array", name.node),
                    ));
                };
                if !class.is_array() {
                    return Err(LowerError::new(
                        name.span,
                        format!("'{}' is not an array", name.node),
                    ));
                }
                let addr = self.graph.symbol_ref(symbol);
                self.lower_expr(scope, index)?;
                self.emit(push_op(*class), vec![Operand::Value(addr)], span)?;
                Ok(())
            }

            Expr::Call { function, args } => {
                self.lower_call(scope, function, args, false)?;
                Ok(())
            }

            Expr::Unary { op, operand } => {
                match op {
                    UnaryOp::ToFloat => Err(LowerError::new(
                        span,
                        "'float()' is only meaningful in constant expressions",
                    )),
                    UnaryOp::ToInt => {
                        self.lower_expr(scope, operand)?;
                        self.emit(Pcode::CastInt, vec![], span)?;
                        Ok(())
                    }
                    _ => {
                        self.lower_expr(scope, operand)?;
                        let pcode = match op {
                            UnaryOp::Neg => Pcode::Neg,
                            UnaryOp::Not => Pcode::Not,
                            UnaryOp::BitNot => Pcode::BitNot,
                            _ => unreachable!(),
                        };
                        self.emit(pcode, vec![], span)?;
                        Ok(())
                    }
                }
            }

            Expr::Binary { op, left, right } => {
                self.lower_expr(scope, left)?;
                self.lower_expr(scope, right)?;
                self.emit(binary_pcode(*op), vec![], span)?;
                Ok(())
            }

            Expr::Ternary { cond, then, otherwise } => {
                let else_l = self.scopes.fresh_label(scope);
                let end = self.scopes.fresh_label(scope);
                self.lower_expr(scope, cond)?;
                self.emit(Pcode::IfNotGoto, vec![Operand::Label(else_l.clone())], span)?;
                self.lower_expr(scope, then)?;
                self.emit(Pcode::Jump, vec![Operand::Label(end.clone())], span)?;
                self.mark(else_l);
                self.lower_expr(scope, otherwise)?;
                self.mark(end);
                Ok(())
            }

            // Constants are caught by the fast path above.
            Expr::Int(_) | Expr::Float(_) | Expr::Bool(_) => unreachable!("constant expression"),
        }
    }

    /// Lower a call; `discard` selects the statement form which drops (or
    /// never produces) the return value.
    fn lower_call(
        &mut self,
        scope: ScopeId,
        function: &Spanned<String>,
        args: &[Spanned<Expr>],
        discard: bool,
    ) -> Result<()> {
        let span = function.span;
        let binding = self
            .scopes
            .lookup_variable(scope, function, true)
            .map_err(|e| LowerError::new(span, e.to_string()))?
            .clone();
        let BindingKind::Function { symbol, params, return_type, .. } = &binding.kind else {
            return Err(LowerError::new(span, format!("'{}' is not a function", function.node)));
        };
        if args.len() != params.len() {
            return Err(LowerError::new(
                span,
                format!(
                    "'{}' takes {} argument(s), {} given",
                    function.node,
                    params.len(),
                    args.len()
                ),
            ));
        }
        if !discard && *return_type == Type::Void {
            return Err(LowerError::new(
                span,
                format!("void function '{}' used in an expression", function.node),
            ));
        }

        for arg in args {
            self.lower_expr(scope, arg)?;
        }
        let index = self.graph.symbol_ref(symbol);
        let op = if discard { Pcode::CallDiscard } else { Pcode::Call };
        self.emit(op, vec![Operand::Value(index)], span)?;
        Ok(())
    }

    // ---- Constant expressions ----

    fn is_const_expr(&self, scope: ScopeId, expr: &Spanned<Expr>) -> bool {
        match &expr.node {
            Expr::Int(_) | Expr::Float(_) | Expr::Bool(_) => true,
            Expr::Str(_) => false,
            Expr::Ref(name) => {
                name == "__target"
                    || matches!(
                        self.scopes.lookup_variable(scope, name, true),
                        Ok(Binding { kind: BindingKind::Constant(_), .. })
                    )
            }
            Expr::Unary { operand, .. } => self.is_const_expr(scope, operand),
            Expr::Binary { left, right, .. } => {
                self.is_const_expr(scope, left) && self.is_const_expr(scope, right)
            }
            Expr::Ternary { cond, then, otherwise } => {
                self.is_const_expr(scope, cond)
                    && self.is_const_expr(scope, then)
                    && self.is_const_expr(scope, otherwise)
            }
            Expr::Index { .. } | Expr::Call { .. } => false,
        }
    }

    /// Build a graph node for a constant expression. Unknown names become
    /// symbolic constant references so file-scope constants may be used
    /// before their declaration; a name nothing ever defines fails the
    /// resolution sweep.
    fn const_node(&mut self, scope: ScopeId, expr: &Spanned<Expr>) -> Result<NodeId> {
        let span = expr.span;
        match &expr.node {
            Expr::Int(v) => Ok(self.graph.int(*v)),
            Expr::Float(f) => Ok(self.graph.literal(Num::Float(*f))),
            Expr::Bool(b) => Ok(self.graph.int(*b as i64)),
            Expr::Str(s) => {
                let index = self.code.intern(s);
                Ok(self.graph.string_ref(index))
            }
            Expr::Ref(name) if name == "__target" => Ok(self.graph.opcode_set_node()),
            Expr::Ref(name) => match self.scopes.lookup_variable(scope, name, true) {
                Ok(Binding { kind: BindingKind::Constant(node), .. }) => Ok(*node),
                Ok(_) => Err(LowerError::new(span, format!("'{name}' is not a constant"))),
                Err(_) => {
                    let symbol = format!("const${name}");
                    self.graph.declare_symbol(&symbol);
                    Ok(self.graph.symbol_ref(&symbol))
                }
            },
            Expr::Unary { op, operand } => {
                let operand = self.const_node(scope, operand)?;
                Ok(self.graph.unary(*op, operand))
            }
            Expr::Binary { op, left, right } => {
                let left = self.const_node(scope, left)?;
                let right = self.const_node(scope, right)?;
                Ok(self.graph.binary(*op, left, right))
            }
            Expr::Ternary { cond, then, otherwise } => {
                let cond = self.const_node(scope, cond)?;
                let then = self.const_node(scope, then)?;
                let otherwise = self.const_node(scope, otherwise)?;
                Ok(self.graph.conditional(cond, then, otherwise))
            }
            Expr::Index { .. } | Expr::Call { .. } => {
                Err(LowerError::new(span, "expression is not constant"))
            }
        }
    }

    // ---- Small helpers ----

    fn emit(&mut self, pcode: Pcode, operands: Vec<Operand>, span: Span) -> Result<InstrId> {
        let id = self.code.emit(pcode, operands, span);
        for label in std::mem::take(&mut self.pending) {
            self.code
                .attach_label(id, &label)
                .map_err(|e| LowerError::new(span, e.to_string()))?;
        }
        Ok(id)
    }

    /// Queue a label for the next emitted instruction.
    fn mark(&mut self, label: String) {
        self.pending.push(label);
    }

    fn close(&mut self, scope: ScopeId, span: Span) -> Result<()> {
        self.scopes
            .close(scope)
            .map_err(|e| LowerError::new(span, e.to_string()))
    }

    fn add_binding(&mut self, scope: ScopeId, span: Span, binding: Binding) -> Result<()> {
        self.scopes
            .add_variable(scope, binding)
            .map_err(|e| LowerError::new(span, e.to_string()))
    }

    fn resolve_type(&self, scope: ScopeId, ty: &Type, span: Span) -> Result<Type> {
        self.scopes
            .resolve_type(scope, ty)
            .map_err(|e| LowerError::new(span, e.to_string()))
    }

    fn require_script(&self, ctx: UnitCtx, span: Span, what: &str) -> Result<()> {
        if ctx == UnitCtx::Script {
            Ok(())
        } else {
            Err(LowerError::new(span, format!("'{what}' is only allowed inside a script")))
        }
    }

    fn function_symbol(&self, name: &str, linkage: Linkage, params: &[Type]) -> String {
        match linkage {
            Linkage::External => name.to_string(),
            Linkage::Internal => {
                if self.mangle_types {
                    let letters: String = params.iter().map(type_letter).collect();
                    format!("fn${name}${letters}")
                } else {
                    format!("fn${name}")
                }
            }
        }
    }

    fn expr_is_str(&self, scope: ScopeId, expr: &Spanned<Expr>) -> bool {
        match &expr.node {
            Expr::Str(_) => true,
            Expr::Ref(name) | Expr::Index { name: Spanned { node: name, .. }, .. } => {
                matches!(
                    self.scopes.lookup_variable(scope, name, true),
                    Ok(Binding { ty: Type::Str, .. })
                )
            }
            Expr::Call { function, .. } => matches!(
                self.scopes.lookup_variable(scope, function, true),
                Ok(Binding { ty: Type::Str, kind: BindingKind::Function { .. }, .. })
            ),
            Expr::Ternary { then, .. } => self.expr_is_str(scope, then),
            _ => false,
        }
    }
}

impl StorageClass {
    fn is_array(self) -> bool {
        matches!(
            self,
            StorageClass::MapArray | StorageClass::WorldArray | StorageClass::GlobalArray
        )
    }
}

fn type_letter(ty: &Type) -> char {
    match ty {
        Type::Int => 'i',
        Type::Str => 's',
        Type::Bool => 'b',
        Type::Void => 'v',
        Type::Named(_) => 'n',
    }
}

fn symbol_prefix(class: StorageClass) -> &'static str {
    match class {
        StorageClass::Static => "static",
        StorageClass::MapReg => "map",
        StorageClass::WorldReg => "world",
        StorageClass::GlobalReg => "global",
        StorageClass::MapArray => "maparr",
        StorageClass::WorldArray => "worldarr",
        StorageClass::GlobalArray => "globalarr",
        _ => unreachable!("local classes are not storage symbols"),
    }
}

fn push_op(class: StorageClass) -> Pcode {
    match class {
        StorageClass::Static => Pcode::PushStatic,
        StorageClass::MapReg => Pcode::PushMapReg,
        StorageClass::WorldReg => Pcode::PushWorldReg,
        StorageClass::GlobalReg => Pcode::PushGlobalReg,
        StorageClass::MapArray => Pcode::PushMapArray,
        StorageClass::WorldArray => Pcode::PushWorldArray,
        StorageClass::GlobalArray => Pcode::PushGlobalArray,
        _ => unreachable!("local classes lower through slot opcodes"),
    }
}

fn assign_op(class: StorageClass) -> Pcode {
    match class {
        StorageClass::Static => Pcode::AssignStatic,
        StorageClass::MapReg => Pcode::AssignMapReg,
        StorageClass::WorldReg => Pcode::AssignWorldReg,
        StorageClass::GlobalReg => Pcode::AssignGlobalReg,
        StorageClass::MapArray => Pcode::AssignMapArray,
        StorageClass::WorldArray => Pcode::AssignWorldArray,
        StorageClass::GlobalArray => Pcode::AssignGlobalArray,
        _ => unreachable!("local classes lower through slot opcodes"),
    }
}

fn binary_pcode(op: BinOp) -> Pcode {
    match op {
        BinOp::Add => Pcode::Add,
        BinOp::Sub => Pcode::Sub,
        BinOp::Mul => Pcode::Mul,
        BinOp::Div => Pcode::Div,
        BinOp::Mod => Pcode::Mod,
        BinOp::Shl => Pcode::Shl,
        BinOp::Shr => Pcode::Shr,
        BinOp::BitAnd => Pcode::BitAnd,
        BinOp::BitOr => Pcode::BitOr,
        BinOp::BitXor => Pcode::BitXor,
        BinOp::And => Pcode::And,
        BinOp::Or => Pcode::Or,
        BinOp::Eq => Pcode::Eq,
        BinOp::Ne => Pcode::Ne,
        BinOp::Lt => Pcode::Lt,
        BinOp::Le => Pcode::Le,
        BinOp::Gt => Pcode::Gt,
        BinOp::Ge => Pcode::Ge,
    }
}

/// Every name the program assigns to, anywhere. Used to rule out the
/// constant-read shortcut for statics; shadowing makes this conservative,
/// never unsound.
fn collect_assigned(program: &Program) -> HashSet<String> {
    fn walk(stmts: &[Spanned<Stmt>], out: &mut HashSet<String>) {
        for stmt in stmts {
            match &stmt.node {
                Stmt::Assign { target, .. } => {
                    out.insert(target.node.clone());
                }
                Stmt::If { then_body, else_body, .. } => {
                    walk(then_body, out);
                    if let Some(body) = else_body {
                        walk(body, out);
                    }
                }
                Stmt::While { body, .. } => walk(body, out),
                Stmt::For { init, step, body, .. } => {
                    if let Some(init) = init {
                        walk(std::slice::from_ref(init), out);
                    }
                    if let Some(step) = step {
                        walk(std::slice::from_ref(step), out);
                    }
                    walk(body, out);
                }
                Stmt::Switch { arms, .. } => {
                    for arm in arms {
                        walk(&arm.body, out);
                    }
                }
                Stmt::Block(body) => walk(body, out),
                _ => {}
            }
        }
    }

    let mut out = HashSet::new();
    for decl in &program.declarations {
        match decl {
            Decl::Script { body, .. } => walk(body, &mut out),
            Decl::Function { body: Some(body), .. } => walk(body, &mut out),
            _ => {}
        }
    }
    out
}
