//! Parse tree to SSA control flow graph.
//!
//! One traversal of the tree builds a `Frame` whose blocks are already in
//! SSA form, in the manner of Braun et al., "Simple and Efficient
//! Construction of SSA Form": values are numbered as they are appended,
//! merge points get explicit phis, and a block stays unsealed exactly as
//! long as it can still gain predecessors — for a while loop, the
//! condition block until the back edge from the body is wired in.
//!
//! Locals live in frame slots, so reads and writes become frame accesses
//! rather than renamed values; the block-local value numbering in
//! [`Frame::append`] collapses repeated reads and forwards stores to later
//! reads within a block.

use smallvec::SmallVec;

use quaver_codegen::entity::PackedOption;
use quaver_codegen::error::{CodegenError, CodegenResult};
use quaver_codegen::hir::{Block, HirOp, Scope, Value};
use quaver_codegen::{abi, CompileCtx, ErrorReporter, Frame};
use quaver_runtime::{Slot, Symbol, ThreadContext};

use crate::ast::Ast;

/// Builds one frame (and its nested block-literal frames) from a parse
/// tree.
pub struct CfgBuilder<'a> {
    ctx: &'a mut CompileCtx,
    reporter: &'a mut ErrorReporter,
    /// Class whose method body is being compiled, if any; instance and
    /// class variables resolve against it.
    owning_class: Option<Symbol>,
    /// Frames under construction, innermost last.
    frames: Vec<FrameState>,
}

struct FrameState {
    frame: Frame,
    scope_stack: Vec<Scope>,
    block_stack: Vec<Block>,
}

impl FrameState {
    fn new() -> Self {
        let frame = Frame::new();
        let root = frame.root_scope;
        let entry = frame.entry_block();
        Self { frame, scope_stack: vec![root], block_stack: vec![entry] }
    }

    fn current_scope(&self) -> Scope {
        *self.scope_stack.last().expect("scope stack empty")
    }

    fn current_block(&self) -> Block {
        *self.block_stack.last().expect("block stack empty")
    }

    fn set_current_block(&mut self, block: Block) {
        *self.block_stack.last_mut().expect("block stack empty") = block;
    }
}

impl<'a> CfgBuilder<'a> {
    pub fn new(ctx: &'a mut CompileCtx, reporter: &'a mut ErrorReporter) -> Self {
        Self { ctx, reporter, owning_class: None, frames: Vec::new() }
    }

    /// Build a method body: names resolve against `owning_class`'s
    /// instance variables, class variables, and constants.
    pub fn build_method(
        &mut self,
        owning_class: Symbol,
        block: &Ast,
    ) -> CodegenResult<Frame> {
        self.owning_class = Some(owning_class);
        self.build_frame(block)
    }

    /// Build a frame from a `Block` parse node.
    pub fn build_frame(&mut self, block: &Ast) -> CodegenResult<Frame> {
        let Ast::Block { arguments, argument_defaults, statements } = block else {
            return Err(CodegenError::Internal("frame root must be a block node".into()));
        };

        self.frames.push(FrameState::new());
        {
            let state = self.frames.last_mut().expect("frame just pushed");
            for (position, &name) in arguments.iter().enumerate() {
                let default = argument_defaults.get(position).copied().unwrap_or(Slot::nil());
                let slot_index = abi::FRAME_HEADER_SLOTS + state.frame.prototype.len() as i32;
                let scope = state.current_scope();
                state.frame.scopes[scope].value_indices.insert(name, slot_index);
                state.frame.argument_names.push(name);
                state.frame.argument_defaults.push(default);
                state.frame.prototype.push(default);
            }
        }

        let final_value = self.build_final_value(statements)?;

        // Supply the implicit return when the body did not end in one.
        let state = self.frames.last_mut().expect("frame stack empty");
        let block = state.current_block();
        if !state.frame.blocks[block].has_method_return {
            state.frame.append(block, HirOp::StoreReturn { value: final_value });
            state.frame.append(block, HirOp::MethodReturn);
        }

        let frame = self.frames.pop().expect("frame stack empty").frame;
        log::debug!(
            "built frame: {} blocks, {} values, {} inner frames",
            frame.blocks.len(),
            frame.values.len(),
            frame.inner_frames.len()
        );
        Ok(frame)
    }

    fn state(&mut self) -> &mut FrameState {
        self.frames.last_mut().expect("no frame under construction")
    }

    fn append(&mut self, op: HirOp) -> PackedOption<Value> {
        let state = self.state();
        let block = state.current_block();
        state.frame.append(block, op)
    }

    fn append_value(&mut self, op: HirOp) -> Value {
        self.append(op).expand().expect("appended instruction produces no value")
    }

    fn current_has_returned(&mut self) -> bool {
        let state = self.state();
        let block = state.current_block();
        state.frame.blocks[block].has_method_return
    }

    /// Build every statement of a sequence, returning the last value. A
    /// method return stops the walk; the rest of the sequence is dead.
    fn build_final_value(&mut self, statements: &[Ast]) -> CodegenResult<Value> {
        if statements.is_empty() {
            let value = self.append_value(HirOp::Constant { value: Slot::nil() });
            self.set_final_value(value);
            return Ok(value);
        }
        let mut final_value = None;
        for statement in statements {
            let value = self.build_value(statement)?;
            self.set_final_value(value);
            final_value = Some(value);
            if self.current_has_returned() {
                break;
            }
        }
        Ok(final_value.expect("sequence was not empty"))
    }

    fn set_final_value(&mut self, value: Value) {
        let state = self.state();
        let block = state.current_block();
        state.frame.blocks[block].final_value = value.into();
    }

    /// Build one expression, returning the value holding its result.
    pub fn build_value(&mut self, ast: &Ast) -> CodegenResult<Value> {
        match ast {
            Ast::Empty => Ok(self.append_value(HirOp::Constant { value: Slot::nil() })),

            Ast::Sequence(statements) => self.build_final_value(statements),

            Ast::Constant(slot) => Ok(self.append_value(HirOp::Constant { value: *slot })),

            Ast::Name { name, offset } => self.find_name(*name, None, *offset),

            Ast::Assign { name, offset, value } => {
                let value = self.build_value(value)?;
                self.find_name(*name, Some(value), *offset)?;
                Ok(value)
            }

            Ast::Define { name, offset, value } => self.build_define(*name, *offset, value),

            Ast::If { condition, true_block, false_block } => {
                self.build_if(condition, true_block, false_block)
            }

            Ast::While { condition, body } => self.build_while(condition, body),

            Ast::Message { target, selector, arguments, keyword_arguments } => {
                self.build_message(target, *selector, arguments, keyword_arguments)
            }

            Ast::Block { .. } => self.build_block_literal(ast),

            Ast::MethodReturn { value } => {
                let value = self.build_value(value)?;
                self.append(HirOp::StoreReturn { value });
                self.append(HirOp::MethodReturn);
                Ok(value)
            }

            Ast::MultiAssign { array, targets, offset, last_is_remain } => {
                self.build_multi_assign(array, targets, *offset, *last_is_remain)
            }
        }
    }

    /// A definition reserves the next prototype slot. A constant
    /// initializer becomes the slot's default value directly; anything
    /// else defaults to nil and stores at runtime.
    fn build_define(&mut self, name: Symbol, offset: usize, value: &Ast) -> CodegenResult<Value> {
        {
            let state = self.state();
            let slot_index = abi::FRAME_HEADER_SLOTS + state.frame.prototype.len() as i32;
            let scope = state.current_scope();
            state.frame.scopes[scope].value_indices.insert(name, slot_index);
            state.frame.variable_names.push(name);
        }

        if let Ast::Constant(slot) = value {
            self.state().frame.prototype.push(*slot);
            return Ok(self.append_value(HirOp::Constant { value: *slot }));
        }

        self.state().frame.prototype.push(Slot::nil());
        let value = self.build_value(value)?;
        self.find_name(name, Some(value), offset)?;
        Ok(value)
    }

    /// `if` builds both branches as inline sub-scopes and, when either can
    /// fall through, merges their values with a phi in a continuation
    /// block.
    fn build_if(
        &mut self,
        condition: &Ast,
        true_block: &Ast,
        false_block: &Ast,
    ) -> CodegenResult<Value> {
        let condition_value = self.build_value(condition)?;
        let parent_scope = self.state().current_scope();
        let condition_block = self.state().current_block();

        // Both branch entries exist before the branches are emitted, so
        // the terminating pair of the condition block carries real
        // targets.
        let (true_entry, false_entry) = {
            let state = self.state();
            let true_scope = state.frame.make_scope(parent_scope);
            let true_entry = state.frame.make_block(true_scope);
            let false_scope = state.frame.make_scope(parent_scope);
            let false_entry = state.frame.make_block(false_scope);
            state.frame.add_edge(condition_block, true_entry);
            state.frame.add_edge(condition_block, false_entry);
            state.frame.seal_block(true_entry);
            state.frame.seal_block(false_entry);
            (true_entry, false_entry)
        };
        self.append(HirOp::BranchIfTrue { condition: condition_value, target: true_entry });
        self.append(HirOp::Branch { target: false_entry });

        let (true_exit, true_value, true_returns) =
            self.build_branch_body(true_entry, true_block)?;
        let (false_exit, false_value, false_returns) =
            self.build_branch_body(false_entry, false_block)?;

        // Both branches return: nothing ever reaches past the if.
        if true_returns && false_returns {
            let state = self.state();
            let block = state.current_block();
            state.frame.blocks[block].has_method_return = true;
            return Ok(condition_value);
        }

        let merge = {
            let state = self.state();
            let merge = state.frame.make_block(parent_scope);
            if !true_returns {
                state.frame.add_edge(true_exit, merge);
            }
            if !false_returns {
                state.frame.add_edge(false_exit, merge);
            }
            state.frame.seal_block(merge);
            merge
        };
        if !true_returns {
            self.append_branch_in(true_exit, merge);
        }
        if !false_returns {
            self.append_branch_in(false_exit, merge);
        }
        self.state().set_current_block(merge);

        if !true_returns && !false_returns {
            let mut inputs: SmallVec<[Value; 2]> = SmallVec::new();
            inputs.push(true_value);
            inputs.push(false_value);
            return Ok(self.state().frame.append_phi(merge, inputs));
        }
        Ok(if true_returns { false_value } else { true_value })
    }

    fn build_branch_body(
        &mut self,
        entry: Block,
        body: &Ast,
    ) -> CodegenResult<(Block, Value, bool)> {
        let scope = self.state().frame.blocks[entry].scope;
        let state = self.state();
        state.scope_stack.push(scope);
        state.block_stack.push(entry);
        let value = self.build_final_value(core::slice::from_ref(body))?;
        let state = self.state();
        let exit = state.block_stack.pop().expect("branch block stack underflow");
        state.scope_stack.pop();
        let returns = state.frame.blocks[exit].has_method_return;
        Ok((exit, value, returns))
    }

    fn append_branch_in(&mut self, block: Block, target: Block) {
        let state = self.state();
        state.frame.append(block, HirOp::Branch { target });
    }

    /// `while` wires predecessor -> condition -> body -> condition, with
    /// the condition block left unsealed until the back edge from the
    /// body exists. The loop's value is nil.
    fn build_while(&mut self, condition: &Ast, body: &Ast) -> CodegenResult<Value> {
        let parent_scope = self.state().current_scope();
        let predecessor = self.state().current_block();

        let (condition_scope, condition_entry) = {
            let state = self.state();
            let scope = state.frame.make_scope(parent_scope);
            let entry = state.frame.make_block(scope);
            state.frame.add_edge(predecessor, entry);
            (scope, entry)
        };
        self.append(HirOp::Branch { target: condition_entry });

        let state = self.state();
        state.scope_stack.push(condition_scope);
        state.block_stack.push(condition_entry);
        let condition_value = self.build_final_value(core::slice::from_ref(condition))?;
        let state = self.state();
        let condition_exit = state.block_stack.pop().expect("condition block stack underflow");
        state.scope_stack.pop();

        if state.frame.blocks[condition_exit].has_method_return {
            // The condition always returns; there is no loop to build.
            state.frame.seal_block(condition_entry);
            state.set_current_block(condition_exit);
            return Ok(condition_value);
        }

        let (body_scope, body_entry) = {
            let state = self.state();
            let scope = state.frame.make_scope(parent_scope);
            let entry = state.frame.make_block(scope);
            state.frame.add_edge(condition_exit, entry);
            state.frame.seal_block(entry);
            (scope, entry)
        };
        {
            let state = self.state();
            state.frame.append(
                condition_exit,
                HirOp::BranchIfTrue { condition: condition_value, target: body_entry },
            );
        }

        let state = self.state();
        state.scope_stack.push(body_scope);
        state.block_stack.push(body_entry);
        self.build_final_value(core::slice::from_ref(body))?;
        let state = self.state();
        let body_exit = state.block_stack.pop().expect("body block stack underflow");
        state.scope_stack.pop();

        // The back edge, and only then the seal.
        let state = self.state();
        if !state.frame.blocks[body_exit].has_method_return {
            state.frame.add_edge(body_exit, condition_entry);
            state.frame.append(body_exit, HirOp::Branch { target: condition_entry });
        }
        state.frame.seal_block(condition_entry);

        let merge = {
            let state = self.state();
            let merge = state.frame.make_block(parent_scope);
            state.frame.add_edge(condition_exit, merge);
            state.frame.seal_block(merge);
            state.frame.append(condition_exit, HirOp::Branch { target: merge });
            merge
        };
        self.state().set_current_block(merge);
        Ok(self.append_value(HirOp::Constant { value: Slot::nil() }))
    }

    fn build_message(
        &mut self,
        target: &Ast,
        selector: Symbol,
        arguments: &[Ast],
        keyword_arguments: &[(Symbol, Ast)],
    ) -> CodegenResult<Value> {
        let mut argument_values: SmallVec<[Value; 4]> = SmallVec::new();
        argument_values.push(self.build_value(target)?);
        for argument in arguments {
            argument_values.push(self.build_value(argument)?);
        }

        let mut keyword_values: SmallVec<[Value; 4]> = SmallVec::new();
        for (key, value) in keyword_arguments {
            keyword_values.push(self.append_value(HirOp::Constant { value: key.slot() }));
            keyword_values.push(self.build_value(value)?);
        }

        Ok(self.append_value(HirOp::Message {
            selector,
            arguments: argument_values,
            keyword_arguments: keyword_values,
        }))
    }

    /// A block literal builds its own frame; the literal instruction in
    /// the enclosing frame creates the closure at runtime. Literals are
    /// never inlined here.
    fn build_block_literal(&mut self, block: &Ast) -> CodegenResult<Value> {
        let frame_index = self.state().frame.inner_frames.len() as u32;
        let mut inner = self.build_frame(block)?;
        let value = self.append_value(HirOp::BlockLiteral { frame_index });
        inner.enclosing_literal = Some(value);
        self.state().frame.inner_frames.push(inner);
        Ok(value)
    }

    /// Each target name binds one element of the array expression, via
    /// `at`; with a trailing remainder target, the rest of the series via
    /// `copySeries`.
    fn build_multi_assign(
        &mut self,
        array: &Ast,
        targets: &[Symbol],
        offset: usize,
        last_is_remain: bool,
    ) -> CodegenResult<Value> {
        let array_value = self.build_value(array)?;
        let well_known = *self.ctx.symbols.well_known();

        for (position, &name) in targets.iter().enumerate() {
            let is_remainder = last_is_remain && position + 1 == targets.len();
            let selector = if is_remainder { well_known.copy_series } else { well_known.at };

            let index =
                self.append_value(HirOp::Constant { value: Slot::from_int32(position as i32) });
            let mut arguments: SmallVec<[Value; 4]> = SmallVec::new();
            arguments.push(array_value);
            arguments.push(index);
            let element = self.append_value(HirOp::Message {
                selector,
                arguments,
                keyword_arguments: SmallVec::new(),
            });
            self.find_name(name, Some(element), offset)?;
        }
        Ok(array_value)
    }

    /// Name resolution: class name, then frame slots (walking scopes, then
    /// enclosing frames), then the owning class's instance variables,
    /// class variables, and constants, then the special names. Anything
    /// else is a fatal unresolved name.
    fn find_name(
        &mut self,
        name: Symbol,
        to_write: Option<Value>,
        offset: usize,
    ) -> CodegenResult<Value> {
        if self.is_class_name(name) {
            return self.read_class_constant(name, to_write, offset);
        }

        if let Some((depth, slot_index)) = self.find_frame_slot(name) {
            return Ok(self.access_frame_slot(name, depth, slot_index, to_write));
        }

        if let Some(value) = self.find_instance_variable(name, to_write, offset)? {
            return Ok(value);
        }
        if let Some(value) = self.find_class_variable(name, to_write)? {
            return Ok(value);
        }
        if let Some(value) = self.find_class_constant(name, to_write, offset)? {
            return Ok(value);
        }
        if let Some(value) = self.find_special_name(name, to_write, offset)? {
            return Ok(value);
        }

        self.unresolved(name, offset)
    }

    fn unresolved(&mut self, name: Symbol, offset: usize) -> CodegenResult<Value> {
        let rendered =
            self.ctx.symbols.resolve(name).unwrap_or_else(|| format!("#{:x}", name.hash()));
        let error = CodegenError::NameResolution { name: rendered, offset };
        self.reporter.report(&error);
        Err(error)
    }

    fn is_class_name(&self, name: Symbol) -> bool {
        self.ctx
            .symbols
            .resolve(name)
            .and_then(|text| text.chars().next())
            .is_some_and(|first| first.is_ascii_uppercase())
    }

    /// A class name read loads the class object as a constant.
    fn read_class_constant(
        &mut self,
        name: Symbol,
        to_write: Option<Value>,
        offset: usize,
    ) -> CodegenResult<Value> {
        if to_write.is_some() {
            return self.unresolved(name, offset);
        }
        let Some(class) = self.ctx.class_library.find_class_named(name) else {
            return self.unresolved(name, offset);
        };
        let object = class.object;
        Ok(self.append_value(HirOp::Constant { value: object }))
    }

    /// Search the scope chains of every frame on the build stack,
    /// innermost frame first. Returns how many frame boundaries the
    /// search crossed and the slot index it found.
    fn find_frame_slot(&self, name: Symbol) -> Option<(u32, i32)> {
        for (depth, state) in self.frames.iter().rev().enumerate() {
            let mut scope = Some(state.current_scope());
            while let Some(current) = scope {
                if let Some(&slot_index) = state.frame.scopes[current].value_indices.get(&name) {
                    return Some((depth as u32, slot_index));
                }
                scope = state.frame.scopes[current].parent.expand();
            }
        }
        None
    }

    /// Emit the access to a frame slot. Crossing frame boundaries chains
    /// `LoadOuterFrame` loads to reach the owning frame's pointer; reads
    /// through it are name imports.
    fn access_frame_slot(
        &mut self,
        name: Symbol,
        depth: u32,
        slot_index: i32,
        to_write: Option<Value>,
    ) -> Value {
        let mut outer: PackedOption<Value> = PackedOption::none();
        for _ in 0..depth {
            outer = self.append(HirOp::LoadOuterFrame { outer });
        }

        match (to_write, outer.expand()) {
            (None, None) => self.append_value(HirOp::ReadFromFrame {
                frame_index: slot_index,
                outer_frame: PackedOption::none(),
                name,
            }),
            (None, Some(outer_frame)) => self.append_value(HirOp::ImportName {
                name,
                outer_frame,
                frame_index: slot_index,
            }),
            (Some(value), _) => {
                self.append(HirOp::WriteToFrame {
                    frame_index: slot_index,
                    outer_frame: outer,
                    name,
                    to_write: value,
                });
                value
            }
        }
    }

    fn find_instance_variable(
        &mut self,
        name: Symbol,
        to_write: Option<Value>,
        offset: usize,
    ) -> CodegenResult<Option<Value>> {
        let Some(owning) = self.owning_class else { return Ok(None) };
        let Some(class) = self.ctx.class_library.find_class_named(owning) else {
            return Ok(None);
        };
        let Some(index) = class.instance_variable_index(name) else { return Ok(None) };
        let index = index as u32;

        let this = self.ctx.symbols.well_known().this;
        let this_value = self.find_name(this, None, offset)?;
        Ok(Some(match to_write {
            None => self.append_value(HirOp::ReadFromThis { this: this_value, index, name }),
            Some(value) => {
                self.append(HirOp::WriteToThis { this: this_value, index, name, to_write: value });
                value
            }
        }))
    }

    /// Class variables resolve up the superclass chain, through the
    /// thread context's class-variable array. A metaclass searches the
    /// variables of its associated class.
    fn find_class_variable(
        &mut self,
        name: Symbol,
        to_write: Option<Value>,
    ) -> CodegenResult<Option<Value>> {
        let Some(mut cursor) = self.resolution_class() else { return Ok(None) };

        let found = loop {
            let Some(class) = self.ctx.class_library.find_class_named(cursor) else {
                break None;
            };
            if let Some(index) = class.class_variable_index(name) {
                break Some(index as u32);
            }
            match class.superclass {
                Some(superclass) => cursor = superclass,
                None => break None,
            }
        };
        let Some(index) = found else { return Ok(None) };

        let array_name = self.ctx.symbols.intern("_classVariablesArray");
        let class_array = self.append_value(HirOp::ReadFromContext {
            offset: ThreadContext::offset_of_class_variables_array() as u32,
            name: array_name,
        });
        Ok(Some(match to_write {
            None => self.append_value(HirOp::ReadFromClass { class_array, index, name }),
            Some(value) => {
                self.append(HirOp::WriteToClass { class_array, index, name, to_write: value });
                value
            }
        }))
    }

    fn find_class_constant(
        &mut self,
        name: Symbol,
        to_write: Option<Value>,
        offset: usize,
    ) -> CodegenResult<Option<Value>> {
        let Some(mut cursor) = self.resolution_class() else { return Ok(None) };

        let found = loop {
            let Some(class) = self.ctx.class_library.find_class_named(cursor) else {
                break None;
            };
            if let Some(index) = class.constant_index(name) {
                break Some(class.constant_values[index]);
            }
            match class.superclass {
                Some(superclass) => cursor = superclass,
                None => break None,
            }
        };
        let Some(constant) = found else { return Ok(None) };

        if to_write.is_some() {
            // Constants are read-only.
            return self.unresolved(name, offset).map(Some);
        }
        Ok(Some(self.append_value(HirOp::Constant { value: constant })))
    }

    /// The class whose variables and constants are in scope: the owning
    /// class, or for a metaclass (`Meta_` prefix) its associated class.
    fn resolution_class(&self) -> Option<Symbol> {
        let owning = self.owning_class?;
        let text = self.ctx.symbols.resolve(owning)?;
        match text.strip_prefix("Meta_") {
            Some(stripped) => Some(self.ctx.symbols.intern(stripped)),
            None => Some(owning),
        }
    }

    fn find_special_name(
        &mut self,
        name: Symbol,
        to_write: Option<Value>,
        offset: usize,
    ) -> CodegenResult<Option<Value>> {
        let well_known = *self.ctx.symbols.well_known();
        if name != well_known.super_
            && name != well_known.this_method
            && name != well_known.this_process
            && name != well_known.this_thread
        {
            return Ok(None);
        }
        if to_write.is_some() {
            // All special names are read-only.
            return self.unresolved(name, offset).map(Some);
        }

        if name == well_known.super_ {
            let this_value = self.find_name(well_known.this, None, offset)?;
            return Ok(Some(self.append_value(HirOp::RouteToSuperclass { this: this_value })));
        }
        if name == well_known.this_method {
            return Ok(Some(self.append_value(HirOp::ReadFromFrame {
                frame_index: abi::METHOD_SLOT,
                outer_frame: PackedOption::none(),
                name,
            })));
        }
        let context_offset = if name == well_known.this_process {
            ThreadContext::offset_of_this_process()
        } else {
            ThreadContext::offset_of_this_thread()
        };
        Ok(Some(self.append_value(HirOp::ReadFromContext {
            offset: context_offset as u32,
            name,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quaver_codegen::entity::EntityRef;
    use quaver_codegen::validate::validate_frame;
    use quaver_runtime::{ClassDef, StaticClassLibrary, SymbolTable};
    use std::sync::Arc;

    struct Fixture {
        ctx: CompileCtx,
        reporter: ErrorReporter,
        symbols: Arc<SymbolTable>,
    }

    fn fixture() -> Fixture {
        fixture_with(StaticClassLibrary::new())
    }

    fn fixture_with(library: StaticClassLibrary) -> Fixture {
        let symbols = Arc::new(SymbolTable::new());
        Fixture {
            ctx: CompileCtx::new(symbols.clone(), Box::new(library)),
            reporter: ErrorReporter::suppressed(""),
            symbols,
        }
    }

    fn top_level(statements: Vec<Ast>) -> Ast {
        Ast::Block { arguments: vec![], argument_defaults: vec![], statements }
    }

    fn constant_value(frame: &Frame, block: Block, slot: Slot) -> Value {
        frame.blocks[block]
            .statements
            .iter()
            .find_map(|hir| match &hir.op {
                HirOp::Constant { value } if *value == slot => hir.id.expand(),
                _ => None,
            })
            .expect("constant not found in block")
    }

    #[test]
    fn if_with_phi_produces_four_blocks() {
        let mut fixture = fixture();
        let ast = top_level(vec![Ast::If {
            condition: Box::new(Ast::Constant(Slot::from_bool(true))),
            true_block: Box::new(Ast::Constant(Slot::from_int32(1))),
            false_block: Box::new(Ast::Constant(Slot::from_int32(2))),
        }]);

        let mut builder = CfgBuilder::new(&mut fixture.ctx, &mut fixture.reporter);
        let frame = builder.build_frame(&ast).unwrap();
        validate_frame(&frame).unwrap();

        assert_eq!(frame.blocks.len(), 4);
        let entry = frame.entry_block();
        let true_block = Block::new(1);
        let false_block = Block::new(2);
        let merge = Block::new(3);

        assert_eq!(frame.blocks[entry].successors, vec![true_block, false_block]);
        assert_eq!(frame.blocks[merge].predecessors, vec![true_block, false_block]);

        // The continuation begins with a phi merging the branch values in
        // predecessor order.
        let phi = &frame.blocks[merge].phis[0];
        let HirOp::Phi { inputs } = &phi.op else { panic!("not a phi") };
        let one = constant_value(&frame, true_block, Slot::from_int32(1));
        let two = constant_value(&frame, false_block, Slot::from_int32(2));
        assert_eq!(inputs.as_slice(), &[one, two]);
    }

    #[test]
    fn while_loop_seals_condition_after_back_edge() {
        let mut fixture = fixture();
        let x = fixture.symbols.intern("x");
        let less = fixture.symbols.intern("<");
        let plus = fixture.symbols.intern("+");

        let ast = top_level(vec![
            Ast::Define {
                name: x,
                offset: 0,
                value: Box::new(Ast::Constant(Slot::from_int32(0))),
            },
            Ast::While {
                condition: Box::new(Ast::Message {
                    target: Box::new(Ast::Name { name: x, offset: 8 }),
                    selector: less,
                    arguments: vec![Ast::Constant(Slot::from_int32(5))],
                    keyword_arguments: vec![],
                }),
                body: Box::new(Ast::Assign {
                    name: x,
                    offset: 20,
                    value: Box::new(Ast::Message {
                        target: Box::new(Ast::Name { name: x, offset: 24 }),
                        selector: plus,
                        arguments: vec![Ast::Constant(Slot::from_int32(1))],
                        keyword_arguments: vec![],
                    }),
                }),
            },
        ]);

        let mut builder = CfgBuilder::new(&mut fixture.ctx, &mut fixture.reporter);
        let frame = builder.build_frame(&ast).unwrap();
        validate_frame(&frame).unwrap();

        assert_eq!(frame.blocks.len(), 4);
        let entry = frame.entry_block();
        let condition = Block::new(1);
        let body = Block::new(2);

        // The condition's predecessors are exactly {entry, body}, in that
        // order, and the body jumps only back to the condition.
        assert_eq!(frame.blocks[condition].predecessors, vec![entry, body]);
        assert_eq!(frame.blocks[body].successors, vec![condition]);
        assert!(frame.blocks[condition].sealed);
    }

    #[test]
    fn arguments_resolve_to_frame_slots() {
        let mut fixture = fixture();
        let freq = fixture.symbols.intern("freq");
        let ast = Ast::Block {
            arguments: vec![freq],
            argument_defaults: vec![Slot::from_int32(440)],
            statements: vec![Ast::Name { name: freq, offset: 0 }],
        };

        let mut builder = CfgBuilder::new(&mut fixture.ctx, &mut fixture.reporter);
        let frame = builder.build_frame(&ast).unwrap();
        validate_frame(&frame).unwrap();

        assert_eq!(frame.argument_names, vec![freq]);
        assert_eq!(frame.argument_defaults, vec![Slot::from_int32(440)]);
        let entry = frame.entry_block();
        let read = frame.blocks[entry]
            .statements
            .iter()
            .find(|hir| matches!(hir.op, HirOp::ReadFromFrame { .. }))
            .expect("argument read missing");
        let HirOp::ReadFromFrame { frame_index, .. } = &read.op else { unreachable!() };
        assert_eq!(*frame_index, abi::FRAME_HEADER_SLOTS);
    }

    #[test]
    fn unresolved_names_are_fatal_and_reported() {
        let mut fixture = fixture();
        let mystery = fixture.symbols.intern("mystery");
        let ast = top_level(vec![Ast::Name { name: mystery, offset: 3 }]);

        let mut builder = CfgBuilder::new(&mut fixture.ctx, &mut fixture.reporter);
        let result = builder.build_frame(&ast);
        assert!(matches!(result, Err(CodegenError::NameResolution { offset: 3, .. })));
        assert_eq!(fixture.reporter.error_count(), 1);
    }

    #[test]
    fn instance_variables_read_through_this() {
        let symbols = SymbolTable::new();
        let class_name = symbols.intern("Oscillator");
        let phase = symbols.intern("phase");
        let mut library = StaticClassLibrary::new();
        library.define(ClassDef {
            name: class_name,
            superclass: None,
            instance_variables: vec![symbols.intern("freq"), phase],
            class_variables: vec![],
            constant_names: vec![],
            constant_values: vec![],
            object: Slot::nil(),
        });

        let mut fixture = fixture_with(library);
        let class_name = fixture.symbols.intern("Oscillator");
        let phase = fixture.symbols.intern("phase");
        let this = fixture.symbols.well_known().this;
        let ast = Ast::Block {
            arguments: vec![this],
            argument_defaults: vec![Slot::nil()],
            statements: vec![Ast::Name { name: phase, offset: 0 }],
        };

        let mut builder = CfgBuilder::new(&mut fixture.ctx, &mut fixture.reporter);
        let frame = builder.build_method(class_name, &ast).unwrap();
        validate_frame(&frame).unwrap();

        let entry = frame.entry_block();
        let read = frame.blocks[entry]
            .statements
            .iter()
            .find(|hir| matches!(hir.op, HirOp::ReadFromThis { .. }))
            .expect("instance variable read missing");
        let HirOp::ReadFromThis { index, .. } = &read.op else { unreachable!() };
        assert_eq!(*index, 1);
    }

    #[test]
    fn class_variables_walk_superclasses() {
        let symbols = SymbolTable::new();
        let base = symbols.intern("Ugen");
        let derived = symbols.intern("Filter");
        let shared = symbols.intern("sampleRate");
        let mut library = StaticClassLibrary::new();
        library.define(ClassDef {
            name: base,
            superclass: None,
            instance_variables: vec![],
            class_variables: vec![shared],
            constant_names: vec![],
            constant_values: vec![],
            object: Slot::nil(),
        });
        library.define(ClassDef {
            name: derived,
            superclass: Some(base),
            instance_variables: vec![],
            class_variables: vec![],
            constant_names: vec![],
            constant_values: vec![],
            object: Slot::nil(),
        });

        let mut fixture = fixture_with(library);
        let derived = fixture.symbols.intern("Filter");
        let shared = fixture.symbols.intern("sampleRate");
        let value = fixture.symbols.intern("value");
        let ast = top_level(vec![Ast::Assign {
            name: shared,
            offset: 0,
            value: Box::new(Ast::Name { name: value, offset: 0 }),
        }]);
        // Give `value` something to resolve to.
        let ast = match ast {
            Ast::Block { arguments, argument_defaults, mut statements } => {
                statements.insert(
                    0,
                    Ast::Define {
                        name: value,
                        offset: 0,
                        value: Box::new(Ast::Constant(Slot::from_int32(48000))),
                    },
                );
                Ast::Block { arguments, argument_defaults, statements }
            }
            _ => unreachable!(),
        };

        let mut builder = CfgBuilder::new(&mut fixture.ctx, &mut fixture.reporter);
        let frame = builder.build_method(derived, &ast).unwrap();
        validate_frame(&frame).unwrap();

        let entry = frame.entry_block();
        assert!(frame.blocks[entry]
            .statements
            .iter()
            .any(|hir| matches!(hir.op, HirOp::ReadFromContext { .. })));
        assert!(frame.blocks[entry]
            .statements
            .iter()
            .any(|hir| matches!(hir.op, HirOp::WriteToClass { index: 0, .. })));
    }

    #[test]
    fn class_names_load_the_class_object() {
        let symbols = SymbolTable::new();
        let name = symbols.intern("Synth");
        let marker = Slot::from_symbol_hash(name.hash());
        let mut library = StaticClassLibrary::new();
        library.define(ClassDef {
            name,
            superclass: None,
            instance_variables: vec![],
            class_variables: vec![],
            constant_names: vec![],
            constant_values: vec![],
            object: marker,
        });

        let mut fixture = fixture_with(library);
        let name = fixture.symbols.intern("Synth");
        let ast = top_level(vec![Ast::Name { name, offset: 0 }]);

        let mut builder = CfgBuilder::new(&mut fixture.ctx, &mut fixture.reporter);
        let frame = builder.build_frame(&ast).unwrap();
        let entry = frame.entry_block();
        assert!(frame.blocks[entry]
            .statements
            .iter()
            .any(|hir| matches!(hir.op, HirOp::Constant { value } if value == marker)));
    }

    #[test]
    fn missing_class_names_are_fatal() {
        let mut fixture = fixture();
        let name = fixture.symbols.intern("Imaginary");
        let ast = top_level(vec![Ast::Name { name, offset: 12 }]);
        let mut builder = CfgBuilder::new(&mut fixture.ctx, &mut fixture.reporter);
        assert!(builder.build_frame(&ast).is_err());
    }

    #[test]
    fn super_routes_dispatch_through_this() {
        let mut fixture = fixture();
        let super_ = fixture.symbols.well_known().super_;
        let this = fixture.symbols.well_known().this;
        let ast = Ast::Block {
            arguments: vec![this],
            argument_defaults: vec![Slot::nil()],
            statements: vec![Ast::Name { name: super_, offset: 0 }],
        };

        let mut builder = CfgBuilder::new(&mut fixture.ctx, &mut fixture.reporter);
        let frame = builder.build_frame(&ast).unwrap();
        let entry = frame.entry_block();
        let route = frame.blocks[entry]
            .statements
            .iter()
            .find(|hir| matches!(hir.op, HirOp::RouteToSuperclass { .. }))
            .expect("super read missing");
        // The routed receiver is the `this` read preceding it.
        let HirOp::RouteToSuperclass { this: receiver } = &route.op else { unreachable!() };
        let receiver = *receiver;
        assert!(matches!(
            frame.value_hir(receiver).op,
            HirOp::ReadFromFrame { frame_index, .. } if frame_index == abi::FRAME_HEADER_SLOTS
        ));
    }

    #[test]
    fn special_names_read_the_context() {
        let mut fixture = fixture();
        let this_process = fixture.symbols.well_known().this_process;
        let ast = top_level(vec![Ast::Name { name: this_process, offset: 0 }]);

        let mut builder = CfgBuilder::new(&mut fixture.ctx, &mut fixture.reporter);
        let frame = builder.build_frame(&ast).unwrap();
        let entry = frame.entry_block();
        let read = frame.blocks[entry]
            .statements
            .iter()
            .find(|hir| matches!(hir.op, HirOp::ReadFromContext { .. }))
            .expect("context read missing");
        let HirOp::ReadFromContext { offset, .. } = &read.op else { unreachable!() };
        assert_eq!(*offset, ThreadContext::offset_of_this_process() as u32);
    }

    #[test]
    fn block_literals_build_nested_frames_with_imports() {
        let mut fixture = fixture();
        let x = fixture.symbols.intern("x");
        let ast = top_level(vec![
            Ast::Define {
                name: x,
                offset: 0,
                value: Box::new(Ast::Constant(Slot::from_int32(7))),
            },
            Ast::Block {
                arguments: vec![],
                argument_defaults: vec![],
                statements: vec![Ast::Name { name: x, offset: 10 }],
            },
        ]);

        let mut builder = CfgBuilder::new(&mut fixture.ctx, &mut fixture.reporter);
        let frame = builder.build_frame(&ast).unwrap();
        validate_frame(&frame).unwrap();

        assert_eq!(frame.inner_frames.len(), 1);
        let entry = frame.entry_block();
        assert!(frame.blocks[entry]
            .statements
            .iter()
            .any(|hir| matches!(hir.op, HirOp::BlockLiteral { frame_index: 0 })));

        // The inner frame reaches `x` through the enclosing frame pointer.
        let inner = &frame.inner_frames[0];
        assert!(inner.enclosing_literal.is_some());
        let inner_entry = inner.entry_block();
        assert!(inner.blocks[inner_entry]
            .statements
            .iter()
            .any(|hir| matches!(hir.op, HirOp::LoadOuterFrame { .. })));
        assert!(inner.blocks[inner_entry]
            .statements
            .iter()
            .any(|hir| matches!(hir.op, HirOp::ImportName { .. })));
    }

    #[test]
    fn multi_assign_expands_to_at_messages() {
        let mut fixture = fixture();
        let a = fixture.symbols.intern("a");
        let rest = fixture.symbols.intern("rest");
        let array = fixture.symbols.intern("array");

        let ast = top_level(vec![
            Ast::Define {
                name: a,
                offset: 0,
                value: Box::new(Ast::Constant(Slot::nil())),
            },
            Ast::Define {
                name: rest,
                offset: 4,
                value: Box::new(Ast::Constant(Slot::nil())),
            },
            Ast::Define {
                name: array,
                offset: 8,
                value: Box::new(Ast::Constant(Slot::nil())),
            },
            Ast::MultiAssign {
                array: Box::new(Ast::Name { name: array, offset: 16 }),
                targets: vec![a, rest],
                offset: 16,
                last_is_remain: true,
            },
        ]);

        let mut builder = CfgBuilder::new(&mut fixture.ctx, &mut fixture.reporter);
        let frame = builder.build_frame(&ast).unwrap();
        validate_frame(&frame).unwrap();

        let well_known = *fixture.symbols.well_known();
        let entry = frame.entry_block();
        let selectors: Vec<Symbol> = frame.blocks[entry]
            .statements
            .iter()
            .filter_map(|hir| match &hir.op {
                HirOp::Message { selector, .. } => Some(*selector),
                _ => None,
            })
            .collect();
        assert_eq!(selectors, vec![well_known.at, well_known.copy_series]);

        let writes = frame.blocks[entry]
            .statements
            .iter()
            .filter(|hir| matches!(hir.op, HirOp::WriteToFrame { .. }))
            .count();
        assert_eq!(writes, 2);
    }

    #[test]
    fn returns_stop_sequence_building() {
        let mut fixture = fixture();
        let ast = top_level(vec![
            Ast::MethodReturn { value: Box::new(Ast::Constant(Slot::from_int32(1))) },
            Ast::Constant(Slot::from_int32(2)),
        ]);

        let mut builder = CfgBuilder::new(&mut fixture.ctx, &mut fixture.reporter);
        let frame = builder.build_frame(&ast).unwrap();
        validate_frame(&frame).unwrap();

        // The dead constant after the return was never built, and no
        // implicit return was appended after the explicit one.
        let entry = frame.entry_block();
        assert!(!frame.blocks[entry]
            .statements
            .iter()
            .any(|hir| matches!(hir.op, HirOp::Constant { value } if value == Slot::from_int32(2))));
        let returns = frame.blocks[entry]
            .statements
            .iter()
            .filter(|hir| matches!(hir.op, HirOp::MethodReturn))
            .count();
        assert_eq!(returns, 1);
    }

    #[test]
    fn if_where_both_branches_return_has_no_continuation() {
        let mut fixture = fixture();
        let ast = top_level(vec![Ast::If {
            condition: Box::new(Ast::Constant(Slot::from_bool(false))),
            true_block: Box::new(Ast::MethodReturn {
                value: Box::new(Ast::Constant(Slot::from_int32(1))),
            }),
            false_block: Box::new(Ast::MethodReturn {
                value: Box::new(Ast::Constant(Slot::from_int32(2))),
            }),
        }]);

        let mut builder = CfgBuilder::new(&mut fixture.ctx, &mut fixture.reporter);
        let frame = builder.build_frame(&ast).unwrap();
        validate_frame(&frame).unwrap();
        // Entry plus the two returning branches; no merge block.
        assert_eq!(frame.blocks.len(), 3);
    }
}
