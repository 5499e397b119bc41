//! Parse-tree input to the CFG builder.
//!
//! The external parser hands over plain data: each node carries only child
//! references and literal values. Name-bearing nodes keep their source
//! byte offset so resolution failures can be reported with a location.

use quaver_runtime::{Slot, Symbol};

/// One node of the parse tree.
#[derive(Clone, Debug)]
pub enum Ast {
    /// An empty expression; evaluates to nil.
    Empty,
    Sequence(Vec<Ast>),
    Constant(Slot),
    Name { name: Symbol, offset: usize },
    Assign { name: Symbol, offset: usize, value: Box<Ast> },
    /// Declare a new local and initialize it.
    Define { name: Symbol, offset: usize, value: Box<Ast> },
    If { condition: Box<Ast>, true_block: Box<Ast>, false_block: Box<Ast> },
    While { condition: Box<Ast>, body: Box<Ast> },
    Message {
        target: Box<Ast>,
        selector: Symbol,
        arguments: Vec<Ast>,
        keyword_arguments: Vec<(Symbol, Ast)>,
    },
    /// A block literal: a nested callable with its own arguments.
    Block { arguments: Vec<Symbol>, argument_defaults: Vec<Slot>, statements: Vec<Ast> },
    MethodReturn { value: Box<Ast> },
    /// Destructuring bind of an array-like expression. With
    /// `last_is_remain`, the final target takes the remainder of the
    /// series instead of a single element.
    MultiAssign { array: Box<Ast>, targets: Vec<Symbol>, offset: usize, last_is_remain: bool },
}

impl Ast {
    pub fn sequence(items: Vec<Ast>) -> Ast {
        Ast::Sequence(items)
    }

    pub fn constant(slot: Slot) -> Ast {
        Ast::Constant(slot)
    }
}
