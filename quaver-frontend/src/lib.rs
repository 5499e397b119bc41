//! The Quaver frontend: parse-tree nodes and the builder that turns them
//! into a control flow graph of SSA HIR for `quaver-codegen`.

pub mod ast;
pub mod builder;

pub use ast::Ast;
pub use builder::CfgBuilder;
