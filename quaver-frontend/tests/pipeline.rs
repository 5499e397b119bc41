//! End-to-end: parse tree through CFG construction, linearization,
//! lifetime analysis, allocation, resolution, and emission.

use std::sync::Arc;

use quaver_codegen::emit::{emit, RecordingSink, SinkOp};
use quaver_codegen::{lower_frame, CompileCtx, ErrorReporter, MachineDesc};
use quaver_frontend::{Ast, CfgBuilder};
use quaver_runtime::{Slot, StaticClassLibrary, StatusCode, SymbolTable};

fn compile(statements: Vec<Ast>) -> (Vec<SinkOp>, usize) {
    let _ = env_logger::builder().is_test(true).try_init();
    let symbols = Arc::new(SymbolTable::new());
    let mut ctx = CompileCtx::new(symbols, Box::new(StaticClassLibrary::new()));
    let mut reporter = ErrorReporter::suppressed("");
    let ast = Ast::Block { arguments: vec![], argument_defaults: vec![], statements };

    let mut builder = CfgBuilder::new(&mut ctx, &mut reporter);
    let frame = builder.build_frame(&ast).expect("frame builds");

    let machine = MachineDesc::generic();
    let linear = lower_frame(&frame, &machine).expect("backend pipeline succeeds");

    let mut sink = RecordingSink::new();
    let entry = emit(&linear, &machine, &mut sink).expect("emission succeeds");
    (sink.ops, entry)
}

#[test]
fn constant_expression_compiles_to_store_and_return() {
    let (ops, entry) = compile(vec![Ast::Constant(Slot::from_int32(17))]);
    assert_eq!(entry, 0);

    // The constant is materialized, stored to the return slot, and the
    // function interrupts back to the host with a normal return.
    assert!(matches!(ops[0], SinkOp::MovImm { bits, .. }
        if bits == Slot::from_int32(17).bits()));
    assert!(ops.iter().any(|op| matches!(op, SinkOp::Store { .. })));
    assert_eq!(
        ops.last(),
        Some(&SinkOp::Interrupt { status: StatusCode::Return as i32 })
    );
}

#[test]
fn if_expression_compiles_with_patched_branches() {
    let (ops, _) = compile(vec![Ast::If {
        condition: Box::new(Ast::Constant(Slot::from_bool(true))),
        true_block: Box::new(Ast::Constant(Slot::from_int32(1))),
        false_block: Box::new(Ast::Constant(Slot::from_int32(2))),
    }]);

    let mut saw_conditional = false;
    for op in &ops {
        match op {
            SinkOp::JumpIfTrue { target, .. } => {
                saw_conditional = true;
                let target = target.expect("conditional jump left unpatched");
                assert!(target < ops.len());
            }
            SinkOp::Jump { target } => {
                let target = target.expect("jump left unpatched");
                assert!(target <= ops.len());
            }
            _ => {}
        }
    }
    assert!(saw_conditional);
}

#[test]
fn while_loop_compiles_with_backward_branch() {
    let symbols = SymbolTable::new();
    let x = symbols.intern("x");
    let less = symbols.intern("<");
    let plus = symbols.intern("+");

    let (ops, _) = compile(vec![
        Ast::Define { name: x, offset: 0, value: Box::new(Ast::Constant(Slot::from_int32(0))) },
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

    // The loop body's dispatch interrupts; the back edge is a jump to an
    // earlier offset.
    assert!(ops
        .iter()
        .any(|op| matches!(op, SinkOp::Interrupt { status }
            if *status == StatusCode::Dispatch as i32)));
    let backward = ops.iter().enumerate().any(|(offset, op)| match op {
        SinkOp::Jump { target: Some(target) } => *target <= offset,
        _ => false,
    });
    assert!(backward, "no backward branch found for the loop");
}

#[test]
fn message_send_reads_result_from_return_slot() {
    let symbols = SymbolTable::new();
    let selector = symbols.intern("midicps");

    let (ops, _) = compile(vec![Ast::Message {
        target: Box::new(Ast::Constant(Slot::from_int32(69))),
        selector,
        arguments: vec![],
        keyword_arguments: vec![],
    }]);

    let dispatch = ops
        .iter()
        .position(|op| matches!(op, SinkOp::Interrupt { status }
            if *status == StatusCode::Dispatch as i32))
        .expect("dispatch interrupt missing");
    // The selector hash was stored into the call area before dispatch.
    assert!(ops[..dispatch].iter().any(|op| matches!(op, SinkOp::MovImm { bits, .. }
        if *bits == selector.slot().bits())));
    // The result comes back from the return-value slot below the stack
    // pointer.
    assert!(ops[dispatch..].iter().any(|op| matches!(op, SinkOp::Load { base: 1, byte_offset: -8, .. })));
}

#[test]
fn nested_block_literal_compiles_to_closure_creation() {
    let symbols = SymbolTable::new();
    let x = symbols.intern("x");

    let (ops, _) = compile(vec![
        Ast::Define { name: x, offset: 0, value: Box::new(Ast::Constant(Slot::from_int32(3))) },
        Ast::Block {
            arguments: vec![],
            argument_defaults: vec![],
            statements: vec![Ast::Name { name: x, offset: 9 }],
        },
    ]);

    assert!(ops.iter().any(|op| matches!(op, SinkOp::Interrupt { status }
        if *status == StatusCode::MakeClosure as i32)));
}
