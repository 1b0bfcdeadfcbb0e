//! End-to-end rewriting tests: hand-assembled x86-64 functions are captured, re-encoded
//! and executed, and their behavior is compared against the original semantics.
#![cfg(target_arch = "x86_64")]

use respin::asm::Mnemonic;
use respin::prelude::*;

/// `f(x) = x*x + 5`: mov rax, rdi; imul rax, rax; add rax, 5; ret
const SQUARE_PLUS_5: [u8; 12] = [
    0x48, 0x89, 0xf8, 0x48, 0x0f, 0xaf, 0xc0, 0x48, 0x83, 0xc0, 0x05, 0xc3,
];

/// `f(x) = x > 0 ? 2 : 1`: cmp rdi, 0; jg +6; mov eax, 1; ret; mov eax, 2; ret
const SIGN_SELECT: [u8; 18] = [
    0x48, 0x83, 0xff, 0x00, // cmp rdi, 0
    0x7f, 0x06, // jg +6
    0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
    0xc3, // ret
    0xb8, 0x02, 0x00, 0x00, 0x00, // mov eax, 2
    0xc3, // ret
];

/// `f(n) = n + (n-1) + ... + 1` for n >= 1:
/// xor eax, eax; L: add rax, rdi; dec rdi; jnz L; ret
const TRIANGLE: [u8; 11] = [
    0x31, 0xc0, // xor eax, eax
    0x48, 0x01, 0xf8, // add rax, rdi
    0x48, 0xff, 0xcf, // dec rdi
    0x75, 0xf8, // jnz -8
    0xc3, // ret
];

/// Outer calls inner, then increments the result: `f(x) = x + 1`.
/// 0: call +4 (inner at 9); 5: inc rax; 8: ret; 9: mov rax, rdi; 12: ret
const CALL_CHAIN: [u8; 13] = [
    0xe8, 0x04, 0x00, 0x00, 0x00, // call inner
    0x48, 0xff, 0xc0, // inc rax
    0xc3, // ret
    0x48, 0x89, 0xf8, // inner: mov rax, rdi
    0xc3, // ret
];

fn rewriter_for(code: &[u8]) -> Rewriter {
    let mut rewriter = Rewriter::new().unwrap();
    rewriter.set_target_function(code.as_ptr() as u64);
    rewriter
}

#[test]
fn dynamic_rewrite_preserves_arithmetic() {
    let mut rewriter = rewriter_for(&SQUARE_PLUS_5);
    rewriter.set_param_count(1).unwrap();
    let rewritten = unsafe { rewriter.rewrite(&[7]).unwrap() };
    let f = unsafe { rewritten.as_fn1() };
    for x in [0u64, 1, 7, 1000, u64::MAX] {
        assert_eq!(unsafe { f(x) }, x.wrapping_mul(x).wrapping_add(5));
    }
}

#[test]
fn static_input_folds_to_a_constant_function() {
    let mut rewriter = rewriter_for(&SQUARE_PLUS_5);
    rewriter.declare_static_param(0).unwrap();
    {
        let rewritten = unsafe { rewriter.rewrite(&[9]).unwrap() };
        let f = unsafe { rewritten.as_fn1() };
        assert_eq!(unsafe { f(0) }, 86);
        assert_eq!(unsafe { f(123) }, 86);
    }
    // The whole computation folded: only the result materialization and the return.
    let graph = rewriter.captured_graph().unwrap();
    assert_eq!(graph.instr_count(), 2);
}

#[test]
fn statically_decided_branch_leaves_no_conditional() {
    let mut rewriter = rewriter_for(&SIGN_SELECT);
    rewriter.declare_static_param(0).unwrap();
    {
        let rewritten = unsafe { rewriter.rewrite(&[7]).unwrap() };
        let f = unsafe { rewritten.as_fn1() };
        assert_eq!(unsafe { f(0) }, 2);
    }
    let graph = rewriter.captured_graph().unwrap();
    assert_eq!(graph.blocks().len(), 1);
    let has_branch = graph
        .blocks()
        .iter()
        .flat_map(|b| &b.instrs)
        .any(|c| matches!(c.inst.mnemonic, Mnemonic::Jcc | Mnemonic::Cmp));
    assert!(!has_branch);
}

#[test]
fn dynamic_branch_preserves_both_paths() {
    let mut rewriter = rewriter_for(&SIGN_SELECT);
    rewriter.set_param_count(1).unwrap();
    {
        let rewritten = unsafe { rewriter.rewrite(&[7]).unwrap() };
        let f = unsafe { rewritten.as_fn1() };
        assert_eq!(unsafe { f(5) }, 2);
        assert_eq!(unsafe { f(0) }, 1);
        assert_eq!(unsafe { f((-3i64) as u64) }, 1);
    }
    // The two arms end up in separate blocks that share no original addresses.
    let graph = rewriter.captured_graph().unwrap();
    let sets: Vec<std::collections::HashSet<u64>> = graph
        .blocks()
        .iter()
        .map(|b| b.instrs.iter().map(|c| c.inst.address).collect())
        .collect();
    for (i, a) in sets.iter().enumerate() {
        for b in &sets[i + 1..] {
            assert!(a.is_disjoint(b), "blocks overlap in original addresses");
        }
    }
}

#[test]
fn dynamic_loop_executes_correctly() {
    let mut rewriter = rewriter_for(&TRIANGLE);
    rewriter.set_param_count(1).unwrap();
    let rewritten = unsafe { rewriter.rewrite(&[4]).unwrap() };
    let f = unsafe { rewritten.as_fn1() };
    assert_eq!(unsafe { f(1) }, 1);
    assert_eq!(unsafe { f(5) }, 15);
    assert_eq!(unsafe { f(100) }, 5050);
}

#[test]
fn static_loop_unrolls_to_a_constant() {
    let mut rewriter = rewriter_for(&TRIANGLE);
    rewriter.declare_static_param(0).unwrap();
    {
        let rewritten = unsafe { rewriter.rewrite(&[10]).unwrap() };
        let f = unsafe { rewritten.as_fn1() };
        assert_eq!(unsafe { f(0) }, 55);
    }
    let graph = rewriter.captured_graph().unwrap();
    assert_eq!(graph.blocks().len(), 1);
}

#[test]
fn distinct_static_values_produce_distinct_code() {
    let mut rewriter = rewriter_for(&SQUARE_PLUS_5);
    rewriter.declare_static_param(0).unwrap();
    let (first_entry, first_result) = {
        let rewritten = unsafe { rewriter.rewrite(&[9]).unwrap() };
        let f = unsafe { rewritten.as_fn1() };
        (rewritten.entry(), unsafe { f(0) })
    };
    let rewritten = unsafe { rewriter.rewrite(&[4]).unwrap() };
    let f = unsafe { rewritten.as_fn1() };
    assert_ne!(rewritten.entry(), first_entry);
    assert_eq!(first_result, 86);
    assert_eq!(unsafe { f(0) }, 21);
}

#[test]
fn calls_into_a_declared_function_range_are_inlined() {
    let mut rewriter = rewriter_for(&CALL_CHAIN);
    rewriter.set_param_count(1).unwrap();
    rewriter.add_memory_range(MemRange {
        name: "call_chain".into(),
        start: CALL_CHAIN.as_ptr() as u64,
        len: CALL_CHAIN.len() as u64,
        kind: RangeKind::Function,
    });
    {
        let rewritten = unsafe { rewriter.rewrite(&[41]).unwrap() };
        let f = unsafe { rewritten.as_fn1() };
        assert_eq!(unsafe { f(41) }, 42);
        assert_eq!(unsafe { f(7) }, 8);
    }
    let graph = rewriter.captured_graph().unwrap();
    let has_call = graph
        .blocks()
        .iter()
        .flat_map(|b| &b.instrs)
        .any(|c| c.inst.mnemonic == Mnemonic::Call);
    assert!(!has_call, "inlined call must not survive in the capture");
}

#[test]
fn calls_outside_declared_ranges_stay_opaque() {
    let mut rewriter = rewriter_for(&CALL_CHAIN);
    rewriter.set_param_count(1).unwrap();
    // No function range: the callee must be kept as a real call.
    {
        let _rewritten = unsafe { rewriter.rewrite(&[1]).unwrap() };
    }
    let graph = rewriter.captured_graph().unwrap();
    let mnemonics: Vec<Mnemonic> = graph
        .blocks()
        .iter()
        .flat_map(|b| &b.instrs)
        .map(|c| c.inst.mnemonic)
        .collect();
    assert!(mnemonics.contains(&Mnemonic::Call));
    assert!(mnemonics.contains(&Mnemonic::Inc));
    assert!(mnemonics.contains(&Mnemonic::Ret));
}

#[test]
fn constant_table_loads_fold_to_immediates() {
    let table: [u64; 3] = [111, 222, 333];
    // mov rax, [rdi]; ret
    let code: [u8; 4] = [0x48, 0x8b, 0x07, 0xc3];
    let mut rewriter = rewriter_for(&code);
    rewriter.declare_static_param(0).unwrap();
    rewriter.add_memory_range(MemRange {
        name: "table".into(),
        start: table.as_ptr() as u64,
        len: 24,
        kind: RangeKind::ConstData,
    });
    let rewritten = unsafe { rewriter.rewrite(&[table.as_ptr() as u64 + 16]).unwrap() };
    let f = unsafe { rewritten.as_fn1() };
    assert_eq!(unsafe { f(0) }, 333);
}

#[test]
fn assumed_branches_lock_in_the_sampled_path() {
    let mut rewriter = rewriter_for(&SIGN_SELECT);
    rewriter.set_param_count(1).unwrap();
    rewriter.set_assume_known_branches(true);
    let rewritten = unsafe { rewriter.rewrite(&[7]).unwrap() };
    let f = unsafe { rewritten.as_fn1() };
    // The capture run took the positive path; the generated code always takes it.
    assert_eq!(unsafe { f(5) }, 2);
    assert_eq!(unsafe { f(0) }, 2);
}

#[test]
fn capacity_overflow_poisons_and_reset_recovers() {
    let mut rewriter = rewriter_for(&SQUARE_PLUS_5);
    rewriter.set_capture_capacity(2, 64, 4096).unwrap();
    rewriter.set_param_count(1).unwrap();
    let err = unsafe { rewriter.rewrite(&[7]) }.unwrap_err();
    assert!(matches!(err, Error::CaptureOverflow { .. }));
    let poisoned = unsafe { rewriter.rewrite(&[7]) }.unwrap_err();
    assert!(matches!(poisoned, Error::Config(_)));

    rewriter.reset();
    rewriter.set_capture_capacity(2048, 256, 65536).unwrap();
    rewriter.set_target_function(SQUARE_PLUS_5.as_ptr() as u64);
    rewriter.set_param_count(1).unwrap();
    let rewritten = unsafe { rewriter.rewrite(&[7]).unwrap() };
    let f = unsafe { rewritten.as_fn1() };
    assert_eq!(unsafe { f(3) }, 14);
}
