//! Printer/parser round-trip: a printed module parses back into a module
//! that prints identically.

use squanchy::write::module_to_string;

const FIXTURE: &str = r#"
module roundtrip
target x86_64-unknown-linux-gnu

type %mem = struct { ptr, i64, [4 x i8] }
type %outer = struct { %mem, i32 }

global const @size : i32 = 56
weak global @scratch : bytes 8 = zero
global @blob : bytes 4 = "00c0ffee"
global @external : i64

declare @calloc(i64, i64) -> ptr allocator
declare @barrier() asm

function @helper(ptr, i32) -> i32 alwaysinline {
block0(v0: ptr, v1: i32):
    v2 = load.ptr v0+8
    v3 = uextend.i64 v1
    v4 = iadd v2, v3
    v5 = load.i32 v4-4
    return v5
}

local function @main(i32) -> i32 {
    ss0 = stack_slot 16
block0(v0: i32):
    v1 = stack_addr ss0+8
    v2 = iconst.i32 0
    store.i32 v2, v1
    v3 = icmp ult v0, v2
    brif v3, block1(v0), block2
block1(v4: i32):
    v5 = global_addr @size
    v6 = call @helper(v5, v4)
    v7 = select v3, v6, v4
    jump block3(v7)
block2:
    v8 = iconst.i32 3
    v9 = urem v0, v8
    br_table v9, block3(v9), [block1(v9), block2]
block3(v10: i32):
    v11 = bnot v10
    v12 = ineg v11
    v13 = sextend.i64 v12
    v14 = ireduce.i32 v13
    return v14
}
"#;

#[test]
fn print_parse_print_is_stable() {
    let module = squanchy::parser::parse_module(FIXTURE).expect("fixture parses");
    let first = module_to_string(&module);
    let reparsed = squanchy::parser::parse_module(&first)
        .unwrap_or_else(|e| panic!("printed module must reparse: {e}\n{first}"));
    let second = module_to_string(&reparsed);
    assert_eq!(first, second);
}

#[test]
fn runtime_blob_roundtrips() {
    let module = squanchy::runtime::bundled();
    let first = module_to_string(&module);
    let reparsed = squanchy::parser::parse_module(&first).expect("blob reparses");
    assert_eq!(first, module_to_string(&reparsed));
}
