//! End-to-end compilation scenarios: whole programs in, assembly out.
//!
//! The assembler/linker boundary is outside this crate, so these tests
//! assert over the emitted text: instruction selection, label structure,
//! data-section contents, and the register-stack discipline (which is
//! asserted internally on every statement during generation).

use std::path::PathBuf;

fn compile(src: &str) -> String {
    zcc::compile_source("test.c", src, Vec::new())
        .unwrap_or_else(|e| panic!("compile failed: {}", e))
}

#[test]
fn arithmetic_precedence() {
    // return 2+3*4  =>  14
    let asm = compile("int main() { return 2 + 3 * 4; }");
    assert!(asm.contains("  imul r11d, r12d"), "\n{}", asm);
    assert!(asm.contains("  add r10d, r11d"), "\n{}", asm);
    assert!(asm.contains("  mov rax, r10"));
    assert!(asm.contains("  jmp .L.return.main"));
}

#[test]
fn recursive_factorial() {
    let asm = compile(
        "int fact(int n) { return n < 2 ? 1 : n * fact(n - 1); }
         int main() { return fact(5); }",
    );
    // The recursive call sits inside fact itself, bracketed by the
    // caller-saved pushes.
    let fact_body = &asm[asm.find("fact:").unwrap()..asm.find("main:").unwrap()];
    assert!(fact_body.contains("  call fact"));
    assert!(fact_body.contains("  push r10"));
    assert!(fact_body.contains(".L.else."));
    // Conditional expression keeps both arms in one register slot.
    assert!(fact_body.contains(".L.end."));
}

#[test]
fn local_array_indexing() {
    let asm = compile(
        "int main() { int a[3]; a[0] = 1; a[1] = 2; a[2] = 3; return a[0] + a[1] + a[2]; }",
    );
    // Indexing goes through an address computed off rbp.
    assert!(asm.contains("  lea r10, [rbp-"), "\n{}", asm);
    // Element size scaling by sizeof(int).
    assert!(asm.contains("  mov r12, 4"), "\n{}", asm);
}

#[test]
fn string_literal_and_printf() {
    let asm = compile(
        "int printf();
         int main() { char *s = \"hi\"; printf(\"%s\\n\", s); return 0; }",
    );
    // "hi" is an anonymous NUL-terminated global.
    assert!(asm.contains(".L.str."));
    assert!(asm.contains("  .byte 104")); // 'h'
    assert!(asm.contains("  .byte 105")); // 'i'
    assert!(asm.contains("  .byte 0"));
    // Variadic call zeroes the vector-arg count and goes through rdi/rsi.
    assert!(asm.contains("  mov rax, 0"));
    assert!(asm.contains("  call printf"));
    assert!(asm.contains("  mov rdi, [rbp-"));
}

#[test]
fn struct_member_access() {
    let asm = compile(
        "struct P { int x, y; };
         int main() { struct P p; p.x = 10; p.y = 32; return p.x + p.y; }",
    );
    // x at offset 0, y at offset 4. Reads compute the member address in
    // the slot the value will occupy; stores compute it one slot higher.
    assert!(asm.contains("  add r10, 0"), "\n{}", asm);
    assert!(asm.contains("  add r11, 4"), "\n{}", asm);
}

#[test]
fn eight_queens_compiles() {
    // The classic backtracking N-queens program; printing 92 solutions
    // once assembled and linked.
    let src = r#"
int printf();

int cnt;

int abs(int x) {
    if (x >= 0)
        return x;
    return -x;
}

int printQueen(int *qn, int bd) {
    int i;
    cnt = cnt + 1;

    printf("%4d:", cnt);
    for (i = 0; i < bd; i = i + 1)
        printf(" %d", qn[i] + 1);
    printf("\n");
}

int check(int *qn, int bd) {
    int i, j;

    for (i = 0; i < bd - 1; i = i + 1)
        for (j = i + 1; j < bd; j = j + 1)
            if ((qn[i] == qn[j]) + (abs(qn[i] - qn[j]) == j - i))
                return 0;
    return 1;
}

int setQueen(int *qn, int i, int bd) {
    int j;

    if (i == bd) {
        if (check(qn, bd))
            printQueen(qn, bd);
        return 0;
    }

    for (j = 0; j < bd; j = j + 1) {
        qn[i] = j;
        setQueen(qn, i + 1, bd);
    }
}

int main() {
    int board = 8;
    int queen[8];

    printf(" num: a b c d e f g h\n");
    printf("----------------------\n");
    setQueen(queen, 0, board);
}
"#;
    let asm = compile(src);
    for label in ["abs:", "printQueen:", "check:", "setQueen:", "main:"] {
        assert!(asm.contains(label), "missing {}", label);
    }
    // cnt is a zero-initialised global in .bss.
    let bss = &asm[asm.find(".bss").unwrap()..asm.find(".data").unwrap()];
    assert!(bss.contains("cnt:"));
    assert!(bss.contains("  .zero 4"));
    // Nested loops produce begin/continue/break label triples.
    assert!(asm.contains(".L.begin."));
    assert!(asm.contains(".L.continue."));
    assert!(asm.contains(".L.break."));
}

#[test]
fn eight_queens_utf8_variant_compiles() {
    let src = r#"
int printf();

int cnt = 0;

static char *face[] = {"A", "B", "C", "D", "E", "F", "G", "H", "I"};

int main() {
    int 🏰 = 8;
    int ♕[8];
    ♕[0] = 🏰;
    printf("%s\n", face[♕[0]]);
    return 0;
}
"#;
    let asm = compile(src);
    // face is a static array of nine string pointers.
    assert!(!asm.contains(".globl face"));
    let quads = asm.matches("  .quad .L.str.").count();
    assert_eq!(quads, 9, "\n{}", asm);
}

#[test]
fn switch_emits_linear_compare_chain() {
    let asm = compile(
        "int main(int argc) {
           switch (argc) {
             case 1: return 10;
             case 2: return 20;
             default: return 0;
           }
         }",
    );
    assert!(asm.contains("  cmp r10d, 1"));
    assert!(asm.contains("  cmp r10d, 2"));
    let case_jumps = asm.matches("  je .L.case.").count();
    assert_eq!(case_jumps, 2);
    assert!(asm.contains("  jmp .L.case."), "default dispatch\n{}", asm);
}

#[test]
fn variadic_function_with_va_start() {
    let src = r#"
typedef struct {
    int gp_offset;
    int fp_offset;
    void *overflow_arg_area;
    void *reg_save_area;
} __va_elem;

typedef __va_elem va_list[1];

int sum2(int n, ...) {
    va_list ap;
    __builtin_va_start(ap);
    return n;
}

int main() { return sum2(1, 2, 3); }
"#;
    let asm = compile(src);
    // The variadic save area fills rbp-80..-40 in the prologue.
    assert!(asm.contains("  mov [rbp-80], rdi"));
    assert!(asm.contains("  mov [rbp-40], r9"));
    // va_start writes gp_offset (one named gp parameter => 8) and the
    // two area pointers.
    assert!(asm.contains("  mov dword ptr [r10], 8"), "\n{}", asm);
    assert!(asm.contains("  lea rax, [rbp+16]"));
    assert!(asm.contains("  lea rax, [rbp-80]"));
}

#[test]
fn float_arithmetic_and_conversion() {
    let asm = compile(
        "int main() { double d; d = 1.5; d = d + 2.5; return (int)d; }",
    );
    assert!(asm.contains("  movq xmm8, rax"), "\n{}", asm);
    assert!(asm.contains("  addsd xmm8, xmm9"));
    assert!(asm.contains("  cvttsd2si r10d, xmm8"));
    assert!(asm.contains("  movsd [r10], xmm8") || asm.contains("  movsd [r11], xmm8"));
}

#[test]
fn unsigned_division_uses_div() {
    let asm = compile("int main() { unsigned int a; a = 10; return a / 3; }");
    assert!(asm.contains("  div "), "\n{}", asm);
    assert!(!asm.contains("  idiv "), "\n{}", asm);
}

#[test]
fn signed_division_uses_idiv() {
    let asm = compile("int main() { int a; a = 10; return a / 3; }");
    assert!(asm.contains("  cdq"));
    assert!(asm.contains("  idiv "));
}

#[test]
fn shifts_pick_arithmetic_or_logical() {
    let asm = compile("int main() { int a; a = -8; return a >> 1; }");
    assert!(asm.contains("  sar "), "\n{}", asm);

    let asm = compile("int main() { unsigned int a; a = 8; return a >> 1; }");
    assert!(asm.contains("  shr "), "\n{}", asm);
}

#[test]
fn logical_operators_short_circuit() {
    let asm = compile("int f(); int main() { return 0 && f(); }");
    // f is never reached when the left side is false: the branch jumps
    // past the call.
    let and_part = &asm[asm.find("main:").unwrap()..];
    let je = and_part.find("  je .L.false.").unwrap();
    let call = and_part.find("  call f").unwrap();
    assert!(je < call);
}

#[test]
fn goto_labels_are_function_scoped() {
    let asm = compile(
        "int main() { goto done; done: return 1; }
         int other() { done: return 2; }",
    );
    assert!(asm.contains(".L.label.main.done:"));
    assert!(asm.contains(".L.label.other.done:"));
}

#[test]
fn include_search_path_via_api() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("answer.h"),
        "#define ANSWER 42\n",
    )
    .unwrap();
    let main_c = dir.path().join("main.c");
    std::fs::write(&main_c, "#include <answer.h>\nint main() { return ANSWER; }\n").unwrap();

    let asm = zcc::compile_file(
        main_c.to_str().unwrap(),
        vec![PathBuf::from(dir.path())],
    )
    .unwrap();
    assert!(asm.contains("  mov r10, 42"));
    // Both files appear in the .file table.
    assert!(asm.contains(".file 1 "));
    assert!(asm.contains(".file 2 "));
}

#[test]
fn preprocess_only_mode() {
    let dir = tempfile::tempdir().unwrap();
    let main_c = dir.path().join("main.c");
    std::fs::write(&main_c, "#define X 1\nint a = X;\nint b;\n").unwrap();

    let text = zcc::preprocess_file(main_c.to_str().unwrap(), Vec::new()).unwrap();
    assert_eq!(text, "int a = 1;\nint b;\n");
}

#[test]
fn deep_expression_overflows_register_stack() {
    // Depth 7 exceeds the six-register expression stack.
    let err = zcc::compile_source(
        "deep.c",
        "int main() { return 1+(2+(3+(4+(5+(6+(7+8)))))); }",
        Vec::new(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("register out of range"));
}

#[test]
fn stray_break_is_codegen_error() {
    let err = zcc::compile_source("b.c", "int main() { break; return 0; }", Vec::new())
        .unwrap_err();
    assert!(err.to_string().contains("stray break"));
}

#[test]
fn frame_offsets_respect_alignment() {
    // char then long: the long must land on an 8-byte boundary past the
    // 32-byte callee-saved area.
    let asm = compile("int main() { char c; long l; c = 1; l = 2; return l; }");
    assert!(asm.contains("[rbp-33]"), "char slot\n{}", asm);
    assert!(asm.contains("[rbp-48]"), "aligned long slot\n{}", asm);
}

#[test]
fn bool_return_masks_high_bits() {
    let asm = compile(
        "_Bool flag(); int main() { return flag(); }",
    );
    assert!(asm.contains("  movzx eax, al"));
}
