//! End-to-end tests: run the compiler binary over the MIR fixtures and
//! check the emitted assembly for the fragments each scenario pins down.

use assert_cmd::Command;
use predicates::prelude::*;

fn compile(fixture: &str) -> String {
    let output = Command::cargo_bin("brook")
        .unwrap()
        .arg(format!("tests/data/{fixture}"))
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "compiling {fixture} failed:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn constant_return() {
    let asm = compile("ret42.mir");
    assert!(asm.contains("mov\tw0, #42"), "{asm}");
    assert!(asm.contains("\tret"), "{asm}");
}

#[test]
fn add_two_parameters() {
    let asm = compile("add.mir");
    assert!(asm.contains("add\tw0, w0, w1"), "{asm}");
    assert!(asm.contains("\tret"), "{asm}");
    // a leaf with no locals needs no frame
    assert!(!asm.contains("sub\tsp"), "{asm}");
}

#[test]
fn counting_loop() {
    let asm = compile("sum.mir");
    // one compare plus conditional branch per iteration
    assert!(asm.contains("cmp\t"), "{asm}");
    assert!(asm.contains("b.lt\t.Lsum_body"), "{asm}");
    assert!(asm.contains("b\t.Lsum_done"), "{asm}");
    assert!(asm.contains("b\t.Lsum_cond"), "{asm}");
    // the final result is read back into the return register
    assert!(asm.contains("ldr\tw0, [sp"), "{asm}");
}

#[test]
fn struct_by_value_parameter() {
    let asm = compile("getx.mir");
    // two 32-bit parameter chunks stored to the frame
    assert!(asm.contains("str\tw0, [sp, #0]"), "{asm}");
    assert!(asm.contains("str\tw1, [sp, #4]"), "{asm}");
    // the first member comes back out for the return value
    assert!(asm.contains("ldr\tw0"), "{asm}");
}

#[test]
fn global_array_indexing() {
    let asm = compile("global_index.mir");
    assert!(asm.contains("adrp\t"), "{asm}");
    assert!(asm.contains(":lo12:a"), "{asm}");
    // index scaled by the element size
    assert!(asm.contains("mov\tx"), "{asm}");
    assert!(asm.contains("mul\t"), "{asm}");
    assert!(asm.contains("ldr\tw0"), "{asm}");
    // the array itself lands in .data
    assert!(asm.contains(".zero\t16"), "{asm}");
}

#[test]
fn call_result_spills_to_stack() {
    let asm = compile("call_spill.mir");
    assert!(asm.contains("bl\tc"), "{asm}");
    // x0 spilled right after the call, read back for the store
    assert!(asm.contains("str\tx0, [sp"), "{asm}");
    assert!(asm.contains("ldr\tx"), "{asm}");
    // calls force the link register save
    assert!(asm.contains("str\tx30"), "{asm}");
    assert!(asm.contains("ldr\tx30"), "{asm}");
}

#[test]
fn nested_if_branch_targets() {
    let asm = compile("nested_if.mir");
    assert!(asm.contains("b.gt\t.Lpick_agtb"), "{asm}");
    assert!(asm.contains("b\t.Lpick_aleb"), "{asm}");
    assert!(asm.contains("b.eq\t.Lpick_ten"), "{asm}");
    assert!(asm.contains("b\t.Lpick_nota"), "{asm}");
}

#[test]
fn missing_input_fails_with_diagnostic() {
    Command::cargo_bin("brook")
        .unwrap()
        .arg("tests/data/nope.mir")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn parse_errors_name_the_line() {
    Command::cargo_bin("brook")
        .unwrap()
        .arg("tests/data/bad.mir")
        .assert()
        .failure()
        .stderr(predicate::str::contains("bad.mir:3"))
        .stderr(predicate::str::contains("%undefined"));
}

#[test]
fn mir_dump_stops_before_codegen() {
    Command::cargo_bin("brook")
        .unwrap()
        .args(["-e", "mir", "tests/data/add.mir"])
        .assert()
        .success()
        .stdout(predicate::str::contains("func"));
}

#[test]
fn llir_dump_shows_virtual_registers() {
    Command::cargo_bin("brook")
        .unwrap()
        .args(["-e", "llir", "tests/data/add.mir"])
        .assert()
        .success()
        .stdout(predicate::str::contains("entry:"));
}

#[test]
fn output_file_is_written() {
    let dir = std::env::temp_dir().join("brook-cli-test");
    std::fs::create_dir_all(&dir).unwrap();
    let out = dir.join("add.s");

    Command::cargo_bin("brook")
        .unwrap()
        .args(["-o", out.to_str().unwrap(), "tests/data/add.mir"])
        .assert()
        .success();

    let asm = std::fs::read_to_string(&out).unwrap();
    assert!(asm.contains("add\tw0, w0, w1"), "{asm}");
}
