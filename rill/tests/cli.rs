use std::io::Write;
use std::process::{Command, Stdio};

fn interp() -> Command {
    Command::new(env!("CARGO_BIN_EXE_interp"))
}

fn write_script(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write script");
    file
}

#[test]
fn runs_a_script_file_and_prints() {
    let script = write_script(
        "let s = 0;\n\
         for (let i = 0; i < 100; i = i + 1) { s = s + i; }\n\
         disp s;\n",
    );
    let output = interp()
        .arg(script.path())
        .output()
        .expect("run interpreter");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "4950");
}

#[test]
fn reads_a_program_from_stdin() {
    let mut child = interp()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn interpreter");
    child
        .stdin
        .as_mut()
        .expect("stdin")
        .write_all(b"disp 1 + 2;\n")
        .expect("write stdin");
    let output = child.wait_with_output().expect("wait");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "3");
}

#[test]
fn integer_return_becomes_the_exit_code() {
    let script = write_script("return 7;\n");
    let status = interp().arg(script.path()).status().expect("run");
    assert_eq!(status.code(), Some(7));
}

#[test]
fn falsy_final_value_exits_nonzero() {
    let script = write_script("return false;\n");
    let status = interp().arg(script.path()).status().expect("run");
    assert_eq!(status.code(), Some(1));

    let script = write_script("return true;\n");
    let status = interp().arg(script.path()).status().expect("run");
    assert_eq!(status.code(), Some(0));
}

#[test]
fn parse_errors_are_reported_and_exit_nonzero() {
    let script = write_script("let x = ;\n");
    let output = interp().arg(script.path()).output().expect("run");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error"));
}

#[test]
fn runtime_errors_exit_nonzero() {
    let script = write_script("let z = 0;\ndisp 1 / z;\n");
    let output = interp().arg(script.path()).output().expect("run");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Division by zero"));
}

#[test]
fn missing_file_is_an_error() {
    let status = interp()
        .arg("does-not-exist.rill")
        .status()
        .expect("run");
    assert_eq!(status.code(), Some(1));
}

#[test]
fn disasm_flag_prints_a_listing() {
    let script = write_script("let x = 1;\n");
    let output = interp()
        .arg("--disasm")
        .arg(script.path())
        .output()
        .expect("run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("$main"));
    assert!(stdout.contains("DefineGlobal"));
}

#[test]
fn seeded_runs_are_reproducible() {
    let script = write_script(
        "let a = pipe(1);\n\
         let b = pipe(1);\n\
         a <- 1;\n\
         b <- 2;\n\
         select {\n\
             v <- a => disp v;\n\
             v <- b => disp v;\n\
         }\n",
    );
    let run = |seed: &str| {
        let output = interp()
            .arg("--seed")
            .arg(seed)
            .arg(script.path())
            .output()
            .expect("run");
        String::from_utf8_lossy(&output.stdout).into_owned()
    };
    assert_eq!(run("99"), run("99"));
}

#[test]
fn concurrent_script_end_to_end() {
    let script = write_script(
        "let ch = pipe(0);\n\
         let h = spawn { return <-ch; };\n\
         ch <- 99;\n\
         disp h.join();\n",
    );
    let output = interp().arg(script.path()).output().expect("run");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "99");
}
