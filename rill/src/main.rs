use std::env;
use std::fs;
use std::io::Read;
use std::process;

use rillc::{compile, parse};
use rillrt::{Value, Vm};

struct Options {
    file: Option<String>,
    disasm: bool,
    trace_vm: bool,
    trace_thread: bool,
    seed: Option<u64>,
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let options = match parse_args(&args[1..]) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{}", message);
            print_usage();
            process::exit(1);
        }
    };

    let (source, name) = match &options.file {
        Some(path) => match fs::read_to_string(path) {
            Ok(source) => (source, path.clone()),
            Err(err) => {
                eprintln!("Error: could not open file {}: {}", path, err);
                process::exit(1);
            }
        },
        None => {
            let mut source = String::new();
            if let Err(err) = std::io::stdin().read_to_string(&mut source) {
                eprintln!("Error: could not read stdin: {}", err);
                process::exit(1);
            }
            (source, "<stdin>".to_string())
        }
    };

    process::exit(run(&source, &name, &options));
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        file: None,
        disasm: false,
        trace_vm: false,
        trace_thread: false,
        seed: None,
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--disasm" => options.disasm = true,
            "--trace-vm" => options.trace_vm = true,
            "--trace-thread" => options.trace_thread = true,
            "--seed" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "--seed requires a value".to_string())?;
                options.seed = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| format!("Invalid seed: {}", value))?,
                );
            }
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            _ if arg.starts_with('-') => {
                return Err(format!("Unknown flag: {}", arg));
            }
            _ => {
                if options.file.is_some() {
                    return Err("Only one source file may be given".to_string());
                }
                options.file = Some(arg.clone());
            }
        }
    }
    Ok(options)
}

fn run(source: &str, name: &str, options: &Options) -> i32 {
    let statements = match parse(source) {
        Ok(statements) => statements,
        Err(diagnostics) => {
            for diagnostic in diagnostics {
                eprintln!("{}", diagnostic.with_source_name(name));
            }
            return 1;
        }
    };

    let program = match compile(&statements) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("Compile error: {}", err);
            return 1;
        }
    };

    if options.disasm {
        println!("{}", program.disassemble());
    }

    let mut vm = Vm::new(options.trace_vm, options.trace_thread);
    if let Some(seed) = options.seed {
        vm.seed_rng(seed);
    }

    match vm.interpret(&program) {
        Ok(Value::Null) => 0,
        Ok(Value::Int(code)) => code.rem_euclid(256) as i32,
        Ok(value) => {
            if value.is_truthy() {
                0
            } else {
                1
            }
        }
        Err(err) => {
            eprintln!("Runtime error: {}", err);
            1
        }
    }
}

fn print_usage() {
    eprintln!(
        "Usage: interp [source-file] [--disasm] [--trace-vm] [--trace-thread] [--seed N]"
    );
}
