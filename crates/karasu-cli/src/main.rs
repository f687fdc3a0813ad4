//! Command line front end: run a script file or a `-c` snippet.

use std::env;
use std::fs;
use std::path::Path;
use std::process::ExitCode;

use karasu::Interpreter;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let (source, filename) = match parse_args(&args) {
        Ok(input) => input,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let mut interp = Interpreter::new();
    match interp.interpret_entry(&source, &filename) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String]) -> Result<(String, String), String> {
    match args {
        [flag, code] if flag == "-c" => Ok((code.clone(), "<input>".to_owned())),
        [path] => {
            let file = Path::new(path);
            if !file.is_file() {
                return Err(format!("error: {path} is not a file"));
            }
            let source = fs::read_to_string(file).map_err(|err| format!("error reading {path}: {err}"))?;
            Ok((source, path.clone()))
        }
        _ => Err("usage: karasu <script> | karasu -c <code>".to_owned()),
    }
}
