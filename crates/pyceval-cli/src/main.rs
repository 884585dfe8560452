use std::{env, fs, process::ExitCode, thread, time::Instant};

use pyceval::{
    Code, DEFAULT_MAX_RECURSION_DEPTH, LimitedTracker, NoopTracer, ProfilingTracer, ResourceLimits, Runner,
    StderrTracer, StdPrint, VmTracer,
};

/// Frames recurse on the native stack, so evaluation runs on a thread with room for deep Python recursion.
const EVAL_STACK_SIZE: usize = 256 * 1024 * 1024;

const USAGE: &str = "usage:
  pyceval run <file> [--trace] [--profile] [--max-recursion N]
  pyceval dis <file>";

#[derive(Debug)]
enum Command {
    Run {
        path: String,
        trace: bool,
        profile: bool,
        max_recursion: usize,
    },
    Dis {
        path: String,
    },
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("error: {err}\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    let handle = thread::Builder::new()
        .name("pyceval-eval".to_owned())
        .stack_size(EVAL_STACK_SIZE)
        .spawn(move || execute(command));
    match handle.map(thread::JoinHandle::join) {
        Ok(Ok(code)) => code,
        Ok(Err(_)) => {
            eprintln!("error: evaluation thread panicked");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("error: failed to spawn evaluation thread: {err}");
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut args = args.iter();
    let sub = args.next().ok_or("missing command")?;
    match sub.as_str() {
        "dis" => {
            let path = args.next().ok_or("missing file")?.clone();
            if let Some(extra) = args.next() {
                return Err(format!("unexpected argument '{extra}'"));
            }
            Ok(Command::Dis { path })
        }
        "run" => {
            let mut path = None;
            let mut trace = false;
            let mut profile = false;
            let mut max_recursion = DEFAULT_MAX_RECURSION_DEPTH;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--trace" => trace = true,
                    "--profile" => profile = true,
                    "--max-recursion" => {
                        let value = args.next().ok_or("--max-recursion needs a value")?;
                        max_recursion = value
                            .parse()
                            .map_err(|_| format!("invalid --max-recursion value '{value}'"))?;
                    }
                    flag if flag.starts_with("--") => return Err(format!("unknown flag '{flag}'")),
                    file if path.is_none() => path = Some(file.to_owned()),
                    extra => return Err(format!("unexpected argument '{extra}'")),
                }
            }
            Ok(Command::Run {
                path: path.ok_or("missing file")?,
                trace,
                profile,
                max_recursion,
            })
        }
        other => Err(format!("unknown command '{other}'")),
    }
}

fn execute(command: Command) -> ExitCode {
    match command {
        Command::Dis { path } => match read_code(&path) {
            Ok(code) => {
                print!("{}", code.disassemble());
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("error: {err}");
                ExitCode::FAILURE
            }
        },
        Command::Run {
            path,
            trace,
            profile,
            max_recursion,
        } => {
            let code = match read_code(&path) {
                Ok(code) => code,
                Err(err) => {
                    eprintln!("error: {err}");
                    return ExitCode::FAILURE;
                }
            };
            let runner = Runner::new(code);
            let limits = ResourceLimits::new().max_recursion_depth(Some(max_recursion));
            if profile {
                let mut tracer = ProfilingTracer::new();
                let exit = run(&runner, limits, &mut tracer);
                eprintln!("{}", tracer.report());
                exit
            } else if trace {
                run(&runner, limits, &mut StderrTracer::new())
            } else {
                run(&runner, limits, &mut NoopTracer)
            }
        }
    }
}

fn run(runner: &Runner, limits: ResourceLimits, tracer: &mut impl VmTracer) -> ExitCode {
    let start = Instant::now();
    let result = runner.run(LimitedTracker::new(limits), &mut StdPrint, tracer, None);
    let elapsed = start.elapsed();
    match result {
        Ok(value) => {
            eprintln!("success after: {elapsed:?}");
            println!("{}", value.py_repr());
            ExitCode::SUCCESS
        }
        Err(exc) => {
            eprintln!("error after: {elapsed:?}\n{exc}");
            ExitCode::FAILURE
        }
    }
}

fn read_code(path: &str) -> Result<Code, String> {
    let bytes = fs::read(path).map_err(|err| format!("reading {path}: {err}"))?;
    Code::from_bytes(&bytes).map_err(|err| format!("{path} is not a serialized code object: {err}"))
}

#[cfg(test)]
mod tests {
    use super::{Command, parse_args};

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn run_flags_parse() {
        let Command::Run {
            path,
            trace,
            profile,
            max_recursion,
        } = parse_args(&args(&["run", "m.pyc", "--profile", "--max-recursion", "50"])).unwrap()
        else {
            panic!("expected run command");
        };
        assert_eq!(path, "m.pyc");
        assert!(!trace);
        assert!(profile);
        assert_eq!(max_recursion, 50);
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["run"])).is_err());
        assert!(parse_args(&args(&["run", "a", "b"])).is_err());
        assert!(parse_args(&args(&["run", "a", "--max-recursion", "x"])).is_err());
        assert!(parse_args(&args(&["dis", "a", "--trace"])).is_err());
        assert!(parse_args(&args(&["compile", "a"])).is_err());
    }
}
