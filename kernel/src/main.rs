//! The queso binary: boot the kernel and run a shell program.
//!
//! ```text
//! queso [-l] [-m PAGES] [-s SEED] [-i FILE] -x PROGRAM [ARGS...]
//! ```
//!
//! Arguments after `-x` belong to the program until the next token that
//! starts with `-`. `-l` selects the lottery policy, `-m` the number of
//! physical pages, `-s` the draw seed, `-i` a file fed to console input.

use std::{env, fs, io::Write as _, process::ExitCode};

use anyhow::{Context as _, bail};
use queso_kernel::{Kernel, KernelConfig, SchedPolicy, progs};

struct BootArgs {
    config: KernelConfig,
    program: Option<String>,
    args: Vec<String>,
}

fn parse_args(argv: impl Iterator<Item = String>) -> Result<BootArgs, anyhow::Error> {
    let mut boot = BootArgs {
        config: KernelConfig::default(),
        program: None,
        args: Vec::new(),
    };

    let mut argv = argv.peekable();
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "-l" => boot.config.policy = SchedPolicy::Lottery,
            "-m" => {
                let pages = argv.next().context("-m needs a page count")?;
                boot.config.machine.phys_pages = pages
                    .parse()
                    .with_context(|| format!("bad page count {pages}"))?;
            }
            "-s" => {
                let seed = argv.next().context("-s needs a seed")?;
                boot.config.machine.seed =
                    seed.parse().with_context(|| format!("bad seed {seed}"))?;
            }
            "-i" => {
                let path = argv.next().context("-i needs a file")?;
                boot.config.machine.console_input =
                    fs::read(&path).with_context(|| format!("reading {path}"))?;
            }
            "-x" => {
                boot.program = Some(argv.next().context("-x needs a program name")?);
                while argv.peek().is_some_and(|a| !a.starts_with('-')) {
                    boot.args.push(argv.next().unwrap());
                }
            }
            other => bail!("unknown flag {other}"),
        }
    }
    Ok(boot)
}

fn main() -> ExitCode {
    env_logger::init();

    let boot = match parse_args(env::args().skip(1)) {
        Ok(boot) => boot,
        Err(e) => {
            eprintln!("queso: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    let Some(program) = boot.program else {
        eprintln!("queso: nothing to run; pass -x PROGRAM [ARGS...]");
        return ExitCode::FAILURE;
    };

    let kernel = Kernel::start(&boot.config);
    progs::install(kernel.machine());
    kernel.run_program(&program, &boot.args);

    let output = kernel.machine().console().take_output();
    std::io::stdout().write_all(&output).expect("writing stdout");
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &[&str]) -> impl Iterator<Item = String> {
        s.iter().map(|&a| a.to_owned()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn shell_args_stop_at_the_next_flag() {
        let boot = parse_args(args(&["-x", "echo", "a", "b", "-m", "64"])).unwrap();
        assert_eq!(boot.program.as_deref(), Some("echo"));
        assert_eq!(boot.args, ["a", "b"]);
        assert_eq!(boot.config.machine.phys_pages, 64);
    }

    #[test]
    fn lottery_flag_selects_the_policy() {
        let boot = parse_args(args(&["-l", "-x", "halt"])).unwrap();
        assert_eq!(boot.config.policy, SchedPolicy::Lottery);
        assert!(boot.args.is_empty());
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(parse_args(args(&["-q"])).is_err());
    }
}
