//! A handwritten parser for our arguments.
//!
//! We don't use a 3rd party library like clap because we need to parse arguments the same way as
//! the other linkers on the platform we're targeting. In particular, long arguments need to be
//! accepted with a single '-' in addition to the more common double-dash, and library inputs
//! (`-lfoo`) are positional with respect to regular file inputs.

use crate::bail;
use crate::error::Result;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug)]
pub struct Args {
    pub(crate) inputs: Vec<Input>,
    pub(crate) output: PathBuf,
    pub(crate) lib_search_path: Vec<PathBuf>,
    pub(crate) is_static: bool,
    pub(crate) print_map: bool,
    pub(crate) trace_symbols: Vec<String>,
    pub(crate) entry: String,
    pub(crate) time_phases: bool,
    pub num_threads: Option<NonZeroUsize>,
}

/// A positional input to the link: either a path given directly or a library to be located via
/// the search path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Input {
    File(PathBuf),
    Lib(String),
}

pub(crate) const DEFAULT_ENTRY: &str = "_start";

impl Default for Args {
    fn default() -> Self {
        Args {
            inputs: Vec::new(),
            output: PathBuf::from("a.out"),
            lib_search_path: Vec::new(),
            is_static: false,
            print_map: false,
            trace_symbols: Vec::new(),
            entry: DEFAULT_ENTRY.to_owned(),
            time_phases: false,
            num_threads: None,
        }
    }
}

pub(crate) fn parse<S: AsRef<str>, I: Iterator<Item = S>>(mut input: I) -> Result<Args> {
    let mut args = Args::default();

    while let Some(arg) = input.next() {
        let arg = arg.as_ref();

        let mut handle_with_value = |long: &str, short: Option<&str>| -> Result<Option<String>> {
            if let Some(rest) = strip_option(arg) {
                if rest == long {
                    let Some(value) = input.next() else {
                        bail!("Missing value for argument `{arg}`");
                    };
                    return Ok(Some(value.as_ref().to_owned()));
                }
                if let Some(value) = rest.strip_prefix(long).and_then(|r| r.strip_prefix('=')) {
                    return Ok(Some(value.to_owned()));
                }
            }
            if let Some(short) = short {
                if let Some(rest) = arg.strip_prefix('-').and_then(|r| r.strip_prefix(short)) {
                    if rest.is_empty() {
                        let Some(value) = input.next() else {
                            bail!("Missing value for argument `{arg}`");
                        };
                        return Ok(Some(value.as_ref().to_owned()));
                    }
                    return Ok(Some(rest.to_owned()));
                }
            }
            Ok(None)
        };

        if let Some(value) = handle_with_value("output", Some("o"))? {
            args.output = PathBuf::from(value);
        } else if let Some(value) = handle_with_value("library-path", Some("L"))? {
            args.lib_search_path.push(PathBuf::from(value));
        } else if let Some(value) = handle_with_value("library", Some("l"))? {
            args.inputs.push(Input::Lib(value));
        } else if let Some(value) = handle_with_value("trace-symbol", Some("y"))? {
            args.trace_symbols.push(value);
        } else if let Some(value) = handle_with_value("entry", Some("e"))? {
            args.entry = value;
        } else if let Some(value) = handle_with_value("threads", None)? {
            args.num_threads = Some(value.parse()?);
        } else if matches!(strip_option(arg), Some("static" | "Bstatic")) {
            args.is_static = true;
        } else if strip_option(arg) == Some("print-map") {
            args.print_map = true;
        } else if strip_option(arg) == Some("time") {
            args.time_phases = true;
        } else if arg.starts_with('-') && arg.len() > 1 {
            bail!("unrecognized option `{arg}`");
        } else {
            args.inputs.push(Input::File(PathBuf::from(arg)));
        }
    }

    if args.inputs.is_empty() {
        bail!("no input files");
    }

    Ok(args)
}

impl Args {
    pub fn parse<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Args> {
        parse(input)
    }

    pub(crate) fn setup_thread_pool(&self) -> Result {
        if let Some(num_threads) = self.num_threads {
            // Building the global pool fails if it has already been initialised, which happens
            // when we're called more than once in the same process (e.g. from tests). The first
            // configuration wins in that case.
            let _ = rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads.get())
                .build_global();
        }
        Ok(())
    }

    pub(crate) fn should_trace(&self, name: &[u8]) -> bool {
        !self.trace_symbols.is_empty()
            && self.trace_symbols.iter().any(|t| t.as_bytes() == name)
    }
}

fn strip_option(arg: &str) -> Option<&str> {
    arg.strip_prefix("--").or(arg.strip_prefix('-'))
}

pub(crate) fn search_for_lib(args: &Args, name: &str) -> Result<PathBuf> {
    let filename = format!("lib{name}.a");
    for dir in &args.lib_search_path {
        let path = dir.join(&filename);
        if path.exists() {
            return Ok(path);
        }
    }
    bail!("Couldn't find library `-l{name}` on search path");
}

pub(crate) fn display_input(path: &Path, archive_entry: Option<&[u8]>) -> String {
    match archive_entry {
        Some(entry) => format!("{}({})", path.display(), String::from_utf8_lossy(entry)),
        None => path.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(args: &[&str]) -> Args {
        Args::parse(args.iter()).unwrap()
    }

    #[test]
    fn basic_invocation() {
        let args = parse_ok(&["-o", "out", "a.o", "b.o"]);
        assert_eq!(args.output, PathBuf::from("out"));
        assert_eq!(
            args.inputs,
            vec![
                Input::File(PathBuf::from("a.o")),
                Input::File(PathBuf::from("b.o"))
            ]
        );
    }

    #[test]
    fn library_flags() {
        let args = parse_ok(&["a.o", "-L/usr/lib", "-lc", "-o", "prog"]);
        assert_eq!(args.lib_search_path, vec![PathBuf::from("/usr/lib")]);
        assert_eq!(args.inputs[1], Input::Lib("c".to_owned()));
    }

    #[test]
    fn long_options_with_single_dash() {
        let args = parse_ok(&["-static", "-print-map", "-trace-symbol", "main", "a.o"]);
        assert!(args.is_static);
        assert!(args.print_map);
        assert_eq!(args.trace_symbols, vec!["main".to_owned()]);
    }

    #[test]
    fn equals_form() {
        let args = parse_ok(&["--entry=begin", "--threads=2", "a.o"]);
        assert_eq!(args.entry, "begin");
        assert_eq!(args.num_threads, NonZeroUsize::new(2));
    }

    #[test]
    fn unknown_option_is_an_error() {
        assert!(Args::parse(["--frobnicate", "a.o"].iter()).is_err());
    }

    #[test]
    fn no_inputs_is_an_error() {
        assert!(Args::parse(["-o", "out"].iter()).is_err());
    }
}
