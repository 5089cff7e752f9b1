pub(crate) use anyhow::Context;
pub use anyhow::Error;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Prints the supplied error to stderr as a single line, then exits with a non-zero status.
/// Errors carry context chains ("while reading `foo.o`: ...") which `{:#}` renders inline.
pub fn report_error_and_exit(error: &Error) -> ! {
    eprintln!("fleet: error: {error:#}");
    std::process::exit(1);
}
