fn main() {
    if let Err(error) = run() {
        libfleet::error::report_error_and_exit(&error);
    }
}

fn run() -> libfleet::error::Result {
    let linker = libfleet::Linker::from_args(std::env::args().skip(1))?;
    linker.run()
}
