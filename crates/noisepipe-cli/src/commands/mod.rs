pub mod devices;
pub mod info;
pub mod serve;

/// Print an error and exit non-zero.
pub fn fail(context: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("Error: {context}: {err}");
    std::process::exit(1);
}
