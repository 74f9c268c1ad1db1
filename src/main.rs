fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    if std::env::args_os().count() > 1 {
        eprintln!("sandals: does not accept arguments");
        std::process::exit(libc::EXIT_FAILURE);
    }
    std::process::exit(sandals::run());
}
