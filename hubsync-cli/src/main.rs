//! Entry point for the command-line interface.
#![forbid(unsafe_code)]

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = hubsync_cli::run() {
        eprintln!("hubsync: {err}");
        std::process::exit(1);
    }
}
