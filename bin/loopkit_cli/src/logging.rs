use env_logger::{Env, Target};

/// Log to stderr at `info` (`debug` when verbose). `RUST_LOG` wins over both.
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default))
        .target(Target::Stderr)
        .format_timestamp(None)
        .init();
}
