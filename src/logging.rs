use tracing_subscriber::EnvFilter;

/// Install the stderr log subscriber.
///
/// `RUST_LOG` wins when set; otherwise `-v` raises the level to debug and `-vv` to trace.
pub fn init(verbose: u8) {
    let default_level = match verbose {
        0 => "stock_analysis=warn",
        1 => "stock_analysis=debug",
        _ => "stock_analysis=trace,reqwest=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
