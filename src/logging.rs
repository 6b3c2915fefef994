use anyhow::Result;
use tracing::Level;
use tracing_subscriber::fmt;

/// Stage progress goes to stderr at info; `verbose` adds per-block and
/// per-request detail along with event targets.
pub fn init(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    // a second init (tests, embedding callers) keeps the existing subscriber
    let _ = fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .try_init();
    Ok(())
}
