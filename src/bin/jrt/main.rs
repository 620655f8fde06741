use anyhow::{Context, Result};
use jrt::{Runtime, RuntimeOption, runtime::LogVerbosity};
use tracing_subscriber::EnvFilter;

fn init_logging(args: &[String]) {
    let verbosity = args
        .iter()
        .filter_map(|arg| arg.strip_prefix("-verbose:"))
        .filter_map(LogVerbosity::parse_tags)
        .fold(LogVerbosity::empty(), |acc, tags| acc | tags);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(verbosity.env_filter_directives())),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let (dump_flags, args): (Vec<String>, Vec<String>) =
        std::env::args().skip(1).partition(|arg| arg == "--dump");
    init_logging(&args);

    let options: Vec<RuntimeOption> = args.into_iter().map(RuntimeOption::from).collect();
    let runtime = Runtime::create(&options, false).context("failed to create runtime")?;
    runtime.start().context("failed to start runtime")?;

    if !dump_flags.is_empty() {
        let mut dump = String::new();
        runtime.dump_for_sig_quit(&mut dump)?;
        print!("{dump}");
    }

    runtime.detach_current_thread()?;
    runtime.shutdown();
    Ok(())
}
