use anyhow::Result;
use aya::include_bytes_aligned;
use clap::Parser;
use tlswatch::{TlsWatchEngine, settings::Settings};

#[derive(Debug, Parser)]
#[command(name = "tlswatch", about = "Trace TLS plaintext of running processes")]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Start with tracing disabled; send SIGUSR1 to enable
    #[clap(long, env = "TLSWATCH_DISABLED")]
    disabled: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "debug" } else { "info" }),
    )
    .init();

    let settings = Settings::new()?;

    // build.rs compiles tlswatch-ebpf and drops the object at $OUT_DIR/tlswatch.
    let engine = TlsWatchEngine::new(
        settings,
        include_bytes_aligned!(concat!(env!("OUT_DIR"), "/tlswatch")),
    )?
    .start_disabled(opt.disabled);

    engine.run().await
}
