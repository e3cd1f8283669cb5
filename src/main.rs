/// To build distributable binary:
/// ```
/// rustup target add x86_64-unknown-linux-musl
/// cargo build --release --target=x86_64-unknown-linux-musl
/// ```
use eyre::Result;
use tpm_keyseal::cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::new();
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    cli.run()?;
    Ok(())
}
