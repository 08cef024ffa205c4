use anyhow::Result;
use hermes::app;
use hermes::cli;

fn main() -> Result<()> {
    let invocation = cli::parse()?;
    let exit_code = app::run(invocation)?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
