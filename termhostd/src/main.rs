use clap::Parser;

fn main() -> anyhow::Result<()> {
    let args = termhostd::Args::parse();
    termhostd::run(args)
}
