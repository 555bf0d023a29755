use clap::Parser;
use elemental::cli::{self, Cli};

fn main() {
    let cli = Cli::parse();
    if let Err(err) = cli::run(cli) {
        eprintln!("{}", serde_json::to_string(&err.to_json()).unwrap_or_else(|_| err.to_string()));
        std::process::exit(err.kind.exit_code());
    }
}
