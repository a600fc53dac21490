use clap::Parser;

fn main() {
    let cli = estatectl::Cli::parse();
    estatectl::init_tracing(cli.log_level.as_deref());
    if let Err(err) = estatectl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
