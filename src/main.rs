use clap::Parser;
use veilfs::cli::{self, Args};

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();
    let exit_code = cli::run(&args);
    std::process::exit(exit_code as i32);
}
