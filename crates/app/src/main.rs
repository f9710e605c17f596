mod cli;

fn main() {
    if let Err(err) = cli::run_from_args() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}
