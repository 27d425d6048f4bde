use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = slicerctl::Cli::parse();
    slicerctl::init_tracing(cli.verbose);
    if let Err(err) = slicerctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
