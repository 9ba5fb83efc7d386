use image_mirror::cli::{Args, Runner};
use image_mirror::logging::init_tracing;
use std::process;

#[tokio::main]
async fn main() {
    let args = Args::parse_args();
    init_tracing(args.verbose);

    let runner = Runner::new(args);
    if let Err(e) = runner.run().await {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
