use clap::Parser;

use bakesys::cmd::{init_logger, run, Args};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(args.log_level);
    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err}");
            if let Some(more) = err.secondary_message() {
                eprintln!("{more}");
            }
            log::debug!("exiting on error: {err:?}");
            std::process::exit(err.exit_code());
        }
    }
}
