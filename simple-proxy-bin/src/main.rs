use clap::{ArgAction, CommandFactory, Parser};
use simple_proxy_bin::{Options, run};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(author, version, about, long_about = None, disable_help_flag = true)]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port, overriding the configured one
    #[arg(short, long)]
    port: Option<u16>,

    /// Span collector URI, e.g. kafka://broker:9092/topic
    #[arg(short = 't', long)]
    tracing: Option<String>,

    /// Print usage
    #[arg(short, long, action = ArgAction::SetTrue)]
    help: bool,
}

fn usage() -> ExitCode {
    eprintln!("{}", Args::command().render_usage());
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) if !args.help => args,
        _ => return usage(),
    };

    let options = Options {
        config: args.config,
        port: args.port,
        collector: args.tracing,
    };

    match run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("simple_proxy: {}", e);
            ExitCode::FAILURE
        }
    }
}
