//! Entrypoint of the stream_tail binary

use clap::Parser;

mod commands {
    pub(crate) mod demo;
}
mod logging;

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "stream_tail",
    version,
    about = "Tails every partition of a partitioned append-only stream",
    long_about = r#"Tails every partition of a partitioned append-only stream

Examples:
    # Tail a built-in stream of two partitions and stop after 20 records
    stream_tail demo --partitions 2 --limit 20

    # Split the first partition after 5 records and show what the tailer does
    stream_tail demo --partitions 1 --split-after 5 -vv

Command are generally structured in the form:
    <type of object> <action> <arguments>

Run stream_tail <command> --help for more information on each command.
"#
)]
struct Config {
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
#[allow(clippy::large_enum_variant)]
enum Command {
    /// Tail an in-memory stream that is fed by a built-in producer
    Demo(commands::demo::Config),
}

#[tokio::main]
async fn main() {
    let config = Config::parse();

    match config.command {
        None => println!("command required, -h/--help for help"),
        Some(Command::Demo(config)) => {
            if let Err(e) = config.logging_config.install_global_subscriber() {
                eprintln!("Initializing logs failed: {e}");
                std::process::exit(ReturnCode::Failure as _)
            }
            if let Err(e) = commands::demo::command(config).await {
                eprintln!("Demo command failed: {e}");
                std::process::exit(ReturnCode::Failure as _)
            }
        }
    }
}
