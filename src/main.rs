use std::{
    io::{self, Write},
    process::ExitCode,
    sync::Arc,
};

use clap::Parser;
use httpdump::{
    capture::{self, Clock, Dispatcher},
    config::{Args, Source},
    http::{HttpTransaction, TransactionProcessor},
    log::{self, AggregatedLog},
    stream::TcpAssembler,
};
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let args = Args::parse();
    log::init_tracing(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let source = args.source()?;
    let filter = args.capture_filter()?;

    let path_match = args.path.clone();
    let processor: Arc<dyn TransactionProcessor> =
        Arc::new(move |transaction: HttpTransaction| print(&transaction, path_match.as_deref()));

    let log = Arc::new(AggregatedLog::new());
    let assembler = TcpAssembler::new(args.assembler_settings(), processor, log.clone());

    match source {
        Source::Device(device) => {
            let mut capture = capture::open_device(&device, &filter)?;
            Dispatcher::new(assembler, log, args.dispatch_settings(), Clock::Live)
                .run(&mut capture)?;
        }
        Source::File(path) => {
            info!(path = %path.display(), %filter, "reading capture file");
            let mut capture = capture::open_file(&path, &filter)?;
            Dispatcher::new(assembler, log, args.dispatch_settings(), Clock::Replay)
                .run(&mut capture)?;
        }
    }

    Ok(())
}

fn is_matching(transaction: &HttpTransaction, path_match: Option<&str>) -> bool {
    match path_match {
        Some(path_match) => transaction.request.path.contains(path_match),
        None => true,
    }
}

fn print(transaction: &HttpTransaction, path_match: Option<&str>) {
    if !is_matching(transaction, path_match) {
        return;
    }

    match serde_json::to_string(transaction) {
        Ok(line) => {
            let mut stdout = io::stdout().lock();
            if let Err(e) = writeln!(stdout, "{line}") {
                warn!(error = %e, "writing transaction failed");
            }
        }
        Err(e) => warn!(error = %e, "encoding transaction failed"),
    }
}
