//! serial-bridge - host process that owns the serial port on behalf of the
//! IDE. Speaks JSON lines on stdin/stdout; logs go to stderr.
//!
//! Usage:
//!   serial-bridge
//!   serial-bridge --simulated

use clap::Parser;
use iotide_lib::logging::init_logging;
use iotide_serial::serial::bridge::serve;
use iotide_serial::serial::{InProcessTransport, SerialTransport, SimulatedTransport};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "serial-bridge")]
#[command(about = "Serial port bridge for the IoT IDE")]
#[command(version)]
struct Args {
    /// Serve a simulated MicroPython board instead of real ports
    #[arg(long)]
    simulated: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging("warn", args.json);

    let transport: Arc<dyn SerialTransport> = if args.simulated {
        let sim = SimulatedTransport::new();
        sim.set_responder(SimulatedTransport::echo_repl());
        sim
    } else {
        Arc::new(InProcessTransport::new())
    };

    tracing::info!(backend = transport.kind().label(), "serial bridge started");
    match serve(transport, tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("serial bridge failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
