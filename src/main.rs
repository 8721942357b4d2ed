use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use ch34x_bridge::{DataBits, DeviceAddress, Parity, SerialParams, StopBits};

/// Bridge a WCH CH340/CH341 USB serial chip to a Unix PTY.
#[derive(Parser, Debug)]
#[command(name = "ch34x-pty-bridge", version, about)]
struct Args {
    /// Filesystem path to publish the PTY slave symlink at.
    #[arg(short = 'p', long = "path")]
    path: PathBuf,

    /// Driver to use (currently only "ch34x").
    #[arg(short = 'd', long = "driver")]
    driver: String,

    /// USB vendor ID, any base ("0x1a86", "6790", "0o...").
    #[arg(long = "vendor-id", visible_alias = "vid", value_parser = parse_u16_any_base)]
    vendor_id: u16,

    /// USB product ID, any base.
    #[arg(long = "product-id", visible_alias = "pid", value_parser = parse_u16_any_base)]
    product_id: u16,

    /// Initial baud rate.
    #[arg(short = 'b', long = "baud", default_value_t = 9600)]
    baud: u32,

    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_u16_any_base(s: &str) -> Result<u16, String> {
    let (digits, radix) = if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (rest, 16)
    } else if let Some(rest) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        (rest, 8)
    } else if let Some(rest) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        (rest, 2)
    } else {
        (s, 10)
    };
    u16::from_str_radix(digits, radix).map_err(|e| format!("invalid integer '{s}': {e}"))
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = match args.verbose {
        0 => "ch34x_bridge=info",
        1 => "ch34x_bridge=debug",
        _ => "ch34x_bridge=trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let driver = match ch34x_bridge::driver::by_name(&args.driver) {
        Some(driver) => driver,
        None => {
            eprintln!("unknown driver: {}", args.driver);
            return ExitCode::from(2);
        }
    };

    let params = SerialParams {
        baud_rate: args.baud,
        data_bits: DataBits::Eight,
        stop_bits: StopBits::One,
        parity: Parity::None,
        dtr: true,
        rts: true,
        break_asserted: false,
    };

    let address = DeviceAddress::new(args.vendor_id, args.product_id);
    let supervisor = ch34x_bridge::Supervisor::new(address, args.path, driver, params);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        if let Err(e) = ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        }) {
            eprintln!("failed to install signal handler: {e}");
            return ExitCode::from(2);
        }
    }

    match supervisor.run(stop) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
