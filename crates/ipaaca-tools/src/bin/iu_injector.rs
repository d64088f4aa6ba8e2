//! ipaaca-iu-injector: send one Message and echo it back through a listener

use std::process::ExitCode;

use clap::Parser;

use ipaaca_runtime::{logging, Handle};
use ipaaca_tools::{inject, InjectorArgs};

fn main() -> ExitCode {
    let args = InjectorArgs::parse();
    let config = args.ipaaca.to_config();
    logging::install(&config);

    let handle = match Handle::local(config) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("ipaaca-iu-injector: {}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("Sending Message of category {}", args.category);
    match inject(&handle, &args) {
        Ok(report) => {
            println!(" with payload {:?}", report.payload);
            println!("Message {} sent.", report.uid);
            match report.echoed {
                Some(payload) => println!("MESSAGE: {:?}", payload),
                None => println!("no listener saw the message"),
            }
            println!("done.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("ipaaca-iu-injector: {}", e);
            ExitCode::FAILURE
        }
    }
}
