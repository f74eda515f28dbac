#![deny(unsafe_code)]

use ehub::logger::logger_init;
use ehub::settings::{Options, Settings};
use ehub::structopt::StructOpt;
use ehub::HubContext;

#[tokio::main]
async fn main() {
    //init config
    let settings = Settings::new(Options::from_args()).expect("settings init failed");

    //init log
    logger_init(&settings.log).expect("logger init failed");

    settings.logs();

    let ctx = HubContext::new(settings).expect("hub init failed");
    ctx.start().await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for shutdown signal, {:?}", e);
    }

    ctx.close().await;
}
