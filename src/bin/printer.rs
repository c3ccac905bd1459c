// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use clap::Parser;
use ricart::config::PrinterConfig;
use ricart::logging;
use ricart::printer::PrinterServer;
use std::error::Error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = PrinterConfig::parse();
    logging::init();
    config.validate()?;
    PrinterServer::new(config).run().await?;
    Ok(())
}
