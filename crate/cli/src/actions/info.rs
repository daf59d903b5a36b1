use std::io::Write;

use clap::Parser;
use pkcs11_client::Client;

use crate::error::CliResult;

/// Print the information the module reports about itself.
#[derive(Parser, Debug)]
pub struct InfoAction;

impl InfoAction {
    pub fn run(&self, client: &Client, out: &mut dyn Write) -> CliResult<()> {
        let info = client.module_info()?;
        writeln!(out, "Module: {}", client.session_manager().gateway().name())?;
        writeln!(out, "{info}")?;
        Ok(())
    }
}
