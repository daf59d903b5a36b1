use std::io::Write;

use clap::Parser;
use pkcs11_client::Client;

use crate::error::CliResult;

/// List the tokens present, in slot order.
///
/// The position of a token in this list is the `index:<n>` selector of the other
/// commands.
#[derive(Parser, Debug)]
pub struct ListTokensAction;

impl ListTokensAction {
    pub fn run(&self, client: &Client, out: &mut dyn Write) -> CliResult<()> {
        let tokens = client.list_tokens()?;
        if tokens.is_empty() {
            writeln!(out, "No token present")?;
        }
        for (index, token) in tokens.iter().enumerate() {
            writeln!(out, "[{index}] {token}")?;
        }
        Ok(())
    }
}
