use std::io::Write;

use clap::Parser;
use pkcs11_client::{Client, Mechanism, SlotSelector};

use crate::error::CliResult;

/// List the mechanisms a token advertises.
///
/// Signature mechanisms this client knows are shown by name, the others by code.
#[derive(Parser, Debug)]
pub struct ListMechanismsAction {
    /// The token: `slot:<id>`, `index:<n>`, `label:<label>[#<n>]` or a bare label
    #[arg(long, short = 't')]
    pub token: SlotSelector,
}

impl ListMechanismsAction {
    pub fn run(&self, client: &Client, out: &mut dyn Write) -> CliResult<()> {
        for mechanism_type in client.list_mechanisms(&self.token)? {
            match Mechanism::from_mechanism_type(mechanism_type) {
                Some(mechanism) => writeln!(out, "0x{mechanism_type:08X}\t{mechanism}")?,
                None => writeln!(out, "0x{mechanism_type:08X}")?,
            }
        }
        Ok(())
    }
}
