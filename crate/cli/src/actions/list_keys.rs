use std::io::Write;

use clap::Parser;
use pkcs11_client::{Client, Credential, SlotSelector};

use crate::error::CliResult;

/// List the private keys of a token allowed to sign.
///
/// One key per line: label, hex `CKA_ID`, key type and object class.
#[derive(Parser, Debug)]
pub struct ListKeysAction {
    /// The token: `slot:<id>`, `index:<n>`, `label:<label>[#<n>]` or a bare label
    #[arg(long, short = 't')]
    pub token: SlotSelector,
}

impl ListKeysAction {
    pub fn run(
        &self,
        client: &Client,
        credential: Option<&Credential>,
        out: &mut dyn Write,
    ) -> CliResult<()> {
        let keys = client.list_signing_keys(&self.token, credential)?;
        if keys.is_empty() {
            writeln!(out, "No signing key on token {}", self.token)?;
        }
        for key in keys {
            writeln!(out, "{key}")?;
        }
        Ok(())
    }
}
