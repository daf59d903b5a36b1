use std::{io::Write, path::PathBuf};

use clap::Parser;
use pkcs11_client::{Client, Credential, SlotSelector};

use crate::{actions::write_output, cli_bail, error::CliResult};

/// Export a certificate stored on a token, DER encoded.
#[derive(Parser, Debug)]
pub struct ExportCertAction {
    /// The token: `slot:<id>`, `index:<n>`, `label:<label>[#<n>]` or a bare label
    #[arg(long, short = 't')]
    pub token: SlotSelector,

    /// The label of the certificate
    #[arg(long, short = 'l')]
    pub label: String,

    /// Where to write the certificate, `-` for the standard output
    #[arg(long = "out", short = 'o')]
    pub output: PathBuf,
}

impl ExportCertAction {
    pub fn run(
        &self,
        client: &Client,
        credential: Option<&Credential>,
        out: &mut dyn Write,
    ) -> CliResult<()> {
        let der = client.read_certificate(&self.token, credential, &self.label)?;
        if der.is_empty() {
            cli_bail!(
                "the certificate '{}' on token {} is empty",
                self.label,
                self.token
            );
        }
        write_output(&self.output, &der, out)
    }
}
