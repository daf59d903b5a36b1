use std::{
    io::Write,
    path::{Path, PathBuf},
};

use clap::Parser;
use pkcs11_client::{Client, Credential, Mechanism, SlotSelector};
use tracing::info;

use crate::{
    actions::{open_input, write_output},
    cli_bail,
    error::{CliError, CliResult},
};

/// Sign a file with a private key of a token.
///
/// The input is streamed to the token in chunks, so its size is not limited by memory.
/// Without `--mechanism`, the configured default mechanism is used, or else the default
/// for the key type: `sha256-rsa-pkcs` for RSA, `ecdsa-sha256` for EC, `eddsa` for
/// Edwards curves.
#[derive(Parser, Debug)]
pub struct SignAction {
    /// The token: `slot:<id>`, `index:<n>`, `label:<label>[#<n>]` or a bare label
    #[arg(long, short = 't')]
    pub token: SlotSelector,

    /// The label of the private key
    #[arg(long, short = 'k')]
    pub key: String,

    /// The file to sign, `-` for the standard input
    #[arg(long = "in", short = 'i')]
    pub input: PathBuf,

    /// Where to write the signature, `-` for the standard output
    #[arg(long = "out", short = 'o')]
    pub output: PathBuf,

    /// The signature mechanism, e.g. `sha256-rsa-pkcs-pss`
    /// or `custom:<hex type>:<key type>[:<hex parameter>]`
    #[arg(long, short = 'm')]
    pub mechanism: Option<Mechanism>,

    /// Write the signature hex encoded rather than raw
    #[arg(long, default_value = "false")]
    pub hex: bool,
}

impl SignAction {
    pub fn run(
        &self,
        client: &Client,
        credential: Option<&Credential>,
        out: &mut dyn Write,
    ) -> CliResult<()> {
        if self.input == self.output && self.input != Path::new("-") {
            cli_bail!(CliError::Usage(format!(
                "the signature would overwrite the file to sign: {}",
                self.input.display()
            )));
        }
        let input = open_input(&self.input)?;
        let signature = client.sign_with_key(
            &self.token,
            credential,
            &self.key,
            self.mechanism.as_ref(),
            input,
        )?;
        info!(
            "signed {} with key '{}': {} bytes signature",
            self.input.display(),
            self.key,
            signature.len()
        );
        if self.hex {
            write_output(&self.output, hex::encode(&signature).as_bytes(), out)
        } else {
            write_output(&self.output, &signature, out)
        }
    }
}
