use std::{
    io::{self, Write},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use pkcs11_client::{Client, ClientConfig, Credential, Mechanism};
use pkcs11_logger::log_init;
use tracing::{debug, info};

use crate::{
    actions::{
        export_cert::ExportCertAction, info::InfoAction, list_keys::ListKeysAction,
        list_mechanisms::ListMechanismsAction, list_tokens::ListTokensAction, sign::SignAction,
    },
    error::{CliError, CliResult},
};

pub const PKCS11_CLI_CONF_ENV: &str = "PKCS11_CLI_CONF";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file location (TOML)
    ///
    /// This is an alternative to the env variable `PKCS11_CLI_CONF`.
    /// The command line options below take precedence over its content.
    #[arg(short, long, env = PKCS11_CLI_CONF_ENV)]
    pub conf: Option<PathBuf>,

    /// The PKCS#11 shared library of the token vendor
    #[arg(long, env = "PKCS11_MODULE_PATH")]
    pub module: Option<PathBuf>,

    /// Default signature mechanism
    #[arg(long)]
    pub mechanism: Option<Mechanism>,

    /// Abandon a session whose native calls run longer than this
    #[arg(long)]
    pub session_timeout_ms: Option<u64>,

    /// The user PIN
    #[arg(long, env = "PKCS11_PIN", hide_env_values = true, conflicts_with_all = ["so_pin", "protected_auth_path"])]
    pub pin: Option<String>,

    /// Log in as the security officer with this PIN
    #[arg(long, conflicts_with = "protected_auth_path")]
    pub so_pin: Option<String>,

    /// Log in on the PIN pad of the device
    #[arg(long, default_value = "false")]
    pub protected_auth_path: bool,

    /// Log filter, e.g. `debug` or `pkcs11_client=trace`
    #[arg(long, env = "PKCS11_RUST_LOG")]
    pub rust_log: Option<String>,

    #[command(subcommand)]
    pub command: CliCommands,
}

#[derive(Subcommand, Debug)]
pub enum CliCommands {
    Info(InfoAction),
    ListTokens(ListTokensAction),
    ListKeys(ListKeysAction),
    ListMechanisms(ListMechanismsAction),
    Sign(SignAction),
    ExportCert(ExportCertAction),
}

impl CliCommands {
    /// Run the command against an initialized client, writing its output to `out`
    pub fn process(
        &self,
        client: &Client,
        credential: Option<&Credential>,
        out: &mut dyn Write,
    ) -> CliResult<()> {
        match self {
            Self::Info(action) => action.run(client, out),
            Self::ListTokens(action) => action.run(client, out),
            Self::ListKeys(action) => action.run(client, credential, out),
            Self::ListMechanisms(action) => action.run(client, out),
            Self::Sign(action) => action.run(client, credential, out),
            Self::ExportCert(action) => action.run(client, credential, out),
        }
    }
}

impl Cli {
    /// The configuration file, if any, overridden by the command line options
    pub fn client_config(&self) -> CliResult<ClientConfig> {
        let mut config = match &self.conf {
            Some(path) => ClientConfig::from_toml(path)?,
            None => ClientConfig::default(),
        };
        if let Some(module) = &self.module {
            config.module_path.clone_from(module);
        }
        if let Some(mechanism) = &self.mechanism {
            config.default_mechanism = Some(mechanism.clone());
        }
        if let Some(timeout) = self.session_timeout_ms {
            config.session_timeout_ms = Some(timeout);
        }
        if config.module_path.as_os_str().is_empty() {
            return Err(CliError::Configuration(
                "no PKCS#11 module: use --module, PKCS11_MODULE_PATH or a configuration file"
                    .to_owned(),
            ));
        }
        Ok(config)
    }

    #[must_use]
    pub fn credential(&self) -> Option<Credential> {
        if self.protected_auth_path {
            return Some(Credential::ProtectedAuthenticationPath);
        }
        if let Some(so_pin) = &self.so_pin {
            return Some(Credential::security_officer(so_pin.as_str()));
        }
        self.pin.as_deref().map(Credential::user)
    }
}

/// Parse the command line, load the module and run the command.
///
/// # Errors
///
/// Fails if the configuration cannot be built, the module cannot be loaded or the
/// command fails.
pub fn pkcs11_main() -> CliResult<()> {
    let cli = Cli::parse();
    log_init(cli.rust_log.as_deref());
    info!("Starting PKCS#11 CLI");

    let config = cli.client_config()?;
    debug!("Configuration: {config:?}");
    let client = Client::instantiate(config)?;
    let credential = cli.credential();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    cli.command.process(&client, credential.as_ref(), &mut out)?;
    client.finalize()?;
    Ok(())
}
