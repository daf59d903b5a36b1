use std::process::ExitCode;

use pkcs11_cli::commands::pkcs11_main;

fn main() -> ExitCode {
    match pkcs11_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ERROR: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}
