pub mod export_cert;
pub mod info;
pub mod list_keys;
pub mod list_mechanisms;
pub mod list_tokens;
pub mod sign;

use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

use crate::error::CliResult;

/// `-` designates the standard input
pub(crate) fn open_input(path: &Path) -> CliResult<Box<dyn Read>> {
    if path == Path::new("-") {
        Ok(Box::new(io::stdin().lock()))
    } else {
        Ok(Box::new(File::open(path)?))
    }
}

/// Write `bytes` to `path`, or to `stdout` when the path is `-`
pub(crate) fn write_output(path: &Path, bytes: &[u8], stdout: &mut dyn Write) -> CliResult<()> {
    if path == Path::new("-") {
        stdout.write_all(bytes)?;
        stdout.flush()?;
    } else {
        File::create(path)?.write_all(bytes)?;
    }
    Ok(())
}
