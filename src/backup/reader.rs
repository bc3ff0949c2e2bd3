// mariadbtool/src/backup/reader.rs
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::backup::compression;
use crate::backup::encryption::DecryptingReader;
use crate::backup::options::{CompressionAlgorithm, Secret};

/// Opens an artifact and peels its layers in reverse: decrypt, then decompress.
pub fn open_artifact(
    path: &Path,
    compression: Option<CompressionAlgorithm>,
    passphrase: Option<&Secret>,
) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open artifact {}", path.display()))?;
    let source = BufReader::new(file);

    let decrypted: Box<dyn Read + Send> = match passphrase {
        Some(passphrase) => Box::new(
            DecryptingReader::new(source, passphrase)
                .with_context(|| format!("Failed to read encryption header of {}", path.display()))?,
        ),
        None => Box::new(source),
    };

    Ok(match compression {
        Some(algorithm) => compression::decoder(algorithm, decrypted),
        None => decrypted,
    })
}
