// mariadbtool/src/backup/writer_chain.rs
//! Ordered stack of stream transforms ending in the artifact file.
//!
//! Layers are built bottom-up (file, then encryption, then compression) and the dump
//! writes into the outermost one. Closing walks the stack top-down in an explicit loop:
//! each layer finalizes its own framing and hands back the writer it wrapped, so a
//! compression trailer always lands inside the encryption framing, and both land in
//! the file before the file is synced.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use tracing::debug;

use crate::backup::compression::CompressionFactory;
use crate::backup::encryption::{EncryptionFactory, EncryptionKey};
use crate::backup::options::BackupOptions;
use crate::errors::{BackupError, Result};

/// One level of the chain.
pub trait ChainLayer: Write + Send {
    fn name(&self) -> &'static str;

    /// Finalizes this layer and returns the writer it wraps (`None` for the sink).
    fn finish(self: Box<Self>) -> io::Result<Option<Box<dyn ChainLayer>>>;
}

/// Builds a layer on top of an existing one.
pub trait LayerFactory {
    fn wrap(&self, inner: Box<dyn ChainLayer>) -> io::Result<Box<dyn ChainLayer>>;
}

pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn new(file: File) -> Self {
        FileSink {
            writer: BufWriter::new(file),
        }
    }
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl ChainLayer for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn finish(self: Box<Self>) -> io::Result<Option<Box<dyn ChainLayer>>> {
        let file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(None)
    }
}

pub struct WriterChain {
    head: Option<Box<dyn ChainLayer>>,
    layers: Vec<&'static str>,
}

impl WriterChain {
    /// Wraps `sink` with each factory in order; the last factory becomes the entry point.
    pub fn build(
        sink: Box<dyn ChainLayer>,
        factories: &[Box<dyn LayerFactory>],
    ) -> io::Result<Self> {
        let mut layers = vec![sink.name()];
        let mut head = sink;
        for factory in factories {
            head = factory.wrap(head)?;
            layers.push(head.name());
        }
        debug!(layers = ?layers, "Writer chain constructed");
        Ok(WriterChain {
            head: Some(head),
            layers,
        })
    }

    /// file → [encryption] → [compression], per the backup options.
    pub fn for_options(file: File, options: &BackupOptions) -> Result<Self> {
        let mut factories: Vec<Box<dyn LayerFactory>> = Vec::new();

        if options.encrypt {
            let passphrase = options.encryption_passphrase.as_ref().ok_or_else(|| {
                BackupError::InvalidOptions("encryption passphrase missing".to_string())
            })?;
            let key = EncryptionKey::derive(passphrase)?;
            factories.push(Box::new(EncryptionFactory::new(key)));
        }
        if let Some((algorithm, level)) = options.effective_compression() {
            factories.push(Box::new(CompressionFactory::new(algorithm, level)));
        }

        WriterChain::build(Box::new(FileSink::new(file)), &factories).map_err(BackupError::Pipeline)
    }

    /// Layer names in construction order, innermost first.
    pub fn layer_names(&self) -> &[&'static str] {
        &self.layers
    }

    /// Finalizes every layer, outermost first. Any failure leaves the artifact unfinalized.
    pub fn close(mut self) -> Result<()> {
        let mut current = self.head.take();
        while let Some(layer) = current {
            let name = layer.name();
            current = layer
                .finish()
                .map_err(|source| BackupError::WriterFinalize { layer: name, source })?;
            debug!(layer = name, "Writer layer finalized");
        }
        Ok(())
    }
}

impl Write for WriterChain {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.head.as_mut() {
            Some(head) => head.write(buf),
            None => Err(io::Error::other("writer chain already closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.head.as_mut() {
            Some(head) => head.flush(),
            None => Ok(()),
        }
    }
}
