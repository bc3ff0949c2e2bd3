// mariadbtool/src/backup/compression.rs
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::io::{self, Read, Write};

use crate::backup::options::CompressionAlgorithm;
use crate::backup::writer_chain::{ChainLayer, LayerFactory};

pub struct CompressionFactory {
    algorithm: CompressionAlgorithm,
    level: u32,
}

impl CompressionFactory {
    pub fn new(algorithm: CompressionAlgorithm, level: u32) -> Self {
        CompressionFactory {
            algorithm,
            level: level.min(9),
        }
    }
}

impl LayerFactory for CompressionFactory {
    fn wrap(&self, inner: Box<dyn ChainLayer>) -> io::Result<Box<dyn ChainLayer>> {
        let level = Compression::new(self.level);
        let encoder = match self.algorithm {
            CompressionAlgorithm::Gzip => Encoder::Gzip(GzEncoder::new(inner, level)),
            CompressionAlgorithm::Zlib => Encoder::Zlib(ZlibEncoder::new(inner, level)),
            CompressionAlgorithm::Deflate => Encoder::Deflate(DeflateEncoder::new(inner, level)),
        };
        Ok(Box::new(CompressionLayer {
            algorithm: self.algorithm,
            encoder,
        }))
    }
}

enum Encoder {
    Gzip(GzEncoder<Box<dyn ChainLayer>>),
    Zlib(ZlibEncoder<Box<dyn ChainLayer>>),
    Deflate(DeflateEncoder<Box<dyn ChainLayer>>),
}

pub struct CompressionLayer {
    algorithm: CompressionAlgorithm,
    encoder: Encoder,
}

impl Write for CompressionLayer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.encoder {
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Zlib(e) => e.write(buf),
            Encoder::Deflate(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.encoder {
            Encoder::Gzip(e) => e.flush(),
            Encoder::Zlib(e) => e.flush(),
            Encoder::Deflate(e) => e.flush(),
        }
    }
}

impl ChainLayer for CompressionLayer {
    fn name(&self) -> &'static str {
        self.algorithm.name()
    }

    fn finish(self: Box<Self>) -> io::Result<Option<Box<dyn ChainLayer>>> {
        let inner = match self.encoder {
            Encoder::Gzip(e) => e.finish()?,
            Encoder::Zlib(e) => e.finish()?,
            Encoder::Deflate(e) => e.finish()?,
        };
        Ok(Some(inner))
    }
}

/// Reading side of [`CompressionLayer`].
pub fn decoder<'a, R: Read + Send + 'a>(
    algorithm: CompressionAlgorithm,
    source: R,
) -> Box<dyn Read + Send + 'a> {
    match algorithm {
        CompressionAlgorithm::Gzip => Box::new(GzDecoder::new(source)),
        CompressionAlgorithm::Zlib => Box::new(ZlibDecoder::new(source)),
        CompressionAlgorithm::Deflate => Box::new(DeflateDecoder::new(source)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::writer_chain::{FileSink, WriterChain};
    use std::fs::File;

    #[test]
    fn test_each_algorithm_shrinks_repetitive_dump() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dump = "INSERT INTO t VALUES (1,'aaaaaaaaaa');\n".repeat(2_000);

        for algorithm in [
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Zlib,
            CompressionAlgorithm::Deflate,
        ] {
            let path = dir.path().join(format!("dump.sql.{}", algorithm.extension()));
            let factories: Vec<Box<dyn LayerFactory>> =
                vec![Box::new(CompressionFactory::new(algorithm, 6))];
            let mut chain =
                WriterChain::build(Box::new(FileSink::new(File::create(&path)?)), &factories)?;
            chain.write_all(dump.as_bytes())?;
            chain.close()?;

            let size = std::fs::metadata(&path)?.len() as usize;
            assert!(size < dump.len() / 10, "{} produced {} bytes", algorithm.name(), size);

            let mut restored = String::new();
            decoder(algorithm, File::open(&path)?).read_to_string(&mut restored)?;
            assert_eq!(restored, dump);
        }
        Ok(())
    }

    #[test]
    fn test_gzip_output_has_gzip_magic() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dump.sql.gz");
        let factories: Vec<Box<dyn LayerFactory>> = vec![Box::new(CompressionFactory::new(
            CompressionAlgorithm::Gzip,
            99,
        ))];
        let mut chain = WriterChain::build(Box::new(FileSink::new(File::create(&path)?)), &factories)?;
        chain.write_all(b"-- empty\n")?;
        chain.close()?;
        let bytes = std::fs::read(&path)?;
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        Ok(())
    }
}
