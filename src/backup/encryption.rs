// mariadbtool/src/backup/encryption.rs
//! Chunked AES-256-GCM stream framing.
//!
//! Layout: `MDBTENC1` magic, 16-byte argon2 salt, 7-byte nonce prefix, then frames of
//! `u32` big-endian ciphertext length followed by the ciphertext. Each frame seals at
//! most [`CHUNK_SIZE`] plaintext bytes under nonce `prefix || counter || last`. Only the
//! final frame has `last = 1`, so a truncated artifact fails to decrypt.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Result};
use argon2::Argon2;
use std::fmt;
use std::io::{self, Read, Write};

use crate::backup::options::Secret;
use crate::backup::writer_chain::{ChainLayer, LayerFactory};

pub const MAGIC: &[u8; 8] = b"MDBTENC1";
pub const CHUNK_SIZE: usize = 64 * 1024;
pub const LAYER_NAME: &str = "aes-256-gcm";
const SALT_LEN: usize = 16;
const PREFIX_LEN: usize = 7;
const TAG_LEN: usize = 16;

pub struct EncryptionKey {
    key: [u8; 32],
    salt: [u8; SALT_LEN],
}

impl EncryptionKey {
    /// Derives a key under a fresh random salt.
    pub fn derive(passphrase: &Secret) -> Result<Self> {
        Self::derive_with_salt(passphrase, rand::random())
    }

    pub fn derive_with_salt(passphrase: &Secret, salt: [u8; SALT_LEN]) -> Result<Self> {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(passphrase.expose().as_bytes(), &salt, &mut key)
            .map_err(|e| anyhow!("Failed to derive encryption key: {}", e))?;
        Ok(EncryptionKey { key, salt })
    }

    fn cipher(&self) -> io::Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| io::Error::other("invalid AES-256 key length"))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("salt", &hex::encode(self.salt))
            .finish_non_exhaustive()
    }
}

fn nonce_for(prefix: &[u8; PREFIX_LEN], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..PREFIX_LEN].copy_from_slice(prefix);
    nonce[PREFIX_LEN..PREFIX_LEN + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = last as u8;
    nonce
}

pub struct EncryptionFactory {
    key: EncryptionKey,
}

impl EncryptionFactory {
    pub fn new(key: EncryptionKey) -> Self {
        EncryptionFactory { key }
    }
}

impl LayerFactory for EncryptionFactory {
    fn wrap(&self, mut inner: Box<dyn ChainLayer>) -> io::Result<Box<dyn ChainLayer>> {
        let prefix: [u8; PREFIX_LEN] = rand::random();
        inner.write_all(MAGIC)?;
        inner.write_all(&self.key.salt)?;
        inner.write_all(&prefix)?;
        Ok(Box::new(EncryptionLayer {
            inner,
            cipher: self.key.cipher()?,
            prefix,
            counter: 0,
            buffer: Vec::with_capacity(CHUNK_SIZE * 2),
        }))
    }
}

pub struct EncryptionLayer {
    inner: Box<dyn ChainLayer>,
    cipher: Aes256Gcm,
    prefix: [u8; PREFIX_LEN],
    counter: u32,
    buffer: Vec<u8>,
}

impl EncryptionLayer {
    fn seal(&mut self, len: usize, last: bool) -> io::Result<()> {
        let nonce = nonce_for(&self.prefix, self.counter, last);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), &self.buffer[..len])
            .map_err(|_| io::Error::other("AES-GCM encryption failed"))?;
        self.inner.write_all(&(ciphertext.len() as u32).to_be_bytes())?;
        self.inner.write_all(&ciphertext)?;
        self.buffer.drain(..len);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::other("encrypted stream exceeded frame limit"))?;
        Ok(())
    }
}

impl Write for EncryptionLayer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        // Strictly greater: the final frame must never be empty unless the stream is.
        while self.buffer.len() > CHUNK_SIZE {
            self.seal(CHUNK_SIZE, false)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl ChainLayer for EncryptionLayer {
    fn name(&self) -> &'static str {
        LAYER_NAME
    }

    fn finish(mut self: Box<Self>) -> io::Result<Option<Box<dyn ChainLayer>>> {
        let remaining = self.buffer.len();
        self.seal(remaining, true)?;
        self.inner.flush()?;
        Ok(Some(self.inner))
    }
}

/// Reading side of [`EncryptionLayer`].
pub struct DecryptingReader<R: Read> {
    source: R,
    cipher: Aes256Gcm,
    prefix: [u8; PREFIX_LEN],
    counter: u32,
    lookahead: Option<Vec<u8>>,
    plaintext: Vec<u8>,
    position: usize,
    finished: bool,
}

impl<R: Read> DecryptingReader<R> {
    pub fn new(mut source: R, passphrase: &Secret) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        source.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not an encrypted mariadbtool artifact",
            ));
        }
        let mut salt = [0u8; SALT_LEN];
        source.read_exact(&mut salt)?;
        let mut prefix = [0u8; PREFIX_LEN];
        source.read_exact(&mut prefix)?;

        let key = EncryptionKey::derive_with_salt(passphrase, salt).map_err(io::Error::other)?;
        Ok(DecryptingReader {
            source,
            cipher: key.cipher()?,
            prefix,
            counter: 0,
            lookahead: None,
            plaintext: Vec::new(),
            position: 0,
            finished: false,
        })
    }

    /// Reads one length-prefixed frame; `None` on a clean end of stream.
    fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut len_bytes = [0u8; 4];
        let mut filled = 0;
        while filled < len_bytes.len() {
            match self.source.read(&mut len_bytes[filled..])? {
                0 if filled == 0 => return Ok(None),
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => filled += n,
            }
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len < TAG_LEN || len > CHUNK_SIZE + TAG_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("corrupt frame length {}", len),
            ));
        }
        let mut frame = vec![0u8; len];
        self.source.read_exact(&mut frame)?;
        Ok(Some(frame))
    }

    fn next_plaintext(&mut self) -> io::Result<()> {
        let current = match self.lookahead.take() {
            Some(frame) => frame,
            None => self.read_frame()?.ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "encrypted stream truncated")
            })?,
        };
        self.lookahead = self.read_frame()?;
        let last = self.lookahead.is_none();

        let nonce = nonce_for(&self.prefix, self.counter, last);
        self.plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), current.as_slice())
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "decryption failed (wrong passphrase or corrupted artifact)",
                )
            })?;
        self.position = 0;
        self.counter = self.counter.wrapping_add(1);
        self.finished = last;
        Ok(())
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.position >= self.plaintext.len() {
            if self.finished {
                return Ok(0);
            }
            self.next_plaintext()?;
        }
        let n = buf.len().min(self.plaintext.len() - self.position);
        buf[..n].copy_from_slice(&self.plaintext[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}
