//! Chunked streaming encryption
//!
//! Plaintext is processed in fixed-size chunks so memory use does not depend
//! on file size.
//!
//! AEAD layout (AES-256-GCM, ChaCha20-Poly1305):
//! ```text
//! [chunk 0 ciphertext][16-byte tag] ... [final chunk ciphertext][16-byte tag]
//! nonce_i = iv XOR (0^8 || i as u32 BE)
//! AAD_i   = i as u32 BE || final flag (1 byte)
//! ```
//! The final chunk is always shorter than the chunk size (possibly empty), so
//! truncating whole chunks or appending data breaks authentication. The tag
//! of the final chunk is also kept in the file metadata.
//!
//! CBC layout (AES-256-CBC): plain CBC over the whole stream with PKCS#7
//! padding. Tampering with CBC ciphertext is caught by the integrity digest,
//! not by the cipher.

use super::{Algorithm, BLOCK_SIZE, KEY_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Result of encrypting one file
#[derive(Debug, Clone)]
pub struct EncryptionOutput {
    /// Cipher used
    pub algorithm: Algorithm,
    /// IV generated for this file
    pub iv: Vec<u8>,
    /// Tag of the final chunk (AEAD modes only)
    pub auth_tag: Option<Vec<u8>>,
    /// Bytes of plaintext consumed
    pub plaintext_len: u64,
    /// Bytes of ciphertext produced
    pub ciphertext_len: u64,
}

/// Encrypt everything `reader` yields into `writer`
pub fn encrypt_stream<R: Read, W: Write>(
    key: &[u8; KEY_SIZE],
    algorithm: Algorithm,
    iv: &[u8],
    chunk_size: usize,
    reader: R,
    writer: W,
) -> Result<EncryptionOutput> {
    check_params(algorithm, iv, chunk_size)?;
    match algorithm {
        Algorithm::Aes256Cbc => encrypt_cbc(key, iv, chunk_size, reader, writer),
        Algorithm::Aes256Gcm | Algorithm::ChaCha20Poly1305 => {
            encrypt_aead(key, algorithm, iv, chunk_size, reader, writer)
        }
    }
}

/// Decrypt everything `reader` yields into `writer`, returning the plaintext length
///
/// For AEAD modes, plaintext of earlier chunks reaches `writer` before later
/// chunks are authenticated. Callers must treat the output as untrusted until
/// this function returns `Ok`.
pub fn decrypt_stream<R: Read, W: Write>(
    key: &[u8; KEY_SIZE],
    algorithm: Algorithm,
    iv: &[u8],
    auth_tag: Option<&[u8]>,
    chunk_size: usize,
    reader: R,
    writer: W,
) -> Result<u64> {
    check_params(algorithm, iv, chunk_size)?;
    match algorithm {
        Algorithm::Aes256Cbc => decrypt_cbc(key, iv, chunk_size, reader, writer),
        Algorithm::Aes256Gcm | Algorithm::ChaCha20Poly1305 => {
            decrypt_aead(key, algorithm, iv, auth_tag, chunk_size, reader, writer)
        }
    }
}

/// Encrypt `src` into a new file at `dst` with a fresh IV
///
/// `dst` must not exist. On any failure nothing is left at `dst`.
pub fn encrypt_file(
    key: &[u8; KEY_SIZE],
    algorithm: Algorithm,
    chunk_size: usize,
    src: &Path,
    dst: &Path,
) -> Result<EncryptionOutput> {
    let source = File::open(src)
        .map_err(|e| Error::Encryption(format!("cannot read {}: {}", src.display(), e)))?;

    let dest = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)
        .map_err(|e| Error::Encryption(format!("cannot create {}: {}", dst.display(), e)))?;

    let iv = algorithm.generate_iv();
    let result = write_ciphertext(key, algorithm, &iv, chunk_size, source, dest);
    if result.is_err() {
        let _ = std::fs::remove_file(dst);
    }
    result
}

fn write_ciphertext(
    key: &[u8; KEY_SIZE],
    algorithm: Algorithm,
    iv: &[u8],
    chunk_size: usize,
    source: File,
    dest: File,
) -> Result<EncryptionOutput> {
    let mut writer = BufWriter::new(dest);
    let output = encrypt_stream(
        key,
        algorithm,
        iv,
        chunk_size,
        BufReader::new(source),
        &mut writer,
    )?;
    writer.flush().map_err(encryption_io)?;
    writer.get_ref().sync_all().map_err(encryption_io)?;
    Ok(output)
}

/// Decrypt `src` into `dst`, returning the plaintext length
///
/// `dst` is truncated first. A missing `src` is reported as
/// [`Error::FileMissing`]. The caller owns cleanup of `dst` on failure.
pub fn decrypt_file(
    key: &[u8; KEY_SIZE],
    algorithm: Algorithm,
    iv: &[u8],
    auth_tag: Option<&[u8]>,
    chunk_size: usize,
    src: &Path,
    dst: &Path,
) -> Result<u64> {
    let source = match File::open(src) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::FileMissing(src.to_path_buf()))
        }
        Err(e) => return Err(Error::Io(e)),
    };

    let dest = OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(true)
        .open(dst)?;

    let mut writer = BufWriter::new(dest);
    let written = decrypt_stream(
        key,
        algorithm,
        iv,
        auth_tag,
        chunk_size,
        BufReader::new(source),
        &mut writer,
    )?;
    writer.flush()?;
    Ok(written)
}

fn check_params(algorithm: Algorithm, iv: &[u8], chunk_size: usize) -> Result<()> {
    if iv.len() != algorithm.iv_len() {
        return Err(Error::InvalidArgument(format!(
            "{} needs a {}-byte IV, got {}",
            algorithm,
            algorithm.iv_len(),
            iv.len()
        )));
    }
    if chunk_size == 0 || chunk_size % BLOCK_SIZE != 0 {
        return Err(Error::InvalidArgument(format!(
            "chunk size {} is not a non-zero multiple of {}",
            chunk_size, BLOCK_SIZE
        )));
    }
    Ok(())
}

fn encryption_io(e: io::Error) -> Error {
    Error::Encryption(e.to_string())
}

/// Fill `buf` from `reader`, stopping only at EOF
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn aead_key(key: &[u8; KEY_SIZE], algorithm: Algorithm) -> Result<LessSafeKey> {
    let alg = match algorithm {
        Algorithm::Aes256Gcm => &AES_256_GCM,
        Algorithm::ChaCha20Poly1305 => &CHACHA20_POLY1305,
        Algorithm::Aes256Cbc => {
            return Err(Error::internal("CBC is not an AEAD algorithm"));
        }
    };
    UnboundKey::new(alg, key)
        .map(LessSafeKey::new)
        .map_err(|_| Error::Encryption("invalid AEAD key".to_string()))
}

fn chunk_nonce(iv: &[u8], index: u32) -> Nonce {
    let mut bytes = [0u8; super::AEAD_NONCE_SIZE];
    bytes.copy_from_slice(iv);
    for (b, c) in bytes[8..].iter_mut().zip(index.to_be_bytes()) {
        *b ^= c;
    }
    Nonce::assume_unique_for_key(bytes)
}

fn chunk_aad(index: u32, last: bool) -> [u8; 5] {
    let mut aad = [0u8; 5];
    aad[..4].copy_from_slice(&index.to_be_bytes());
    aad[4] = last as u8;
    aad
}

fn encrypt_aead<R: Read, W: Write>(
    key: &[u8; KEY_SIZE],
    algorithm: Algorithm,
    iv: &[u8],
    chunk_size: usize,
    mut reader: R,
    mut writer: W,
) -> Result<EncryptionOutput> {
    let sealing_key = aead_key(key, algorithm)?;
    let mut buf = vec![0u8; chunk_size];
    let mut index: u32 = 0;
    let mut plaintext_len = 0u64;
    let mut ciphertext_len = 0u64;

    let final_tag = loop {
        let n = read_full(&mut reader, &mut buf).map_err(encryption_io)?;
        let last = n < chunk_size;

        let tag = sealing_key
            .seal_in_place_separate_tag(
                chunk_nonce(iv, index),
                Aad::from(chunk_aad(index, last)),
                &mut buf[..n],
            )
            .map_err(|_| Error::Encryption("AEAD seal failed".to_string()))?;

        writer.write_all(&buf[..n]).map_err(encryption_io)?;
        writer.write_all(tag.as_ref()).map_err(encryption_io)?;
        plaintext_len += n as u64;
        ciphertext_len += (n + TAG_SIZE) as u64;

        if last {
            break tag.as_ref().to_vec();
        }
        index = index
            .checked_add(1)
            .ok_or_else(|| Error::Encryption("too many chunks for one file".to_string()))?;
    };

    Ok(EncryptionOutput {
        algorithm,
        iv: iv.to_vec(),
        auth_tag: Some(final_tag),
        plaintext_len,
        ciphertext_len,
    })
}

fn decrypt_aead<R: Read, W: Write>(
    key: &[u8; KEY_SIZE],
    algorithm: Algorithm,
    iv: &[u8],
    auth_tag: Option<&[u8]>,
    chunk_size: usize,
    mut reader: R,
    mut writer: W,
) -> Result<u64> {
    let opening_key = aead_key(key, algorithm)?;
    let sealed_size = chunk_size + TAG_SIZE;
    let mut buf = vec![0u8; sealed_size];
    let mut index: u32 = 0;
    let mut written = 0u64;

    loop {
        let n = read_full(&mut reader, &mut buf)?;
        // Also covers a stream that ends right after a full chunk (truncation).
        if n < TAG_SIZE {
            return Err(Error::DecryptionAuthFailure);
        }
        let last = n < sealed_size;

        if last {
            if let Some(expected) = auth_tag {
                if &buf[n - TAG_SIZE..n] != expected {
                    return Err(Error::DecryptionAuthFailure);
                }
            }
        }

        let plaintext = opening_key
            .open_in_place(
                chunk_nonce(iv, index),
                Aad::from(chunk_aad(index, last)),
                &mut buf[..n],
            )
            .map_err(|_| Error::DecryptionAuthFailure)?;

        writer.write_all(plaintext)?;
        written += plaintext.len() as u64;

        if last {
            return Ok(written);
        }
        index = index.checked_add(1).ok_or(Error::DecryptionAuthFailure)?;
    }
}

fn encrypt_cbc<R: Read, W: Write>(
    key: &[u8; KEY_SIZE],
    iv: &[u8],
    chunk_size: usize,
    mut reader: R,
    mut writer: W,
) -> Result<EncryptionOutput> {
    let mut cipher = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| Error::Encryption("invalid key or IV length".to_string()))?;
    // One spare block for the padding of the final chunk.
    let mut buf = vec![0u8; chunk_size + BLOCK_SIZE];
    let mut plaintext_len = 0u64;
    let mut ciphertext_len = 0u64;

    loop {
        let n = read_full(&mut reader, &mut buf[..chunk_size]).map_err(encryption_io)?;
        let last = n < chunk_size;
        plaintext_len += n as u64;

        let len = if last {
            let pad = BLOCK_SIZE - n % BLOCK_SIZE;
            buf[n..n + pad].fill(pad as u8);
            n + pad
        } else {
            n
        };

        for block in buf[..len].chunks_exact_mut(BLOCK_SIZE) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        writer.write_all(&buf[..len]).map_err(encryption_io)?;
        ciphertext_len += len as u64;

        if last {
            break;
        }
    }

    Ok(EncryptionOutput {
        algorithm: Algorithm::Aes256Cbc,
        iv: iv.to_vec(),
        auth_tag: None,
        plaintext_len,
        ciphertext_len,
    })
}

fn decrypt_cbc<R: Read, W: Write>(
    key: &[u8; KEY_SIZE],
    iv: &[u8],
    chunk_size: usize,
    mut reader: R,
    mut writer: W,
) -> Result<u64> {
    let mut cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| Error::Decryption("invalid key or IV length".to_string()))?;
    let mut buf = vec![0u8; chunk_size];
    // The last decrypted block is held back until EOF so its padding can be stripped.
    let mut held: Option<[u8; BLOCK_SIZE]> = None;
    let mut written = 0u64;

    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        if n % BLOCK_SIZE != 0 {
            return Err(Error::Decryption(
                "ciphertext length is not a multiple of the block size".to_string(),
            ));
        }

        for block in buf[..n].chunks_exact_mut(BLOCK_SIZE) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }

        if let Some(previous) = held.take() {
            writer.write_all(&previous)?;
            written += BLOCK_SIZE as u64;
        }
        writer.write_all(&buf[..n - BLOCK_SIZE])?;
        written += (n - BLOCK_SIZE) as u64;

        let mut tail = [0u8; BLOCK_SIZE];
        tail.copy_from_slice(&buf[n - BLOCK_SIZE..n]);
        held = Some(tail);

        if n < chunk_size {
            break;
        }
    }

    let tail = held.ok_or_else(|| Error::Decryption("empty ciphertext".to_string()))?;
    let pad = tail[BLOCK_SIZE - 1] as usize;
    if pad == 0 || pad > BLOCK_SIZE || !tail[BLOCK_SIZE - pad..].iter().all(|&b| b as usize == pad)
    {
        return Err(Error::Decryption("invalid padding".to_string()));
    }
    writer.write_all(&tail[..BLOCK_SIZE - pad])?;
    written += (BLOCK_SIZE - pad) as u64;

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CHUNK: usize = 64;
    const KEY: [u8; KEY_SIZE] = [0x42; KEY_SIZE];

    fn roundtrip(algorithm: Algorithm, plaintext: &[u8]) -> Vec<u8> {
        let iv = algorithm.generate_iv();
        let mut ciphertext = Vec::new();
        let out = encrypt_stream(&KEY, algorithm, &iv, CHUNK, plaintext, &mut ciphertext).unwrap();
        assert_eq!(out.plaintext_len, plaintext.len() as u64);
        assert_eq!(out.ciphertext_len, ciphertext.len() as u64);
        assert_eq!(out.auth_tag.is_some(), algorithm.is_aead());

        let mut decrypted = Vec::new();
        let n = decrypt_stream(
            &KEY,
            algorithm,
            &iv,
            out.auth_tag.as_deref(),
            CHUNK,
            ciphertext.as_slice(),
            &mut decrypted,
        )
        .unwrap();
        assert_eq!(n, decrypted.len() as u64);
        decrypted
    }

    fn seal(algorithm: Algorithm, plaintext: &[u8]) -> (Vec<u8>, Vec<u8>, Option<Vec<u8>>) {
        let iv = algorithm.generate_iv();
        let mut ciphertext = Vec::new();
        let out = encrypt_stream(&KEY, algorithm, &iv, CHUNK, plaintext, &mut ciphertext).unwrap();
        (iv, ciphertext, out.auth_tag)
    }

    fn open(
        algorithm: Algorithm,
        iv: &[u8],
        tag: Option<&[u8]>,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        decrypt_stream(&KEY, algorithm, iv, tag, CHUNK, ciphertext, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_roundtrip_boundary_sizes() {
        for algorithm in Algorithm::ALL {
            for size in [0, 1, 15, 16, 17, CHUNK - 1, CHUNK, CHUNK + 1, 3 * CHUNK] {
                let plaintext: Vec<u8> = (0..size).map(|i| i as u8).collect();
                assert_eq!(roundtrip(algorithm, &plaintext), plaintext, "{} / {}", algorithm, size);
            }
        }
    }

    #[test]
    fn test_aead_tamper_rejected() {
        for algorithm in [Algorithm::Aes256Gcm, Algorithm::ChaCha20Poly1305] {
            let (iv, mut ciphertext, tag) = seal(algorithm, &[7u8; 200]);
            ciphertext[10] ^= 0x01;
            let result = open(algorithm, &iv, tag.as_deref(), &ciphertext);
            assert!(matches!(result, Err(Error::DecryptionAuthFailure)));
        }
    }

    #[test]
    fn test_aead_truncation_rejected() {
        let algorithm = Algorithm::Aes256Gcm;
        let (iv, ciphertext, _) = seal(algorithm, &[1u8; 3 * CHUNK + 5]);
        // Drop the final chunk; what remains ends on a full-chunk boundary.
        let truncated = &ciphertext[..3 * (CHUNK + TAG_SIZE)];
        let result = open(algorithm, &iv, None, truncated);
        assert!(matches!(result, Err(Error::DecryptionAuthFailure)));
    }

    #[test]
    fn test_aead_chunk_reorder_rejected() {
        let algorithm = Algorithm::ChaCha20Poly1305;
        let plaintext: Vec<u8> = (0..2 * CHUNK + 3).map(|i| i as u8).collect();
        let (iv, ciphertext, tag) = seal(algorithm, &plaintext);

        let sealed = CHUNK + TAG_SIZE;
        let mut swapped = Vec::new();
        swapped.extend_from_slice(&ciphertext[sealed..2 * sealed]);
        swapped.extend_from_slice(&ciphertext[..sealed]);
        swapped.extend_from_slice(&ciphertext[2 * sealed..]);

        let result = open(algorithm, &iv, tag.as_deref(), &swapped);
        assert!(matches!(result, Err(Error::DecryptionAuthFailure)));
    }

    #[test]
    fn test_aead_stored_tag_mismatch_rejected() {
        let algorithm = Algorithm::Aes256Gcm;
        let (iv, ciphertext, _) = seal(algorithm, b"short file");
        let wrong = [0u8; TAG_SIZE];
        let result = open(algorithm, &iv, Some(&wrong), &ciphertext);
        assert!(matches!(result, Err(Error::DecryptionAuthFailure)));
    }

    #[test]
    fn test_cbc_misaligned_ciphertext_rejected() {
        let algorithm = Algorithm::Aes256Cbc;
        let (iv, ciphertext, _) = seal(algorithm, b"some plaintext");
        let result = open(algorithm, &iv, None, &ciphertext[..ciphertext.len() - 1]);
        assert!(matches!(result, Err(Error::Decryption(_))));
    }

    #[test]
    fn test_wrong_iv_length_rejected() {
        let mut out = Vec::new();
        let result = encrypt_stream(&KEY, Algorithm::Aes256Gcm, &[0u8; 16], CHUNK, &b"x"[..], &mut out);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_encrypt_file_missing_source_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out.enc");
        let result = encrypt_file(
            &KEY,
            Algorithm::Aes256Gcm,
            CHUNK,
            &dir.path().join("missing"),
            &dst,
        );
        assert!(matches!(result, Err(Error::Encryption(_))));
        assert!(!dst.exists());
    }

    #[test]
    fn test_file_roundtrip_and_missing_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plain.txt");
        let enc = dir.path().join("plain.enc");
        let dec = dir.path().join("plain.out");
        std::fs::write(&src, vec![0x5Au8; 1000]).unwrap();

        let out = encrypt_file(&KEY, Algorithm::Aes256Cbc, CHUNK, &src, &enc).unwrap();
        let n = decrypt_file(&KEY, out.algorithm, &out.iv, None, CHUNK, &enc, &dec).unwrap();
        assert_eq!(n, 1000);
        assert_eq!(std::fs::read(&dec).unwrap(), vec![0x5Au8; 1000]);

        let missing = dir.path().join("gone.enc");
        let result = decrypt_file(&KEY, out.algorithm, &out.iv, None, CHUNK, &missing, &dec);
        assert!(matches!(result, Err(Error::FileMissing(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_roundtrip_all_algorithms(plaintext in proptest::collection::vec(any::<u8>(), 0..600)) {
            for algorithm in Algorithm::ALL {
                prop_assert_eq!(roundtrip(algorithm, &plaintext), plaintext.clone());
            }
        }
    }
}
