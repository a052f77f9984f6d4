/* This file is part of Retro
 *
 * Copyright (C) 2023-2026 Dyne.org foundation
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! File transfer choreography.
//!
//! Sending a file from Alice to Bob:
//!
//! 1. Alice compresses and encrypts the file under a fresh key and
//!    uploads the blob to the file server.
//! 2. Alice sends Bob an end-to-end file message carrying the file id
//!    and the key.
//! 3. Bob requests the file id from the file server, downloads the blob,
//!    verifies the HMAC and decrypts it into his download directory.
//!
//! The file server connection is a short-lived, one-shot resource on a
//! separate port; the file message itself travels over the main session.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::{error, info};

use crate::{
    account::Account,
    config::{Config, RETRO_MAX_FILESIZE},
    crypto::{aes_decrypt_to_file, aes_encrypt_from_file, hash_sha256, random_bytes},
    friend::Friend,
    handler::make_file_msg,
    message::{FileInfo, Message},
    net::{NetClient, ReadStatus},
    protocol::{PacketType, AES_KEY_SIZE, FILEID_SIZE},
    session::expect_success,
    Error, Result,
};

/// Encrypt and upload a file for `friend`, then send the file message
/// over the main session connection.
///
/// Returns the locally persistable message along with the file name and
/// plaintext size.
pub fn upload_file(
    conf: &Config,
    conn: &NetClient,
    account: &Account,
    friend: &Friend,
    filepath: &Path,
) -> Result<(Message, String, u64)> {
    let filename = basename(filepath)?;
    let filesize = std::fs::metadata(filepath)?.len();
    if filesize > RETRO_MAX_FILESIZE {
        return Err(Error::FileTransferFailed(format!(
            "file too large ({} > {})",
            filesize, RETRO_MAX_FILESIZE
        )))
    }

    let file_id = make_file_id(&filename);
    let file_key: [u8; AES_KEY_SIZE] = random_bytes(AES_KEY_SIZE).try_into().unwrap();

    // Compress and encrypt into the transfer blob
    let blob = aes_encrypt_from_file(&file_key, filepath)?;

    // Upload on a one-shot file server connection
    let fconn = connect_file_server(conf)?;
    let timeout = Duration::from_secs(conf.recv_timeout);
    let res = upload_blob(&fconn, &file_id, &blob, timeout);
    fconn.close();
    res?;

    info!(
        target: "retro::transfer",
        "Uploaded '{}' ({}) as {}",
        filename, format_filesize(filesize), hex::encode(file_id)
    );

    // Tell the friend about it, out of band of the file server
    let info = FileInfo {
        file_id: hex::encode(file_id),
        filename: filename.clone(),
        size: filesize,
        key: BASE64.encode(file_key),
        downloaded: true,
    };
    let (msg, envelope) = make_file_msg(account, friend, &info)?;
    conn.send_packet(PacketType::FileMsg, &[&envelope])?;

    Ok((msg, filename, filesize))
}

/// Download a file from the file server, verify and decrypt it into the
/// configured download directory.
///
/// `key_b64` is the base64 file key received in the file message. Any
/// short read, HMAC mismatch or decompression failure is terminal; the
/// caller may retry end-to-end.
pub fn download_file(
    conf: &Config,
    file_id: &str,
    filename: &str,
    key_b64: &str,
) -> Result<(PathBuf, u64)> {
    let file_id_raw = hex::decode(file_id)
        .map_err(|_| Error::FileTransferFailed(format!("invalid file id '{}'", file_id)))?;
    if file_id_raw.len() != FILEID_SIZE {
        return Err(Error::FileTransferFailed(format!("invalid file id '{}'", file_id)))
    }

    let key: [u8; AES_KEY_SIZE] = BASE64
        .decode(key_b64)
        .ok()
        .and_then(|k| k.try_into().ok())
        .ok_or_else(|| Error::FileTransferFailed("invalid file key".to_string()))?;

    // Request the blob
    let fconn = connect_file_server(conf)?;
    let timeout = Duration::from_secs(conf.recv_timeout);
    let blob = download_blob(&fconn, &file_id_raw, timeout);
    fconn.close();
    let blob = blob?;

    // Verify, decrypt, decompress and store
    let filename = basename(Path::new(filename))?;
    let dest = conf.download_dir.join(&filename);
    if let Err(e) = aes_decrypt_to_file(&key, &blob, &dest) {
        error!(target: "retro::transfer", "Failed to decrypt '{}': {}", filename, e);
        return Err(Error::FileTransferFailed(format!("decrypt '{}': {}", filename, e)))
    }

    info!(target: "retro::transfer", "Downloaded '{}' to {:?}", filename, dest);
    Ok((dest, blob.len() as u64))
}

/// Announce and stream an encrypted blob to the file server.
///
/// Both the announcement and the blob itself are acknowledged with
/// `T_SUCCESS` before the upload counts as done.
pub fn upload_blob(
    fconn: &NetClient,
    file_id: &[u8; FILEID_SIZE],
    blob: &[u8],
    timeout: Duration,
) -> Result<()> {
    fconn.send_packet(PacketType::FileUpload, &[file_id, &(blob.len() as u32).to_be_bytes()])?;
    expect_success(fconn, timeout)?;

    fconn.send_raw(blob)?;
    expect_success(fconn, timeout)?;
    Ok(())
}

/// Request a blob by file id and receive exactly the announced number of
/// bytes, each read bounded by `timeout`. A short transfer is terminal.
pub fn download_blob(fconn: &NetClient, file_id: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    fconn.send_packet(PacketType::FileDownload, &[file_id])?;

    let payload = expect_success(fconn, timeout)?;
    if payload.len() < 4 {
        return Err(Error::FileTransferFailed("missing blob size".to_string()))
    }
    let blob_size = u32::from_be_bytes(payload[..4].try_into().unwrap()) as usize;

    let mut blob = vec![0u8; blob_size];
    match fconn.recv_exact(&mut blob, timeout) {
        Ok(ReadStatus::Done) => Ok(blob),
        Ok(_) | Err(Error::IoTruncated) => {
            error!(target: "retro::transfer", "Short read while downloading blob");
            Err(Error::FileTransferFailed("short download".to_string()))
        }
        Err(e) => Err(e),
    }
}

/// Generate a file id from the file name and 16 random bytes.
fn make_file_id(filename: &str) -> [u8; FILEID_SIZE] {
    let mut buf = filename.as_bytes().to_vec();
    buf.extend_from_slice(&random_bytes(16));
    hash_sha256(&buf)[..FILEID_SIZE].try_into().unwrap()
}

fn connect_file_server(conf: &Config) -> Result<NetClient> {
    NetClient::connect(
        &conf.server_address,
        conf.server_fileport,
        &conf.server_hostname,
        &conf.server_certfile,
    )
}

/// Strip any directory components from a file name.
fn basename(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::FileTransferFailed(format!("invalid file name {:?}", path)))
}

/// Render a file size as a human readable string.
pub fn format_filesize(filesize: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * KB;
    const GB: u64 = MB * KB;

    if filesize < KB {
        format!("{} b", filesize)
    } else if filesize < MB {
        format!("{:.1} Kb", filesize as f64 / KB as f64)
    } else if filesize < GB {
        format!("{:.2} Mb", filesize as f64 / MB as f64)
    } else {
        format!("{:.3} Gb", filesize as f64 / GB as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_filesize() {
        assert_eq!(format_filesize(512), "512 b");
        assert_eq!(format_filesize(2048), "2.0 Kb");
        assert_eq!(format_filesize(1048576), "1.00 Mb");
        assert_eq!(format_filesize(3 * 1024 * 1024 * 1024), "3.000 Gb");
    }

    #[test]
    fn test_make_file_id() {
        let a = make_file_id("x.bin");
        let b = make_file_id("x.bin");
        assert_eq!(a.len(), FILEID_SIZE);
        // Random component must make ids unique per upload
        assert_ne!(a, b);
    }
}
