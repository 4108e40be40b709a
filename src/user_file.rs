/* This file is part of filedrop.
 *
 * filedrop is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * filedrop is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with filedrop.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use crate::crypt;
use crate::error::{ProtoError, ProtoResult};

/// Every SendFile packet carries exactly this many ciphertext bytes; the
/// final packet of an upload is zero padded up to it.
pub const FILE_CHUNK_SIZE: usize = 1024;

/// Reassembly buffer for one in-flight upload.  Packets may arrive in any
/// order; the declared metadata comes from whichever packet arrived first.
pub struct UserFile {
    file_name: String,
    total_packets: u16,
    encrypted_content_size: u32,
    packets: HashMap<u16, Vec<u8>>,
    crc: Option<u32>,
    file_path: PathBuf,
}

impl UserFile {
    pub fn new(file_path: PathBuf, file_name: String, total_packets: u16,
               encrypted_content_size: u32) -> UserFile
    {
        UserFile {
            file_name,
            total_packets,
            encrypted_content_size,
            packets: HashMap::new(),
            crc: None,
            file_path,
        }
    }

    pub fn file_name(&self) -> &str { &self.file_name }

    pub fn total_packets(&self) -> u16 { self.total_packets }

    pub fn encrypted_content_size(&self) -> u32 { self.encrypted_content_size }

    pub fn crc(&self) -> Option<u32> { self.crc }

    /// Records one packet.  Re-delivery of the same packet number replaces
    /// the previous chunk, so duplicates leave the buffer unchanged.
    pub fn add_packet(&mut self, number: u16, chunk: Vec<u8>) -> ProtoResult<()> {
        if number >= self.total_packets {
            return Err(ProtoError::MalformedFrame(
                       format!("packet number {} out of range for a {} packet upload",
                               number, self.total_packets)));
        }
        self.packets.insert(number, chunk);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.packets.len() == usize::from(self.total_packets)
    }

    /// Drops all received packets, keeping the file metadata.  Used when the
    /// client restarts the transfer from the beginning.
    pub fn clear(&mut self) {
        self.packets.clear();
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    fn assemble(&self) -> ProtoResult<Vec<u8>> {
        let mut ciphertext = Vec::with_capacity(self.encrypted_content_size as usize);
        for number in 0..self.total_packets {
            let chunk = self.packets.get(&number)
                    .ok_or(ProtoError::IncompletePacketSet(number))?;
            // The last packet's slot is only partially filled; everything
            // past the declared ciphertext size is padding.
            let remaining = (self.encrypted_content_size as usize)
                    .saturating_sub(usize::from(number) * FILE_CHUNK_SIZE);
            let take = remaining.min(FILE_CHUNK_SIZE).min(chunk.len());
            ciphertext.extend_from_slice(&chunk[..take]);
        }
        Ok(ciphertext)
    }

    /// Decrypts the reassembled upload, writes the cleartext to the user's
    /// directory (replacing any previous version), and records its checksum.
    pub fn finalize(&mut self, aes_key: &[u8]) -> ProtoResult<u32> {
        let ciphertext = self.assemble()?;
        let cleartext = crypt::decrypt_file(&ciphertext, aes_key)?;

        let mut file = File::create(&self.file_path)?;
        file.write_all(&cleartext)?;

        let crc = crypt::checksum(&cleartext);
        self.crc = Some(crc);
        Ok(crc)
    }
}
