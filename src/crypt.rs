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

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use crc::{CRC_32_CKSUM, Crc};
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;

use crate::error::{ProtoError, ProtoResult};

pub const AES_KEY_SIZE: usize = 32;

/// Length of the RSA-wrapped AES key on the wire.  The client uses a
/// 1024-bit RSA key, so the OAEP ciphertext is always one modulus wide.
pub const WRAPPED_AES_KEY_SIZE: usize = 128;

const CBC_IV_SIZE: usize = 16;

// The checksum agreement with the client is POSIX cksum.
const CKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_CKSUM);

pub fn new_aes_key() -> [u8; AES_KEY_SIZE] {
    let mut key = [0u8; AES_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Imports the RSA public key from its fixed 160-byte wire field.  The
/// field is zero padded past the end of the DER data, and clients encode
/// either a SubjectPublicKeyInfo or a bare PKCS#1 key.
pub fn import_public_key(wire_key: &[u8]) -> ProtoResult<RsaPublicKey> {
    let end = wire_key.iter().rposition(|byte| *byte != 0).map_or(0, |pos| pos + 1);
    let der = &wire_key[..end];
    RsaPublicKey::from_public_key_der(der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(der))
        .map_err(|err| ProtoError::InvalidPublicKey(err.to_string()))
}

/// Wraps an AES key with RSA-OAEP.  SHA-1 is the digest and MGF1 hash the
/// deployed clients expect.
pub fn wrap_aes_key(aes_key: &[u8], public_key: &RsaPublicKey)
    -> ProtoResult<Vec<u8>>
{
    let mut rng = rand::rngs::OsRng;
    let wrapped = public_key.encrypt(&mut rng, Oaep::new::<Sha1>(), aes_key)
        .map_err(|err| ProtoError::Crypto(format!("RSA key wrap failed: {err}")))?;
    if wrapped.len() != WRAPPED_AES_KEY_SIZE {
        return Err(ProtoError::Crypto(
                   format!("wrapped key is {} bytes; the wire format carries {}",
                           wrapped.len(), WRAPPED_AES_KEY_SIZE)));
    }
    Ok(wrapped)
}

/// Decrypts an uploaded file with AES-CBC and strips the PKCS#7 padding.
/// The all-zero IV is a compatibility constant with the deployed client and
/// must match it exactly.
pub fn decrypt_file(ciphertext: &[u8], aes_key: &[u8]) -> ProtoResult<Vec<u8>> {
    let iv = [0u8; CBC_IV_SIZE];
    let cleartext = match aes_key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(aes_key, &iv)
                .map_err(|err| ProtoError::Crypto(err.to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(aes_key, &iv)
                .map_err(|err| ProtoError::Crypto(err.to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(aes_key, &iv)
                .map_err(|err| ProtoError::Crypto(err.to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        length => {
            return Err(ProtoError::Crypto(format!("invalid AES key length {length}")));
        }
    };
    cleartext.map_err(|_| ProtoError::BadPadding)
}

pub fn checksum(data: &[u8]) -> u32 {
    CKSUM.checksum(data)
}
