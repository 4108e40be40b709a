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

use thiserror::Error;
use uuid::Uuid;

pub type ProtoResult<T> = Result<T, ProtoError>;

/// Failure classes of the transfer protocol.  The engines pick the response
/// sent to the client (if any) from the variant, so wire-level failures and
/// registry-level failures stay distinguishable all the way up.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// A header or payload disagrees with the fixed layout for its request
    /// code, or a text field does not decode as UTF-8.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A Register request carried a username that is already taken.
    #[error("username '{0}' is already registered")]
    AlreadyRegistered(String),

    /// The client id in a SendFile request is not in the registry.
    #[error("unknown client {0}")]
    UnknownUser(Uuid),

    /// A request arrived out of order, with the wrong code, or with
    /// mismatched identity fields for the current point in the dialog.
    #[error("protocol sequence violation: {0}")]
    SequenceViolation(String),

    /// The client's public key field did not parse as an RSA public key.
    #[error("could not import client public key: {0}")]
    InvalidPublicKey(String),

    /// AES decryption of the reassembled upload produced invalid padding.
    #[error("bad padding in decrypted file content")]
    BadPadding,

    /// A completed upload was missing a packet at finalization time.
    #[error("upload is missing packet {0}")]
    IncompletePacketSet(u16),

    /// The checksum confirmation request carried a code other than the
    /// three the client is allowed to answer with.
    #[error("unrecognized checksum confirmation code {0}")]
    BadConfirmationCode(u16),

    /// RSA wrap, RNG, or cipher-setup failure.
    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
