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

use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::crypt::WRAPPED_AES_KEY_SIZE;
use crate::error::{ProtoError, ProtoResult};
use crate::net_io;
use crate::user_file::FILE_CHUNK_SIZE;

/// Version byte echoed in every response header.
pub const SERVER_VERSION: u8 = 3;

pub const REGISTER_REQUEST: u16 = 825;
pub const SEND_PUBLIC_KEY_REQUEST: u16 = 826;
pub const RECONNECT_REQUEST: u16 = 827;
pub const SEND_FILE_REQUEST: u16 = 828;
pub const CRC_CONFIRM_OK: u16 = 900;
pub const CRC_CONFIRM_RETRY: u16 = 901;
pub const CRC_CONFIRM_GIVE_UP: u16 = 902;

const REGISTER_OK: u16 = 1600;
const REGISTER_FAILED: u16 = 1601;
const AES_KEY_DELIVERY: u16 = 1602;
const FILE_RECEIVED: u16 = 1603;
const THANKS: u16 = 1604;
const RECONNECT_ACCEPTED: u16 = 1605;
const RECONNECT_REJECTED: u16 = 1606;
const GENERAL_ERROR: u16 = 1607;

/// All text fields on the wire (usernames and file names) occupy this many
/// NUL padded bytes.
pub const NAME_FIELD_SIZE: usize = 255;
pub const PUBLIC_KEY_FIELD_SIZE: usize = 160;

const NAME_PAYLOAD_SIZE: u32 = NAME_FIELD_SIZE as u32;
const PUBLIC_KEY_PAYLOAD_SIZE: u32 = (NAME_FIELD_SIZE + PUBLIC_KEY_FIELD_SIZE) as u32;
const SEND_FILE_PAYLOAD_SIZE: u32 = (12 + NAME_FIELD_SIZE + FILE_CHUNK_SIZE) as u32;
const AES_KEY_PAYLOAD_SIZE: u32 = (net_io::UUID_SIZE + WRAPPED_AES_KEY_SIZE) as u32;
const FILE_RECEIVED_PAYLOAD_SIZE: u32 = (net_io::UUID_SIZE + 8 + NAME_FIELD_SIZE) as u32;
const THANKS_PAYLOAD_SIZE: u32 = NAME_FIELD_SIZE as u32;

/// Fixed 23-byte header preceding every client request.
#[derive(Clone, Debug)]
pub struct RequestHeader {
    pub client_id: Uuid,
    pub client_version: u8,
    pub code: u16,
    pub payload_size: u32,
}

impl RequestHeader {
    pub const SIZE: usize = 23;

    pub async fn read<S>(stream: &mut S) -> ProtoResult<RequestHeader>
        where S: AsyncRead + Unpin
    {
        let mut buffer = [0u8; Self::SIZE];
        stream.read_exact(&mut buffer).await?;

        let mut cursor = Cursor::new(buffer);
        let client_id = net_io::read_uuid(&mut cursor)?;
        let client_version = ReadBytesExt::read_u8(&mut cursor)?;
        let code = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)?;
        let payload_size = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;

        Ok(RequestHeader { client_id, client_version, code, payload_size })
    }
}

async fn read_payload<S>(stream: &mut S, header: &RequestHeader, expected: u32)
    -> ProtoResult<Vec<u8>>
    where S: AsyncRead + Unpin
{
    if header.payload_size != expected {
        return Err(ProtoError::MalformedFrame(
                   format!("request code {} declares a {} byte payload; expected {}",
                           header.code, header.payload_size, expected)));
    }
    let mut buffer = vec![0u8; expected as usize];
    stream.read_exact(&mut buffer).await?;
    Ok(buffer)
}

/// Skips over the payload of a request that will not be interpreted, so an
/// error response never leaves unread bytes behind on the connection.
pub async fn discard_payload<S>(stream: &mut S, header: &RequestHeader)
    -> ProtoResult<()>
    where S: AsyncRead + Unpin
{
    let mut remaining = header.payload_size as usize;
    let mut scratch = [0u8; 1024];
    while remaining > 0 {
        let take = remaining.min(scratch.len());
        let count = stream.read(&mut scratch[..take]).await?;
        if count == 0 {
            break;
        }
        remaining -= count;
    }
    Ok(())
}

/// Reads the single-name payload shared by the Register, Reconnect, and
/// checksum confirmation requests.
pub async fn read_name_payload<S>(stream: &mut S, header: &RequestHeader)
    -> ProtoResult<String>
    where S: AsyncRead + Unpin
{
    let buffer = read_payload(stream, header, NAME_PAYLOAD_SIZE).await?;
    net_io::read_utf8_field(&mut Cursor::new(buffer), NAME_FIELD_SIZE)
}

/// Reads a SendPublicKey payload: the registered name echoed back, followed
/// by the raw 160-byte public key field.
pub async fn read_public_key_payload<S>(stream: &mut S, header: &RequestHeader)
    -> ProtoResult<(String, Vec<u8>)>
    where S: AsyncRead + Unpin
{
    let buffer = read_payload(stream, header, PUBLIC_KEY_PAYLOAD_SIZE).await?;
    let mut cursor = Cursor::new(buffer);
    let name = net_io::read_utf8_field(&mut cursor, NAME_FIELD_SIZE)?;
    let mut public_key = vec![0u8; PUBLIC_KEY_FIELD_SIZE];
    std::io::Read::read_exact(&mut cursor, &mut public_key)?;
    Ok((name, public_key))
}

/// One slice of an uploaded file.  `chunk` is always a full 1024-byte slot;
/// the final packet's slot is zero padded past `content_size`.
pub struct SendFilePacket {
    pub content_size: u32,
    pub orig_size: u32,
    pub packet_number: u16,
    pub total_packets: u16,
    pub file_name: String,
    pub chunk: Vec<u8>,
}

impl SendFilePacket {
    pub async fn read<S>(stream: &mut S, header: &RequestHeader)
        -> ProtoResult<SendFilePacket>
        where S: AsyncRead + Unpin
    {
        let buffer = read_payload(stream, header, SEND_FILE_PAYLOAD_SIZE).await?;
        let mut cursor = Cursor::new(buffer);

        let content_size = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;
        let orig_size = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;
        let packet_number = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)?;
        let total_packets = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)?;
        let file_name = net_io::read_utf8_field(&mut cursor, NAME_FIELD_SIZE)?;
        let mut chunk = vec![0u8; FILE_CHUNK_SIZE];
        std::io::Read::read_exact(&mut cursor, &mut chunk)?;

        Ok(SendFilePacket {
            content_size, orig_size, packet_number, total_packets, file_name,
            chunk,
        })
    }
}

pub enum TransferToCli {
    RegisterOk { client_id: Uuid },
    RegisterFail,
    AesKey {
        client_id: Uuid,
        wrapped_key: Vec<u8>,
    },
    FileReceived {
        client_id: Uuid,
        encrypted_size: u32,
        file_name: String,
        checksum: u32,
    },
    Thanks { client_id: Uuid },
    ReconnectAesKey {
        client_id: Uuid,
        wrapped_key: Vec<u8>,
    },
    ReconnectRejected { client_id: Uuid },
    GeneralError,
}

fn write_header(stream: &mut dyn Write, code: u16, payload_size: u32)
    -> std::io::Result<()>
{
    stream.write_u8(SERVER_VERSION)?;
    stream.write_u16::<LittleEndian>(code)?;
    stream.write_u32::<LittleEndian>(payload_size)
}

fn write_wrapped_key(stream: &mut dyn Write, code: u16, client_id: &Uuid,
                     wrapped_key: &[u8]) -> ProtoResult<()>
{
    if wrapped_key.len() != WRAPPED_AES_KEY_SIZE {
        return Err(ProtoError::MalformedFrame(
                   format!("wrapped AES key is {} bytes; the wire field holds {}",
                           wrapped_key.len(), WRAPPED_AES_KEY_SIZE)));
    }
    write_header(stream, code, AES_KEY_PAYLOAD_SIZE)?;
    net_io::write_uuid(stream, client_id)?;
    stream.write_all(wrapped_key)?;
    Ok(())
}

impl TransferToCli {
    fn stream_write(&self, stream: &mut dyn Write) -> ProtoResult<()> {
        match self {
            TransferToCli::RegisterOk { client_id } => {
                write_header(stream, REGISTER_OK, net_io::UUID_SIZE as u32)?;
                net_io::write_uuid(stream, client_id)?;
            }
            TransferToCli::RegisterFail => {
                write_header(stream, REGISTER_FAILED, 0)?;
            }
            TransferToCli::AesKey { client_id, wrapped_key } => {
                write_wrapped_key(stream, AES_KEY_DELIVERY, client_id, wrapped_key)?;
            }
            TransferToCli::FileReceived { client_id, encrypted_size, file_name,
                                          checksum } => {
                write_header(stream, FILE_RECEIVED, FILE_RECEIVED_PAYLOAD_SIZE)?;
                net_io::write_uuid(stream, client_id)?;
                stream.write_u32::<LittleEndian>(*encrypted_size)?;
                net_io::write_utf8_field(stream, file_name, NAME_FIELD_SIZE)?;
                stream.write_u32::<LittleEndian>(*checksum)?;
            }
            TransferToCli::Thanks { client_id } => {
                write_header(stream, THANKS, THANKS_PAYLOAD_SIZE)?;
                net_io::write_uuid(stream, client_id)?;
                stream.write_all(&[0u8; THANKS_PAYLOAD_SIZE as usize - net_io::UUID_SIZE])?;
            }
            TransferToCli::ReconnectAesKey { client_id, wrapped_key } => {
                write_wrapped_key(stream, RECONNECT_ACCEPTED, client_id, wrapped_key)?;
            }
            TransferToCli::ReconnectRejected { client_id } => {
                write_header(stream, RECONNECT_REJECTED, net_io::UUID_SIZE as u32)?;
                net_io::write_uuid(stream, client_id)?;
            }
            TransferToCli::GeneralError => {
                write_header(stream, GENERAL_ERROR, 0)?;
            }
        }
        Ok(())
    }

    /// Packs the response and sends it as a single chunk of data.
    pub async fn write<S>(&self, stream: &mut S) -> ProtoResult<()>
        where S: AsyncWrite + Unpin
    {
        let mut buffer = Cursor::new(Vec::new());
        self.stream_write(&mut buffer)?;
        stream.write_all(buffer.get_ref()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE_HEADER_SIZE: usize = 7;

    fn request_bytes(client_id: &Uuid, code: u16, payload_size: u32) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        net_io::write_uuid(&mut buffer, client_id).unwrap();
        byteorder::WriteBytesExt::write_u8(&mut buffer, SERVER_VERSION).unwrap();
        byteorder::WriteBytesExt::write_u16::<LittleEndian>(&mut buffer, code).unwrap();
        byteorder::WriteBytesExt::write_u32::<LittleEndian>(&mut buffer, payload_size).unwrap();
        buffer.into_inner()
    }

    async fn packed(response: &TransferToCli) -> Vec<u8> {
        let mut buffer = Vec::new();
        response.write(&mut buffer).await.unwrap();
        buffer
    }

    #[tokio::test]
    async fn test_request_header_layout() {
        let client_id = Uuid::new_v4();
        let bytes = request_bytes(&client_id, REGISTER_REQUEST, 255);
        assert_eq!(bytes.len(), RequestHeader::SIZE);

        let mut stream: &[u8] = &bytes;
        let header = RequestHeader::read(&mut stream).await.unwrap();
        assert_eq!(header.client_id, client_id);
        assert_eq!(header.client_version, 3);
        assert_eq!(header.code, 825);
        assert_eq!(header.payload_size, 255);
    }

    #[tokio::test]
    async fn test_name_payload() {
        let client_id = Uuid::nil();
        let header = RequestHeader {
            client_id,
            client_version: 3,
            code: REGISTER_REQUEST,
            payload_size: 255,
        };

        let mut payload = vec![0u8; NAME_FIELD_SIZE];
        payload[..5].copy_from_slice(b"alice");
        let mut stream: &[u8] = &payload;
        assert_eq!(read_name_payload(&mut stream, &header).await.unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_name_payload_size_mismatch() {
        let header = RequestHeader {
            client_id: Uuid::nil(),
            client_version: 3,
            code: REGISTER_REQUEST,
            payload_size: 254,
        };
        let payload = vec![0u8; 254];
        let mut stream: &[u8] = &payload;
        assert!(matches!(read_name_payload(&mut stream, &header).await,
                         Err(ProtoError::MalformedFrame(_))));
    }

    #[tokio::test]
    async fn test_public_key_payload() {
        let header = RequestHeader {
            client_id: Uuid::nil(),
            client_version: 3,
            code: SEND_PUBLIC_KEY_REQUEST,
            payload_size: 415,
        };

        let mut payload = vec![0u8; 415];
        payload[..3].copy_from_slice(b"bob");
        payload[NAME_FIELD_SIZE..].copy_from_slice(&[0xA5u8; PUBLIC_KEY_FIELD_SIZE]);
        let mut stream: &[u8] = &payload;
        let (name, public_key) = read_public_key_payload(&mut stream, &header)
                .await.unwrap();
        assert_eq!(name, "bob");
        assert_eq!(public_key, vec![0xA5u8; PUBLIC_KEY_FIELD_SIZE]);
    }

    #[tokio::test]
    async fn test_send_file_payload() {
        let header = RequestHeader {
            client_id: Uuid::nil(),
            client_version: 3,
            code: SEND_FILE_REQUEST,
            payload_size: 1291,
        };

        let mut payload = Cursor::new(Vec::new());
        byteorder::WriteBytesExt::write_u32::<LittleEndian>(&mut payload, 2048).unwrap();
        byteorder::WriteBytesExt::write_u32::<LittleEndian>(&mut payload, 2033).unwrap();
        byteorder::WriteBytesExt::write_u16::<LittleEndian>(&mut payload, 1).unwrap();
        byteorder::WriteBytesExt::write_u16::<LittleEndian>(&mut payload, 2).unwrap();
        net_io::write_utf8_field(&mut payload, "notes.txt", NAME_FIELD_SIZE).unwrap();
        std::io::Write::write_all(&mut payload, &[0x42u8; FILE_CHUNK_SIZE]).unwrap();
        let payload = payload.into_inner();
        assert_eq!(payload.len(), 1291);

        let mut stream: &[u8] = &payload;
        let packet = SendFilePacket::read(&mut stream, &header).await.unwrap();
        assert_eq!(packet.content_size, 2048);
        assert_eq!(packet.orig_size, 2033);
        assert_eq!(packet.packet_number, 1);
        assert_eq!(packet.total_packets, 2);
        assert_eq!(packet.file_name, "notes.txt");
        assert_eq!(packet.chunk, vec![0x42u8; FILE_CHUNK_SIZE]);
    }

    #[tokio::test]
    async fn test_register_ok_layout() {
        let client_id = Uuid::new_v4();
        let bytes = packed(&TransferToCli::RegisterOk { client_id }).await;

        assert_eq!(bytes.len(), RESPONSE_HEADER_SIZE + 16);
        assert_eq!(bytes[0], SERVER_VERSION);
        assert_eq!(bytes[1..3], 1600u16.to_le_bytes());
        assert_eq!(bytes[3..7], 16u32.to_le_bytes());
        assert_eq!(&bytes[7..], client_id.as_bytes());
    }

    #[tokio::test]
    async fn test_empty_payload_responses() {
        let bytes = packed(&TransferToCli::RegisterFail).await;
        assert_eq!(bytes, [3, 0x41, 0x06, 0, 0, 0, 0]);

        let bytes = packed(&TransferToCli::GeneralError).await;
        assert_eq!(bytes, [3, 0x47, 0x06, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_aes_key_layout() {
        let client_id = Uuid::new_v4();
        let wrapped_key = vec![0x7Fu8; WRAPPED_AES_KEY_SIZE];
        let bytes = packed(&TransferToCli::AesKey {
            client_id,
            wrapped_key: wrapped_key.clone(),
        }).await;

        assert_eq!(bytes.len(), RESPONSE_HEADER_SIZE + 144);
        assert_eq!(bytes[1..3], 1602u16.to_le_bytes());
        assert_eq!(bytes[3..7], 144u32.to_le_bytes());
        assert_eq!(&bytes[7..23], client_id.as_bytes());
        assert_eq!(&bytes[23..], wrapped_key.as_slice());

        // A wrapped key that does not fill its field is a codec error.
        let short = TransferToCli::AesKey {
            client_id,
            wrapped_key: vec![0u8; 64],
        };
        let mut sink = Vec::new();
        assert!(short.write(&mut sink).await.is_err());
    }

    #[tokio::test]
    async fn test_file_received_layout() {
        let client_id = Uuid::new_v4();
        let bytes = packed(&TransferToCli::FileReceived {
            client_id,
            encrypted_size: 16,
            file_name: "hello.txt".to_string(),
            checksum: 0xDEAD_BEEF,
        }).await;

        assert_eq!(bytes.len(), RESPONSE_HEADER_SIZE + 279);
        assert_eq!(bytes[1..3], 1603u16.to_le_bytes());
        assert_eq!(bytes[3..7], 279u32.to_le_bytes());
        assert_eq!(&bytes[7..23], client_id.as_bytes());
        assert_eq!(bytes[23..27], 16u32.to_le_bytes());
        assert_eq!(&bytes[27..36], b"hello.txt");
        assert!(bytes[36..282].iter().all(|byte| *byte == 0));
        assert_eq!(bytes[282..286], 0xDEAD_BEEFu32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_thanks_layout() {
        let client_id = Uuid::new_v4();
        let bytes = packed(&TransferToCli::Thanks { client_id }).await;

        assert_eq!(bytes.len(), RESPONSE_HEADER_SIZE + 255);
        assert_eq!(bytes[1..3], 1604u16.to_le_bytes());
        assert_eq!(bytes[3..7], 255u32.to_le_bytes());
        assert_eq!(&bytes[7..23], client_id.as_bytes());
        assert!(bytes[23..].iter().all(|byte| *byte == 0));
    }
}
