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

use std::io::{self, Read, Write};

use uuid::Uuid;

use crate::error::{ProtoError, ProtoResult};

pub const UUID_SIZE: usize = 16;

/// Reads a fixed-width NUL padded UTF-8 text field.  Only trailing NUL
/// bytes are trimmed; an embedded NUL stays part of the value.
pub fn read_utf8_field<S>(stream: &mut S, width: usize) -> ProtoResult<String>
    where S: Read
{
    let mut buffer = vec![0u8; width];
    stream.read_exact(&mut buffer)?;
    let end = buffer.iter().rposition(|byte| *byte != 0).map_or(0, |pos| pos + 1);
    match std::str::from_utf8(&buffer[..end]) {
        Ok(value) => Ok(value.to_string()),
        Err(err) => Err(ProtoError::MalformedFrame(
                        format!("invalid UTF-8 in text field: {err}"))),
    }
}

/// Writes `value` into a fixed-width field, padding the remainder with NUL
/// bytes.
pub fn write_utf8_field(stream: &mut dyn Write, value: &str, width: usize)
    -> ProtoResult<()>
{
    if value.len() > width {
        return Err(ProtoError::MalformedFrame(
                   format!("text value of {} bytes exceeds its {} byte field",
                           value.len(), width)));
    }
    stream.write_all(value.as_bytes())?;
    stream.write_all(&vec![0u8; width - value.len()])?;
    Ok(())
}

pub fn read_uuid<S>(stream: &mut S) -> io::Result<Uuid>
    where S: Read
{
    let mut buffer = [0u8; UUID_SIZE];
    stream.read_exact(&mut buffer)?;
    Ok(Uuid::from_bytes(buffer))
}

pub fn write_uuid(stream: &mut dyn Write, value: &Uuid) -> io::Result<()> {
    stream.write_all(value.as_bytes())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_utf8_field_trimming() {
        let mut field = [0u8; 16];
        field[..5].copy_from_slice(b"alice");
        assert_eq!(read_utf8_field(&mut Cursor::new(field), 16).unwrap(), "alice");

        // Only trailing NULs are padding; an embedded NUL is data.
        let mut field = [0u8; 16];
        field[..6].copy_from_slice(b"ali\0ce");
        assert_eq!(read_utf8_field(&mut Cursor::new(field), 16).unwrap(), "ali\0ce");

        let field = [0u8; 16];
        assert_eq!(read_utf8_field(&mut Cursor::new(field), 16).unwrap(), "");
    }

    #[test]
    fn test_utf8_field_rejects_invalid() {
        let mut field = [0u8; 8];
        field[..2].copy_from_slice(&[0xC3, 0x28]);
        assert!(matches!(read_utf8_field(&mut Cursor::new(field), 8),
                         Err(ProtoError::MalformedFrame(_))));
    }

    #[test]
    fn test_utf8_field_round_trip() {
        let mut buffer = Cursor::new(Vec::new());
        write_utf8_field(&mut buffer, "transfer.bin", 255).unwrap();
        assert_eq!(buffer.get_ref().len(), 255);
        buffer.set_position(0);
        assert_eq!(read_utf8_field(&mut buffer, 255).unwrap(), "transfer.bin");

        let mut buffer = Cursor::new(Vec::new());
        assert!(write_utf8_field(&mut buffer, "toolong", 4).is_err());
    }

    #[test]
    fn test_uuid_round_trip() {
        let uuid = Uuid::new_v4();
        let mut buffer = Cursor::new(Vec::new());
        write_uuid(&mut buffer, &uuid).unwrap();
        assert_eq!(buffer.get_ref().len(), UUID_SIZE);
        buffer.set_position(0);
        assert_eq!(read_uuid(&mut buffer).unwrap(), uuid);
    }
}
