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
use std::io;
use std::path::{Path, PathBuf};

use rsa::RsaPublicKey;
use tracing::debug;
use uuid::Uuid;

use crate::crypt::{self, AES_KEY_SIZE};
use crate::error::{ProtoError, ProtoResult};
use crate::transfer_srv::messages::SendFilePacket;
use crate::user_file::UserFile;

pub struct User {
    uuid: Uuid,
    name: String,
    public_key: Option<RsaPublicKey>,
    aes_key: [u8; AES_KEY_SIZE],
    directory_path: PathBuf,
    file: Option<UserFile>,
}

impl User {
    pub fn uuid(&self) -> Uuid { self.uuid }

    pub fn name(&self) -> &str { &self.name }

    pub fn has_public_key(&self) -> bool { self.public_key.is_some() }

    pub fn aes_key(&self) -> &[u8; AES_KEY_SIZE] { &self.aes_key }

    pub fn directory_path(&self) -> &Path { &self.directory_path }

    pub fn file(&self) -> Option<&UserFile> { self.file.as_ref() }
}

/// The in-memory user store.  This is the only state shared between
/// connections; callers serialize access through a mutex, taking the lock
/// once per operation and never across socket I/O.
pub struct UserRegistry {
    users: HashMap<Uuid, User>,
    users_root: PathBuf,
}

impl UserRegistry {
    /// Creates the registry, along with the root directory that will hold
    /// one folder per registered user.
    pub fn new(users_root: impl Into<PathBuf>) -> io::Result<UserRegistry> {
        let users_root = users_root.into();
        std::fs::create_dir_all(&users_root)?;
        Ok(UserRegistry { users: HashMap::new(), users_root })
    }

    pub fn is_name_registered(&self, name: &str) -> bool {
        self.users.values().any(|user| user.name == name)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&User> {
        self.users.values().find(|user| user.name == name)
    }

    pub fn find_by_uuid(&self, uuid: Uuid) -> Option<&User> {
        self.users.get(&uuid)
    }

    pub fn contains_uuid(&self, uuid: Uuid) -> bool {
        self.users.contains_key(&uuid)
    }

    /// Adds a new user under a freshly minted uuid and creates their
    /// directory.  The AES key provisioned here is a placeholder; the key a
    /// client actually receives is minted when its public key arrives.
    pub fn register(&mut self, name: &str) -> ProtoResult<Uuid> {
        if self.is_name_registered(name) {
            return Err(ProtoError::AlreadyRegistered(name.to_string()));
        }

        let mut uuid = Uuid::new_v4();
        while self.users.contains_key(&uuid) {
            uuid = Uuid::new_v4();
        }

        let directory_path = self.users_root.join(uuid.to_string());
        std::fs::create_dir_all(&directory_path)?;

        self.users.insert(uuid, User {
            uuid,
            name: name.to_string(),
            public_key: None,
            aes_key: crypt::new_aes_key(),
            directory_path,
            file: None,
        });
        debug!("Registered '{name}' as {uuid}");
        Ok(uuid)
    }

    /// Stores the user's public key and rotates their AES key, returning
    /// the rotated key for delivery.
    pub fn set_public_key(&mut self, name: &str, public_key: RsaPublicKey)
        -> ProtoResult<[u8; AES_KEY_SIZE]>
    {
        let user = self.users.values_mut().find(|user| user.name == name)
            .ok_or_else(|| ProtoError::SequenceViolation(
                        format!("no registered user named '{name}'")))?;
        user.public_key = Some(public_key);
        user.aes_key = crypt::new_aes_key();
        Ok(user.aes_key)
    }

    /// Starts a new session for a returning user: rotates their AES key and
    /// clears any partially received packets (the file metadata survives, so
    /// a restarted transfer reuses the same destination).  Returns the
    /// stored public key with the fresh AES key for wrapping.
    pub fn begin_reconnect(&mut self, uuid: Uuid)
        -> ProtoResult<(RsaPublicKey, [u8; AES_KEY_SIZE])>
    {
        let user = self.users.get_mut(&uuid).ok_or(ProtoError::UnknownUser(uuid))?;
        let public_key = user.public_key.clone()
            .ok_or_else(|| ProtoError::SequenceViolation(
                        format!("user {uuid} has no public key on record")))?;
        user.aes_key = crypt::new_aes_key();
        if let Some(file) = &mut user.file {
            file.clear();
        }
        Ok((public_key, user.aes_key))
    }

    /// Stores one upload packet, lazily creating the user's file buffer from
    /// the first packet's metadata.  Returns true once every declared packet
    /// has arrived.
    pub fn save_packet(&mut self, uuid: Uuid, packet: SendFilePacket)
        -> ProtoResult<bool>
    {
        let user = self.users.get_mut(&uuid).ok_or(ProtoError::UnknownUser(uuid))?;

        let SendFilePacket {
            content_size, packet_number, total_packets, file_name, chunk, ..
        } = packet;

        let file_path = user.directory_path.join(&file_name);
        let file = user.file.get_or_insert_with(
            || UserFile::new(file_path, file_name, total_packets, content_size));
        file.add_packet(packet_number, chunk)?;
        Ok(file.is_complete())
    }

    /// Decrypts and persists a completed upload with the user's current AES
    /// key.  Returns the cleartext checksum and the ciphertext size for the
    /// completion response.
    pub fn finalize_file(&mut self, uuid: Uuid) -> ProtoResult<(u32, u32)> {
        let user = self.users.get_mut(&uuid).ok_or(ProtoError::UnknownUser(uuid))?;
        let aes_key = user.aes_key;
        let file = user.file.as_mut()
            .ok_or_else(|| ProtoError::SequenceViolation(
                        format!("user {uuid} has no upload in progress")))?;
        let checksum = file.finalize(&aes_key)?;
        Ok((checksum, file.encrypted_content_size()))
    }

    /// Drops the user's upload state entirely (abandoned transfer).
    pub fn clear_file(&mut self, uuid: Uuid) {
        if let Some(user) = self.users.get_mut(&uuid) {
            user.file = None;
        }
    }

    /// Removes the user only when both identity fields match an existing
    /// record; any mismatch leaves the registry untouched.
    pub fn remove_if_matches(&mut self, name: &str, uuid: Uuid) {
        if self.users.get(&uuid).is_some_and(|user| user.name == name) {
            debug!("Removing stale registration '{name}' ({uuid})");
            self.users.remove(&uuid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user_file::FILE_CHUNK_SIZE;

    fn test_registry() -> (tempfile::TempDir, UserRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = UserRegistry::new(dir.path().join("users")).unwrap();
        (dir, registry)
    }

    fn packet(number: u16, total: u16, content_size: u32) -> SendFilePacket {
        SendFilePacket {
            content_size,
            orig_size: content_size,
            packet_number: number,
            total_packets: total,
            file_name: "upload.bin".to_string(),
            chunk: vec![0u8; FILE_CHUNK_SIZE],
        }
    }

    #[test]
    fn test_register_uniqueness() {
        let (_dir, mut registry) = test_registry();

        let alice = registry.register("alice").unwrap();
        let bob = registry.register("bob").unwrap();
        assert_ne!(alice, bob);
        assert!(matches!(registry.register("alice"),
                         Err(ProtoError::AlreadyRegistered(_))));

        assert!(registry.is_name_registered("alice"));
        assert!(!registry.is_name_registered("carol"));
        assert_eq!(registry.find_by_name("bob").unwrap().uuid(), bob);
        assert_eq!(registry.find_by_uuid(alice).unwrap().name(), "alice");
        assert!(registry.find_by_uuid(alice).unwrap().directory_path().is_dir());
    }

    #[test]
    fn test_public_key_rotates_aes_key() {
        let (_dir, mut registry) = test_registry();
        let alice = registry.register("alice").unwrap();
        let initial_key = *registry.find_by_uuid(alice).unwrap().aes_key();

        let public_key = crate::crypt::testing::rsa_key().to_public_key();
        let rotated = registry.set_public_key("alice", public_key).unwrap();
        assert_ne!(rotated, initial_key);
        assert_eq!(registry.find_by_uuid(alice).unwrap().aes_key(), &rotated);
        assert!(registry.find_by_uuid(alice).unwrap().has_public_key());

        assert!(registry.set_public_key("carol",
                crate::crypt::testing::rsa_key().to_public_key()).is_err());
    }

    #[test]
    fn test_begin_reconnect() {
        let (_dir, mut registry) = test_registry();
        let alice = registry.register("alice").unwrap();

        // No public key on record yet
        assert!(matches!(registry.begin_reconnect(alice),
                         Err(ProtoError::SequenceViolation(_))));

        let public_key = crate::crypt::testing::rsa_key().to_public_key();
        let first_key = registry.set_public_key("alice", public_key.clone()).unwrap();

        // A partial upload's packets are dropped, but the file survives.
        registry.save_packet(alice, packet(0, 2, 2048)).unwrap();
        let (stored_key, fresh_key) = registry.begin_reconnect(alice).unwrap();
        assert_eq!(stored_key, public_key);
        assert_ne!(fresh_key, first_key);

        let file = registry.find_by_uuid(alice).unwrap().file().unwrap();
        assert_eq!(file.packet_count(), 0);
        assert_eq!(file.file_name(), "upload.bin");

        assert!(matches!(registry.begin_reconnect(Uuid::new_v4()),
                         Err(ProtoError::UnknownUser(_))));
    }

    #[test]
    fn test_save_packet() {
        let (_dir, mut registry) = test_registry();
        let alice = registry.register("alice").unwrap();

        assert!(matches!(registry.save_packet(Uuid::new_v4(), packet(0, 2, 2048)),
                         Err(ProtoError::UnknownUser(_))));

        assert!(!registry.save_packet(alice, packet(0, 2, 2048)).unwrap());
        // Duplicate delivery does not complete the upload early.
        assert!(!registry.save_packet(alice, packet(0, 2, 2048)).unwrap());
        assert!(registry.save_packet(alice, packet(1, 2, 2048)).unwrap());

        assert!(matches!(registry.save_packet(alice, packet(2, 2, 2048)),
                         Err(ProtoError::MalformedFrame(_))));

        registry.clear_file(alice);
        assert!(registry.find_by_uuid(alice).unwrap().file().is_none());
    }

    #[test]
    fn test_remove_if_matches() {
        let (_dir, mut registry) = test_registry();
        let alice = registry.register("alice").unwrap();

        registry.remove_if_matches("alice", Uuid::new_v4());
        registry.remove_if_matches("bob", alice);
        assert!(registry.contains_uuid(alice));

        registry.remove_if_matches("alice", alice);
        assert!(!registry.contains_uuid(alice));
    }
}
