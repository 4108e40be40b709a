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

use std::io::ErrorKind;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::crypt;
use crate::error::{ProtoError, ProtoResult};
use crate::registry::UserRegistry;
use super::messages::{
    self, RequestHeader, SendFilePacket, TransferToCli,
    CRC_CONFIRM_GIVE_UP, CRC_CONFIRM_OK, CRC_CONFIRM_RETRY,
    RECONNECT_REQUEST, REGISTER_REQUEST, SEND_FILE_REQUEST,
    SEND_PUBLIC_KEY_REQUEST,
};

type SharedRegistry = Arc<Mutex<UserRegistry>>;

pub struct TransferServer {
    incoming_send: mpsc::Sender<TcpStream>,
}

impl TransferServer {
    pub fn start(config: &ServerConfig) -> anyhow::Result<TransferServer> {
        let registry = UserRegistry::new(&config.users_root)
            .with_context(|| format!("Failed to create users directory {}",
                                     config.users_root.display()))?;
        let registry = Arc::new(Mutex::new(registry));

        let (incoming_send, mut incoming_recv) = mpsc::channel(5);
        tokio::spawn(async move {
            while let Some(sock) = incoming_recv.recv().await {
                let registry = registry.clone();
                tokio::spawn(async move {
                    transfer_client(sock, registry).await;
                });
            }
        });
        Ok(TransferServer { incoming_send })
    }

    pub async fn add(&mut self, sock: TcpStream) {
        if let Err(err) = self.incoming_send.send(sock).await {
            error!("Failed to add client: {err}");
            std::process::exit(1);
        }
    }
}

async fn transfer_client(mut sock: TcpStream, registry: SharedRegistry) {
    let peer = sock.peer_addr()
        .map_or_else(|_| "<unknown>".to_string(), |addr| addr.to_string());
    debug!("Connection from {peer}");

    match handle_connection(&mut sock, &registry).await {
        Ok(()) => debug!("Finished with client {peer}"),
        Err(ProtoError::Io(err))
                if matches!(err.kind(),
                            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset) => {
            debug!("Client {peer} disconnected");
        }
        Err(err) => warn!("Client {peer}: {err}"),
    }
}

/// Drives one connection from the first request header to the end of its
/// dialog.  Authentication (register or reconnect) comes first; a file
/// upload may follow on the same connection.
async fn handle_connection(sock: &mut TcpStream, registry: &SharedRegistry)
    -> ProtoResult<()>
{
    let header = RequestHeader::read(sock).await?;
    let authenticated = match header.code {
        REGISTER_REQUEST => run_register(sock, registry, &header).await?,
        RECONNECT_REQUEST => run_reconnect(sock, registry, &header).await?,
        code => {
            warn!("Unexpected opening request code {code}");
            messages::discard_payload(sock, &header).await?;
            TransferToCli::GeneralError.write(sock).await?;
            return Ok(());
        }
    };
    if !authenticated {
        return Ok(());
    }

    let next = match RequestHeader::read(sock).await {
        Ok(next) => next,
        Err(ProtoError::Io(err))
                if matches!(err.kind(),
                            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset) => {
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    if next.code == SEND_FILE_REQUEST {
        run_send_file(sock, registry, next).await?;
    } else {
        debug!("Ignoring trailing request code {} after authentication", next.code);
    }
    Ok(())
}

/// Maps an engine failure to its response.  Transport errors propagate (the
/// peer is gone); everything else is answered with at most one error
/// response before the dispatcher closes the connection.
async fn fail_with(sock: &mut TcpStream, err: ProtoError, response: TransferToCli)
    -> ProtoResult<bool>
{
    if let ProtoError::Io(err) = err {
        return Err(ProtoError::Io(err));
    }
    warn!("{err}");
    response.write(sock).await?;
    Ok(false)
}

async fn run_register(sock: &mut TcpStream, registry: &SharedRegistry,
                      header: &RequestHeader) -> ProtoResult<bool>
{
    match register_protocol(sock, registry, header).await {
        Ok(()) => Ok(true),
        Err(err @ ProtoError::AlreadyRegistered(_)) => {
            fail_with(sock, err, TransferToCli::RegisterFail).await
        }
        Err(err) => fail_with(sock, err, TransferToCli::GeneralError).await,
    }
}

async fn register_protocol(sock: &mut TcpStream, registry: &SharedRegistry,
                           header: &RequestHeader) -> ProtoResult<()>
{
    let name = messages::read_name_payload(sock, header).await?;
    let client_id = registry.lock().await.register(&name)?;
    info!("Registered user '{name}' as {client_id}");
    TransferToCli::RegisterOk { client_id }.write(sock).await?;

    key_exchange(sock, registry, &name, client_id).await
}

/// The public key sub-dialog shared by registration and rejected
/// reconnects: receive the client's RSA key, rotate the AES key, and
/// deliver the new key wrapped.
async fn key_exchange(sock: &mut TcpStream, registry: &SharedRegistry,
                      name: &str, client_id: Uuid) -> ProtoResult<()>
{
    let header = RequestHeader::read(sock).await?;
    if header.code != SEND_PUBLIC_KEY_REQUEST || header.client_id != client_id {
        messages::discard_payload(sock, &header).await?;
        return Err(ProtoError::SequenceViolation(
                   format!("expected public key delivery for {client_id}; \
                            got code {} from {}", header.code, header.client_id)));
    }

    let (payload_name, wire_key) = messages::read_public_key_payload(sock, &header).await?;
    if payload_name != name {
        return Err(ProtoError::SequenceViolation(
                   format!("public key delivered for '{payload_name}' during \
                            key exchange with '{name}'")));
    }

    let public_key = crypt::import_public_key(&wire_key)?;
    let aes_key = registry.lock().await.set_public_key(name, public_key.clone())?;
    let wrapped_key = crypt::wrap_aes_key(&aes_key, &public_key)?;
    debug!("Delivering wrapped AES key to {client_id}");
    TransferToCli::AesKey { client_id, wrapped_key }.write(sock).await?;
    Ok(())
}

async fn run_reconnect(sock: &mut TcpStream, registry: &SharedRegistry,
                       header: &RequestHeader) -> ProtoResult<bool>
{
    match reconnect_protocol(sock, registry, header).await {
        Ok(()) => Ok(true),
        Err(err) => fail_with(sock, err, TransferToCli::GeneralError).await,
    }
}

async fn reconnect_protocol(sock: &mut TcpStream, registry: &SharedRegistry,
                            header: &RequestHeader) -> ProtoResult<()>
{
    let name = messages::read_name_payload(sock, header).await?;
    let client_id = header.client_id;

    // A reconnect is honored only for a known name whose uuid resolves to a
    // user that already completed a key exchange.  Anything else falls back
    // to a fresh registration.
    let session = {
        let mut reg = registry.lock().await;
        if reg.is_name_registered(&name)
                && reg.find_by_uuid(client_id).is_some_and(|user| user.has_public_key())
        {
            Some(reg.begin_reconnect(client_id)?)
        } else {
            None
        }
    };

    if let Some((public_key, aes_key)) = session {
        let wrapped_key = crypt::wrap_aes_key(&aes_key, &public_key)?;
        info!("Accepted reconnect for '{name}' ({client_id})");
        TransferToCli::ReconnectAesKey { client_id, wrapped_key }.write(sock).await?;
    } else {
        info!("Rejected reconnect for '{name}' ({client_id}); re-registering");
        let new_id = {
            let mut reg = registry.lock().await;
            reg.remove_if_matches(&name, client_id);
            reg.register(&name)?
        };
        // The rejection reply carries the replacement uuid, which the
        // client must use from here on.
        TransferToCli::ReconnectRejected { client_id: new_id }.write(sock).await?;
        key_exchange(sock, registry, &name, new_id).await?;
    }
    Ok(())
}

async fn run_send_file(sock: &mut TcpStream, registry: &SharedRegistry,
                       header: RequestHeader) -> ProtoResult<()>
{
    match send_file_protocol(sock, registry, header).await {
        Ok(()) => Ok(()),
        Err(ProtoError::Io(err)) => Err(ProtoError::Io(err)),
        Err(err @ ProtoError::BadConfirmationCode(_)) => {
            // The upload state is already cleared; no response is owed.
            warn!("{err}");
            Ok(())
        }
        Err(err) => {
            warn!("{err}");
            TransferToCli::GeneralError.write(sock).await?;
            Ok(())
        }
    }
}

/// Accumulates upload packets until the declared count has arrived, then
/// decrypts, persists, and reports the checksum for confirmation.
async fn send_file_protocol(sock: &mut TcpStream, registry: &SharedRegistry,
                            mut header: RequestHeader) -> ProtoResult<()>
{
    let client_id = header.client_id;

    let file_name = loop {
        if !registry.lock().await.contains_uuid(client_id) {
            messages::discard_payload(sock, &header).await?;
            return Err(ProtoError::UnknownUser(client_id));
        }

        let packet = SendFilePacket::read(sock, &header).await?;
        debug!("Received packet {}/{} of '{}' from {client_id}",
               packet.packet_number + 1, packet.total_packets, packet.file_name);
        let file_name = packet.file_name.clone();

        let complete = registry.lock().await.save_packet(client_id, packet)?;
        if complete {
            break file_name;
        }

        header = RequestHeader::read(sock).await?;
        if header.client_id != client_id || header.code != SEND_FILE_REQUEST {
            messages::discard_payload(sock, &header).await?;
            return Err(ProtoError::SequenceViolation(
                       format!("mid-upload request code {} from {}",
                               header.code, header.client_id)));
        }
    };

    let (checksum, encrypted_size) = registry.lock().await.finalize_file(client_id)?;
    info!("Stored upload '{file_name}' from {client_id} (checksum {checksum:#010x})");
    TransferToCli::FileReceived {
        client_id,
        encrypted_size,
        file_name: file_name.clone(),
        checksum,
    }.write(sock).await?;

    crc_confirmation(sock, registry, client_id, &file_name).await
}

/// The client's verdict on the reported checksum.  An explicit give-up (or
/// an unrecognized code) abandons the upload state.
async fn crc_confirmation(sock: &mut TcpStream, registry: &SharedRegistry,
                          client_id: Uuid, file_name: &str) -> ProtoResult<()>
{
    let header = RequestHeader::read(sock).await?;
    let confirmed_name = messages::read_name_payload(sock, &header).await?;

    if header.client_id != client_id {
        return Err(ProtoError::SequenceViolation(
                   format!("checksum confirmation from {} for an upload by {client_id}",
                           header.client_id)));
    }
    if confirmed_name != file_name {
        return Err(ProtoError::SequenceViolation(
                   format!("checksum confirmation names '{confirmed_name}', \
                            expected '{file_name}'")));
    }

    match header.code {
        CRC_CONFIRM_OK => {
            debug!("Client {client_id} confirmed checksum for '{file_name}'");
            TransferToCli::Thanks { client_id }.write(sock).await?;
        }
        CRC_CONFIRM_RETRY => {
            // The client recomputed a different checksum and will restart
            // the whole transfer on a new connection.
            debug!("Client {client_id} rejected checksum for '{file_name}'");
        }
        CRC_CONFIRM_GIVE_UP => {
            warn!("Client {client_id} abandoned '{file_name}' after repeated \
                   checksum failures");
            registry.lock().await.clear_file(client_id);
            TransferToCli::Thanks { client_id }.write(sock).await?;
        }
        code => {
            registry.lock().await.clear_file(client_id);
            return Err(ProtoError::BadConfirmationCode(code));
        }
    }
    Ok(())
}
