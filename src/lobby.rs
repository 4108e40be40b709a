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

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::transfer_srv::TransferServer;

pub async fn lobby_server(config: ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(&config.listen_address).await
        .with_context(|| format!("Failed to bind on address {}",
                                 config.listen_address))?;
    info!("Server listening on {}", config.listen_address);

    let transfer_server = TransferServer::start(&config)?;
    accept_loop(listener, transfer_server).await;
    Ok(())
}

async fn accept_loop(listener: TcpListener, mut transfer_server: TransferServer) {
    loop {
        match listener.accept().await {
            Ok((sock, sock_addr)) => {
                debug!("Accepted connection from {sock_addr}");
                transfer_server.add(sock).await;
            }
            Err(err) => {
                warn!("Failed to accept from socket: {err}");
            }
        }
    }
}
