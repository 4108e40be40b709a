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

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

pub const DEFAULT_PORT: u16 = 1256;

const PORT_INFO_FILE: &str = "port.info";
const USERS_DIRECTORY: &str = "users";

pub struct ServerConfig {
    /* Listen address for the transfer server */
    pub listen_address: String,

    /* Root directory holding one folder per registered user */
    pub users_root: PathBuf,
}

impl ServerConfig {
    /// Builds the runtime configuration.  The listen port comes from a
    /// `port.info` file in the working directory (a decimal integer on its
    /// first line); any problem reading it falls back to the default port.
    pub fn load(host: &str) -> ServerConfig {
        let port = match read_port(Path::new(PORT_INFO_FILE)) {
            Ok(port) => port,
            Err(err) => {
                warn!("Could not read {PORT_INFO_FILE} ({err:#}); \
                       using default port {DEFAULT_PORT}");
                DEFAULT_PORT
            }
        };
        ServerConfig {
            listen_address: format!("{host}:{port}"),
            users_root: PathBuf::from(USERS_DIRECTORY),
        }
    }
}

fn read_port(path: &Path) -> Result<u16> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let line = content.lines().next().context("port file is empty")?;
    line.trim().parse::<u16>()
        .with_context(|| format!("invalid port number '{}'", line.trim()))
}
