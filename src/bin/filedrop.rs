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

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]

use tracing::error;
use tracing_subscriber::EnvFilter;

use filedrop::config::ServerConfig;
use filedrop::lobby::lobby_server;

#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: &str = "debug";

#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: &str = "warn";

// The default is to listen on 127.0.0.1, which means that ONLY connections
// from localhost are allowed.  Embedders wanting to accept remote clients
// should start the lobby with "0.0.0.0" instead.
const LISTEN_HOST: &str = "127.0.0.1";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)))
        .init();

    let config = ServerConfig::load(LISTEN_HOST);
    let runtime = tokio::runtime::Builder::new_multi_thread()
                            .enable_all().build().unwrap();
    if let Err(err) = runtime.block_on(lobby_server(config)) {
        error!("{err:#}");
        std::process::exit(1);
    }
}
