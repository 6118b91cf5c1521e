pub mod handlers;

use crate::presentation::cli::{Cli, Commands};
use spak_core::error::Result;

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Info {
            archive,
            signature_len,
            cache,
        } => handlers::handle_info(archive, signature_len, cache),
        Commands::Verify {
            archive,
            keys,
            cache,
        } => handlers::handle_verify(archive, keys, cache),
        Commands::Cat {
            archive,
            start,
            len,
            keys,
            cache,
        } => handlers::handle_cat(archive, start, len, keys, cache),
        Commands::Get {
            archive,
            out,
            start,
            len,
            keys,
            cache,
        } => handlers::handle_get(archive, out, start, len, keys, cache),
    }
}
