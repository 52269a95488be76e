//! netcache.
//!
//! netcache is an HTTP disk cache. It stores responses keyed by the identity of the request, and
//! coordinates concurrent transactions so that every resource is written by at most one of them
//! at a time while any number of others read it.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
