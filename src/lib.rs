extern crate base64;
extern crate byteorder;
extern crate bytes;
extern crate chrono;
#[macro_use]
extern crate error_chain;
extern crate hex;
extern crate hmac;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate nix;
extern crate rustls;
extern crate serde;
extern crate serde_bytes;
extern crate serde_cbor;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate sha2;
extern crate webpki_roots;

#[cfg(test)]
extern crate tempdir;

pub mod common;
pub mod exec;
pub mod fleet;
pub mod net;
pub mod proto;
pub mod reactor;
pub mod store;
pub mod thunk;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const WORKER_PROTOCOL_VERSION: i32 = 0;

/// Payload ceiling of the worker platform. Thunks whose total input size
/// reaches this limit cannot be dispatched at all.
pub const MAX_PAYLOAD_SIZE: u64 = 200 * 1024 * 1024;

pub mod errors {
    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        types {
            Error, ErrorKind, ResultExt;
        }
        foreign_links {
            Io(::std::io::Error);
            Nix(::nix::Error);
            Cbor(::serde_cbor::error::Error);
            Json(::serde_json::Error);
            Tls(::rustls::Error);
            Utf8Err(::std::str::Utf8Error);
        }
    }

    // Explicit alias just to make the IDEs happier
    pub type Result<T> = ::std::result::Result<T, Error>;
}

pub use errors::{Error, ErrorKind, Result, ResultExt};
