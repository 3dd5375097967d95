pub mod client_hello;

pub use client_hello::{
    is_client_hello, locate_sni, sni_hostname, splice_padding, SniLocation, RECORD_HEADER_LEN,
};
