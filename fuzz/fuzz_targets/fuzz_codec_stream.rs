#![no_main]

use bytes::BytesMut;
use ldap_protocol::core::codec::LdapCodec;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Split arbitrary bytes into frames; must never panic or loop
    let mut codec = LdapCodec::new(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
