#![no_main]

use ldap_protocol::protocol::message::LdapMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Anything that decodes must re-encode to bytes that decode to the same message
    if let Ok(msg) = LdapMessage::from_bytes(data) {
        let again = LdapMessage::from_bytes(&msg.to_bytes()).expect("re-encoded message decodes");
        assert_eq!(again, msg);
    }
});
