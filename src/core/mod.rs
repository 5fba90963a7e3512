//! # Core Codec Components
//!
//! ASN.1 BER encoding and the stream framing built on it.
//!
//! ## Components
//! - **BER**: typed [`Asn1Value`](ber::Asn1Value) to bytes and back
//! - **Codec**: Tokio codec that frames one `LDAPMessage` per outer TLV
//!
//! ## Wire Format
//! ```text
//! [Identifier(1+)] [Length(1+)] [Content(N)]
//! ```
//! Length is always definite; indefinite-length input is rejected.
//!
//! ## Security
//! - Maximum frame size is configurable (16 MiB default)
//! - The declared length is checked against the limit before buffering

pub mod ber;
pub mod codec;
