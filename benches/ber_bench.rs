use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use ldap_protocol::core::codec::LdapCodec;
use ldap_protocol::protocol::filter::Filter;
use ldap_protocol::protocol::message::{
    LdapMessage, PartialAttribute, ProtocolOp, SearchRequest, SearchResultEntry, SearchScope,
};
use tokio_util::codec::{Decoder, Encoder};

fn sample_entry(id: i32) -> LdapMessage {
    LdapMessage::new(
        id,
        ProtocolOp::SearchResultEntry(SearchResultEntry {
            dn: format!("uid=user{id},ou=people,dc=example,dc=com"),
            attributes: vec![
                PartialAttribute::new("objectClass", ["top", "person", "inetOrgPerson"]),
                PartialAttribute::new("cn", [format!("User {id}")]),
                PartialAttribute::new("mail", [format!("user{id}@example.com")]),
                PartialAttribute::new("description", ["a".repeat(512)]),
            ],
        }),
    )
}

fn bench_message_ber(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_ber");
    let entry = sample_entry(42);

    group.bench_function("encode_entry", |b| {
        b.iter(|| {
            let _ = entry.to_bytes();
        })
    });

    let blob = entry.to_bytes();
    group.bench_function("decode_entry", |b| {
        b.iter(|| {
            let _ = LdapMessage::from_bytes(&blob).unwrap();
        })
    });

    let search = LdapMessage::new(
        7,
        ProtocolOp::SearchRequest(SearchRequest::new(
            "dc=example,dc=com",
            SearchScope::WholeSubtree,
            Filter::And(vec![
                Filter::equality("objectClass", "person"),
                Filter::Or(vec![
                    Filter::equality("uid", "jdoe"),
                    Filter::equality("mail", "jdoe@example.com"),
                ]),
                Filter::Not(Box::new(Filter::present("nsAccountLock"))),
            ]),
        )),
    );
    group.bench_function("encode_search_request", |b| {
        b.iter(|| {
            let _ = search.to_bytes();
        })
    });

    group.finish();
}

fn bench_codec_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_stream");

    let mut wire = BytesMut::new();
    let mut codec = LdapCodec::default();
    for id in 1..=100 {
        codec.encode(&sample_entry(id), &mut wire).unwrap();
    }

    group.bench_function("decode_100_frames", |b| {
        b.iter_batched(
            || wire.clone(),
            |mut buf| {
                let mut codec = LdapCodec::default();
                while let Some(msg) = codec.decode(&mut buf).unwrap() {
                    let _ = msg.message_id;
                }
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_message_ber, bench_codec_stream);
criterion_main!(benches);
