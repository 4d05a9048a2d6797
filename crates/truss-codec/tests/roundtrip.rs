use std::{any::Any, io::Cursor};

use once_cell::sync::Lazy;
use truss_codec::{CodecError, Deserializer, Limits, Serializer, Step, TypeMap, Wire};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Sample {
    seq: u32,
    tag: String,
    values: Vec<u32>,
}

impl Wire for Sample {
    fn store<'a>(&'a self, s: &mut Serializer<'a>) {
        s.push(&self.seq, "seq").push(&self.tag, "tag").push(&self.values, "values");
    }

    fn load(d: &mut Deserializer<'_>) {
        d.push_call("sample", |d, stage| match *stage {
            0 => {
                *stage = 1;
                d.push::<u32>("seq").push::<String>("tag").push::<Vec<u32>>("values");
                Step::Continue
            }
            1 => {
                // Fields pop in reverse schedule order.
                let values = match d.take::<Vec<u32>>() {
                    Ok(v) => v,
                    Err(e) => return Step::Failure(e),
                };
                let tag = match d.take::<String>() {
                    Ok(v) => v,
                    Err(e) => return Step::Failure(e),
                };
                let seq = match d.take::<u32>() {
                    Ok(v) => v,
                    Err(e) => return Step::Failure(e),
                };
                d.push_scratch(truss_codec::Scratch::Any(Box::new(Sample { seq, tag, values })));
                Step::Success
            }
            _ => unreachable!(),
        });
    }
}

fn sample() -> Sample {
    Sample { seq: 0x0102_0304, tag: "hi".into(), values: vec![1, 2] }
}

fn serialize_with_window(value: &Sample, window: usize) -> Vec<u8> {
    let mut s = Serializer::new();
    s.push(value, "sample");
    let mut out = Vec::new();
    let mut buf = vec![0u8; window];
    while !s.is_complete() {
        let n = s.run(&mut buf).expect("serialize");
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[test]
fn primitives_struct_matches_wire_bytes() {
    let bytes = serialize_with_window(&sample(), 64);
    assert_eq!(
        bytes,
        [
            0x04, 0x03, 0x02, 0x01, // u32 LE
            0x02, 0x68, 0x69, // cross len + "hi"
            0x02, // cross count
            0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, // elements LE
        ]
    );

    let mut d = Deserializer::new();
    d.push::<Sample>("sample");
    assert_eq!(d.run(&bytes).expect("deserialize"), bytes.len());
    assert!(d.is_complete());
    assert_eq!(d.take::<Sample>().unwrap(), sample());
}

#[test]
fn restart_safe_at_every_split_point() {
    let whole = serialize_with_window(&sample(), 64);

    // One output byte at a time must produce identical bytes.
    assert_eq!(serialize_with_window(&sample(), 1), whole);

    // Feeding the input back byte-at-a-time must rebuild the same value.
    let mut d = Deserializer::new();
    d.push::<Sample>("sample");
    for b in &whole {
        assert_eq!(d.run(std::slice::from_ref(b)).expect("chunk"), 1);
    }
    assert!(d.is_complete());
    assert_eq!(d.take::<Sample>().unwrap(), sample());
}

#[test]
fn every_prefix_split_roundtrips() {
    let whole = serialize_with_window(&sample(), 64);
    for split in 0..=whole.len() {
        let mut d = Deserializer::new();
        d.push::<Sample>("sample");
        let a = d.run(&whole[..split]).expect("first half");
        let b = d.run(&whole[a..]).expect("second half");
        assert_eq!(a + b, whole.len(), "split at {split}");
        assert_eq!(d.take::<Sample>().unwrap(), sample(), "split at {split}");
    }
}

trait Node: Any {
    fn label(&self) -> &'static str;
}

#[derive(Debug, PartialEq, Eq)]
struct Alpha {
    weight: u32,
}

impl Node for Alpha {
    fn label(&self) -> &'static str {
        "alpha"
    }
}

impl Wire for Alpha {
    fn store<'a>(&'a self, s: &mut Serializer<'a>) {
        s.push(&self.weight, "weight");
    }

    fn load(d: &mut Deserializer<'_>) {
        d.push_call("alpha", |d, stage| match *stage {
            0 => {
                *stage = 1;
                d.push::<u32>("weight");
                Step::Continue
            }
            _ => {
                let weight = match d.take::<u32>() {
                    Ok(v) => v,
                    Err(e) => return Step::Failure(e),
                };
                d.push_scratch(truss_codec::Scratch::Any(Box::new(Alpha { weight })));
                Step::Success
            }
        });
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Beta {
    flag: bool,
    weight: u32,
}

impl Node for Beta {
    fn label(&self) -> &'static str {
        "beta"
    }
}

impl Wire for Beta {
    fn store<'a>(&'a self, s: &mut Serializer<'a>) {
        s.push(&self.flag, "flag").push(&self.weight, "weight");
    }

    fn load(d: &mut Deserializer<'_>) {
        d.push_call("beta", |d, stage| match *stage {
            0 => {
                *stage = 1;
                d.push::<bool>("flag").push::<u32>("weight");
                Step::Continue
            }
            _ => {
                let weight = match d.take::<u32>() {
                    Ok(v) => v,
                    Err(e) => return Step::Failure(e),
                };
                let flag = match d.take::<bool>() {
                    Ok(v) => v,
                    Err(e) => return Step::Failure(e),
                };
                d.push_scratch(truss_codec::Scratch::Any(Box::new(Beta { flag, weight })));
                Step::Success
            }
        });
    }
}

// Built at service start, then frozen; reads are lock-free.
static NODE_MAP: Lazy<TypeMap<dyn Node>> = Lazy::new(|| {
    let mut map: TypeMap<dyn Node> = TypeMap::new(|v| v);
    map.register::<Alpha>(0, 10, |b| b).unwrap();
    map.register::<Beta>(0, 11, |b| b).unwrap();
    map
});

#[test]
fn polymorphic_vector_roundtrip() {
    let map = &*NODE_MAP;
    let items: Vec<Box<dyn Node>> = vec![Box::new(Beta { flag: true, weight: 7 })];

    let mut s = Serializer::new();
    s.push_ptr_slice(map, &items, "items");
    let mut bytes = Vec::new();
    let mut buf = [0u8; 8];
    while !s.is_complete() {
        let n = s.run(&mut buf).expect("serialize");
        bytes.extend_from_slice(&buf[..n]);
    }

    // count, (protocol, kind), then Beta's payload
    assert_eq!(&bytes[..3], [0x01, 0x00, 0x0B]);

    let mut d = Deserializer::new();
    d.push_ptr_vec(map, "items");
    assert_eq!(d.run(&bytes).expect("deserialize"), bytes.len());
    let out: Vec<Box<dyn Node>> = d.take().unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].label(), "beta");
    let beta = (&*out[0] as &dyn Any).downcast_ref::<Beta>().expect("runtime type");
    assert_eq!(*beta, Beta { flag: true, weight: 7 });
}

#[test]
fn unknown_wire_pair_rejected() {
    let bytes = [0x01, 0x00, 0x2A, 0x00, 0x00, 0x00, 0x00];

    let mut d = Deserializer::new();
    d.push_ptr_vec(&NODE_MAP, "items");
    let err = d.run(&bytes).unwrap_err();
    assert_eq!(err, CodecError::UnknownType { protocol: 0, kind: 0x2A });
}

#[test]
fn duplicate_registration_rejected() {
    let mut map: TypeMap<dyn Node> = TypeMap::new(|v| v);
    map.register::<Alpha>(0, 10, |b| b).unwrap();
    let err = map.register::<Beta>(0, 10, |b| b).unwrap_err();
    assert_eq!(err, CodecError::DuplicateType { protocol: 0, kind: 10 });
}

#[test]
fn stream_roundtrips_through_small_windows() {
    let payload: Vec<u8> = (0..200u16).map(|v| v as u8).collect();
    let mut src = Cursor::new(payload.clone());

    let mut s = Serializer::new();
    s.push_stream(&mut src, 200, "blob");
    let mut bytes = Vec::new();
    // Window just over the stream guard so every step makes progress.
    let mut buf = [0u8; 17];
    while !s.is_complete() {
        let n = s.run(&mut buf).expect("serialize");
        bytes.extend_from_slice(&buf[..n]);
    }
    assert_eq!(bytes.len(), 8 + 200);
    assert_eq!(u64::from_le_bytes(bytes[..8].try_into().unwrap()), 200);

    let mut sink = Vec::new();
    let mut d = Deserializer::new();
    d.push_stream(&mut sink, "blob");
    for chunk in bytes.chunks(7) {
        let n = d.run(chunk).expect("deserialize");
        assert_eq!(n, chunk.len());
    }
    assert!(d.is_complete());
    drop(d);
    assert_eq!(sink, payload);
}

#[test]
fn stream_over_limit_rejected() {
    let mut sink = Vec::new();
    let mut d = Deserializer::with_limits(Limits::none().with_stream_max(10));
    d.push_stream(&mut sink, "blob");
    let bytes = 64u64.to_le_bytes();
    let err = d.run(&bytes).unwrap_err();
    assert_eq!(err, CodecError::StreamLimit { len: 64, max: 10 });
}

#[test]
fn staged_call_interleaves_phases() {
    // Multi-phase emission: a header, then a lazily-opened blob, then a
    // trailer, without blocking the engine between phases.
    let payload = vec![0xABu8; 40];
    let mut src = Cursor::new(payload.clone());

    let mut s = Serializer::new();
    s.push(&0x01u8, "header");
    let mut src_slot = Some(&mut src);
    s.push_call("blob", move |s, stage| match *stage {
        0 => {
            *stage = 1;
            let src = src_slot.take().expect("opens once");
            s.push_stream(src, 40, "payload");
            Step::Continue
        }
        _ => Step::Success,
    });
    s.push(&0xFFu8, "trailer");

    let mut bytes = Vec::new();
    let mut buf = [0u8; 16];
    while !s.is_complete() {
        let n = s.run(&mut buf).expect("serialize");
        bytes.extend_from_slice(&buf[..n]);
    }
    assert_eq!(bytes[0], 0x01);
    assert_eq!(u64::from_le_bytes(bytes[1..9].try_into().unwrap()), 40);
    assert_eq!(&bytes[9..49], payload.as_slice());
    assert_eq!(bytes[49], 0xFF);
}
