use std::any::Any;

use crate::{CodecError, Deserializer, Scratch, Serializer, Step};

/// A value with a wire representation.
///
/// `store` schedules emission frames; `load` schedules decode frames and
/// leaves the finished value on the scratch stack for
/// [`Deserializer::take`]. Composite `load` implementations pop their
/// fields in reverse schedule order.
pub trait Wire: Any {
    fn store<'a>(&'a self, s: &mut Serializer<'a>);
    fn load(d: &mut Deserializer<'_>);
}

macro_rules! impl_wire_int {
    ($($t:ty => $w:expr),* $(,)?) => {$(
        impl Wire for $t {
            fn store<'a>(&'a self, s: &mut Serializer<'a>) {
                s.push_fixed(*self as u64, $w);
            }

            fn load(d: &mut Deserializer<'_>) {
                d.push_prim($w, |raw| Scratch::Any(Box::new(raw as $t)));
            }
        }
    )*};
}

impl_wire_int!(u8 => 1, i8 => 1, u16 => 2, i16 => 2, u32 => 4, i32 => 4, u64 => 8, i64 => 8);

impl Wire for bool {
    fn store<'a>(&'a self, s: &mut Serializer<'a>) {
        s.push_fixed(u64::from(*self), 1);
    }

    fn load(d: &mut Deserializer<'_>) {
        d.push_prim(1, |raw| Scratch::Any(Box::new(raw != 0)));
    }
}

impl Wire for String {
    fn store<'a>(&'a self, s: &mut Serializer<'a>) {
        let len = self.len() as u64;
        if len > s.limits().string_max {
            s.fail(CodecError::StringLimit { len, max: s.limits().string_max });
            return;
        }
        s.push_cross(len, "len");
        s.push_bytes(self.as_bytes());
    }

    fn load(d: &mut Deserializer<'_>) {
        d.push_cross("len");
        d.push_call("string", |d, stage| match *stage {
            0 => {
                let len = match d.take_u64() {
                    Ok(v) => v,
                    Err(e) => return Step::Failure(e),
                };
                if len > d.limits().string_max {
                    return Step::Failure(CodecError::StringLimit {
                        len,
                        max: d.limits().string_max,
                    });
                }
                *stage = 1;
                d.push_len_bytes(len, |data| {
                    String::from_utf8(data)
                        .map(|v| Scratch::Any(Box::new(v)))
                        .map_err(|_| CodecError::Utf8)
                });
                Step::Continue
            }
            _ => Step::Success,
        });
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn store<'a>(&'a self, s: &mut Serializer<'a>) {
        let len = self.len() as u64;
        if len > s.limits().container_max {
            s.fail(CodecError::ContainerLimit { len, max: s.limits().container_max });
            return;
        }
        s.push_cross(len, "count");
        let items: &'a [T] = self;
        let mut idx = 0;
        s.push_call("container", move |s, _stage| {
            if idx == items.len() {
                return Step::Success;
            }
            s.push(&items[idx], "item");
            idx += 1;
            Step::Continue
        });
    }

    fn load(d: &mut Deserializer<'_>) {
        d.push_cross("count");
        let mut out: Vec<T> = Vec::new();
        let mut count = 0u64;
        d.push_call("container", move |d, stage| match *stage {
            0 => {
                count = match d.take_u64() {
                    Ok(v) => v,
                    Err(e) => return Step::Failure(e),
                };
                if count > d.limits().container_max {
                    return Step::Failure(CodecError::ContainerLimit {
                        len: count,
                        max: d.limits().container_max,
                    });
                }
                out.reserve(count.min(4096) as usize);
                *stage = 1;
                Step::Continue
            }
            1 => {
                if out.len() as u64 == count {
                    d.push_scratch(Scratch::Any(Box::new(std::mem::take(&mut out))));
                    return Step::Success;
                }
                *stage = 2;
                T::load(d);
                Step::Continue
            }
            2 => {
                match d.take::<T>() {
                    Ok(v) => out.push(v),
                    Err(e) => return Step::Failure(e),
                }
                *stage = 1;
                Step::Continue
            }
            _ => unreachable!(),
        });
    }
}

/// Bit-packed bool vector: a cross-encoded count, then 8 flags per byte,
/// LSB first. Plain `Vec<bool>` goes through the one-byte-per-flag
/// container format instead.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bits(pub Vec<bool>);

impl Wire for Bits {
    fn store<'a>(&'a self, s: &mut Serializer<'a>) {
        let len = self.0.len() as u64;
        if len > s.limits().container_max {
            s.fail(CodecError::ContainerLimit { len, max: s.limits().container_max });
            return;
        }
        s.push_cross(len, "count");
        let mut packed = vec![0u8; self.0.len().div_ceil(8)];
        for (i, &flag) in self.0.iter().enumerate() {
            if flag {
                packed[i / 8] |= 1 << (i % 8);
            }
        }
        s.push_owned(packed);
    }

    fn load(d: &mut Deserializer<'_>) {
        d.push_cross("count");
        let mut count = 0u64;
        d.push_call("bits", move |d, stage| match *stage {
            0 => {
                count = match d.take_u64() {
                    Ok(v) => v,
                    Err(e) => return Step::Failure(e),
                };
                if count > d.limits().container_max {
                    return Step::Failure(CodecError::ContainerLimit {
                        len: count,
                        max: d.limits().container_max,
                    });
                }
                *stage = 1;
                d.push_len_bytes(count.div_ceil(8), |data| Ok(Scratch::Bytes(data)));
                Step::Continue
            }
            1 => {
                let packed = match d.take_bytes() {
                    Ok(v) => v,
                    Err(e) => return Step::Failure(e),
                };
                let flags =
                    (0..count as usize).map(|i| packed[i / 8] & (1 << (i % 8)) != 0).collect();
                d.push_scratch(Scratch::Any(Box::new(Bits(flags))));
                Step::Success
            }
            _ => unreachable!(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Limits;

    fn ser_all(s: &mut Serializer<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 32];
        while !s.is_complete() {
            let n = s.run(&mut buf).expect("serialize");
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn fixed_ints_are_little_endian() {
        let v: u32 = 0x0102_0304;
        let mut s = Serializer::new();
        s.push(&v, "v");
        assert_eq!(ser_all(&mut s), [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn signed_ints_roundtrip() {
        let v: i32 = -5;
        let mut s = Serializer::new();
        s.push(&v, "v");
        let bytes = ser_all(&mut s);
        assert_eq!(bytes, (-5i32).to_le_bytes());

        let mut d = Deserializer::new();
        d.push::<i32>("v");
        assert_eq!(d.run(&bytes).unwrap(), bytes.len());
        assert_eq!(d.take::<i32>().unwrap(), -5);
    }

    #[test]
    fn string_is_cross_length_prefixed() {
        let v = String::from("hi");
        let mut s = Serializer::new();
        s.push(&v, "v");
        assert_eq!(ser_all(&mut s), [0x02, b'h', b'i']);
    }

    #[test]
    fn string_limit_enforced_on_load() {
        let v = String::from("hello world");
        let mut s = Serializer::new();
        s.push(&v, "v");
        let bytes = ser_all(&mut s);

        let mut d = Deserializer::with_limits(Limits::none().with_string_max(4));
        d.push::<String>("v");
        let err = d.run(&bytes).unwrap_err();
        assert_eq!(err, CodecError::StringLimit { len: 11, max: 4 });
        // Poisoned from here on.
        assert_eq!(d.run(&bytes).unwrap_err(), err);
    }

    #[test]
    fn bit_packed_bools() {
        let v = Bits(vec![true, false, true, true, false, false, false, false, true]);
        let mut s = Serializer::new();
        s.push(&v, "v");
        let bytes = ser_all(&mut s);
        assert_eq!(bytes, [0x09, 0b0000_1101, 0b0000_0001]);

        let mut d = Deserializer::new();
        d.push::<Bits>("v");
        assert_eq!(d.run(&bytes).unwrap(), bytes.len());
        assert_eq!(d.take::<Bits>().unwrap(), v);
    }
}
