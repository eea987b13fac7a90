use super::*;
use bytes::Bytes;
use std::collections::BTreeMap;

#[test]
fn decode_scalars() {
    assert_eq!(decode(b"i42e").unwrap().as_integer(), Some(42));
    assert_eq!(decode(b"i-7e").unwrap().as_integer(), Some(-7));
    assert_eq!(decode(b"5:hello").unwrap().as_str(), Some("hello"));
    assert_eq!(decode(b"0:").unwrap().as_bytes().map(|b| b.len()), Some(0));
}

#[test]
fn decode_dict_lookup() {
    let value = decode(b"d1:md7:elastici1eee").unwrap();
    let m = value.get(b"m").unwrap();
    assert_eq!(m.get(b"elastic").and_then(|v| v.as_integer()), Some(1));
}

#[test]
fn rejects_malformed_input() {
    assert!(matches!(decode(b"i42"), Err(BencodeError::UnexpectedEof)));
    assert!(matches!(decode(b"i007e"), Err(BencodeError::InvalidInteger(_))));
    assert!(matches!(decode(b"i42eextra"), Err(BencodeError::TrailingData)));
    assert!(matches!(decode(b"di1ei2ee"), Err(BencodeError::InvalidDictKey)));
    assert!(matches!(decode(b"x"), Err(BencodeError::UnexpectedChar('x'))));
}

#[test]
fn encode_is_canonical() {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"b"), Value::Integer(2));
    dict.insert(Bytes::from_static(b"a"), Value::string("one"));
    let encoded = encode(&Value::Dict(dict)).unwrap();
    assert_eq!(encoded, b"d1:a3:one1:bi2ee");
}

#[test]
fn round_trip_nested() {
    let doc: &[u8] = b"d4:listli1ei2ee3:subd3:onei1eee";
    let value = decode(doc).unwrap();
    let encoded = encode(&value).unwrap();
    assert_eq!(encoded, doc);
}
