//! Round-trip properties of the text and binary codecs.

use std::collections::BTreeMap;

use launchpad_rpc::{
    ExceptionKind, Message, Params, RemoteException, Request, Response, Value, codec,
};
use proptest::prelude::*;

const MAX_ID: u64 = (1 << 53) - 1;

fn scalar(with_bytes: bool) -> BoxedStrategy<Value> {
    let common = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Integer(n.into())),
        (-1.0e12f64..1.0e12f64).prop_map(Value::Float),
        "\\PC{0,12}".prop_map(Value::Text),
    ];
    if with_bytes {
        prop_oneof![
            common,
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        ]
        .boxed()
    } else {
        common.boxed()
    }
}

fn value(with_bytes: bool) -> impl Strategy<Value = Value> {
    scalar(with_bytes).prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            proptest::collection::btree_map("[a-z_]{1,8}", inner, 0..4).prop_map(|map| {
                Value::Map(
                    map.into_iter()
                        .map(|(key, value)| (Value::Text(key), value))
                        .collect(),
                )
            }),
        ]
    })
}

fn params(with_bytes: bool) -> impl Strategy<Value = Params> {
    prop_oneof![
        proptest::collection::vec(value(with_bytes), 0..4).prop_map(Params::Positional),
        proptest::collection::btree_map("[a-z_]{1,8}", value(with_bytes), 0..4)
            .prop_map(Params::Named),
    ]
}

fn message(with_bytes: bool) -> impl Strategy<Value = Message> {
    prop_oneof![
        (0..=MAX_ID, "[a-z]{1,8}(\\.[a-z_]{1,12})?", params(with_bytes))
            .prop_map(|(id, method, params)| Message::from(Request::new(id, method, params))),
        (0..=MAX_ID, value(with_bytes))
            .prop_map(|(id, result)| Message::from(Response::result(id, result))),
    ]
}

fn exception() -> impl Strategy<Value = RemoteException> {
    (
        prop::sample::select(ExceptionKind::ALL.to_vec()),
        proptest::collection::btree_map("[a-z_]{1,8}", value(false), 0..4),
    )
        .prop_map(|(kind, attributes): (ExceptionKind, BTreeMap<String, Value>)| {
            RemoteException::from_parts(kind, attributes)
        })
}

proptest! {
    #[test]
    fn binary_roundtrip(message in message(true)) {
        let encoded = codec::encode_binary(&message).unwrap();
        prop_assert_eq!(codec::decode_binary(&encoded).unwrap(), message);
    }

    #[test]
    fn text_roundtrip(message in message(false)) {
        let encoded = codec::encode_text(&message).unwrap();
        prop_assert_eq!(codec::decode_text(&encoded).unwrap(), message);
    }

    #[test]
    fn exception_keeps_type_and_attributes(id in 0..=MAX_ID, exception in exception()) {
        let message = Message::from(Response::error(id, exception.clone()));

        let decoded = [
            codec::decode_binary(&codec::encode_binary(&message).unwrap()).unwrap(),
            codec::decode_text(&codec::encode_text(&message).unwrap()).unwrap(),
        ];

        for decoded in decoded {
            let Message::Response(response) = decoded else {
                return Err(TestCaseError::fail("expected a response"));
            };
            prop_assert_eq!(response.id, id);
            let err = response.payload.unwrap_err();
            prop_assert_eq!(err.kind(), exception.kind());
            prop_assert_eq!(err.attributes(), exception.attributes());
        }
    }
}

#[test]
fn text_floats_keep_every_bit() {
    let times = [229_145_870_866.894_8, 190_474_703_954.020_26, 1.0e-300, 0.1];
    let message = Message::from(Response::result(
        1,
        Value::Array(times.iter().copied().map(Value::Float).collect()),
    ));

    let decoded = codec::decode_text(&codec::encode_text(&message).unwrap()).unwrap();
    let Message::Response(response) = decoded else {
        panic!("expected a response");
    };
    let Ok(Value::Array(values)) = response.payload else {
        panic!("expected an array result");
    };
    for (value, expected) in values.iter().zip(times) {
        let Value::Float(actual) = value else {
            panic!("expected a float, got {value:?}");
        };
        assert_eq!(actual.to_bits(), expected.to_bits());
    }
}
