//! Unit tests for the wire codec: pinned byte encodings and round trips.

#[cfg(test)]
mod units {
    use crate::vector::Vec3;
    use crate::wire::{ReadMessage, WireError, WireValue, WriteMessage};


    fn roundtrip(msg: WriteMessage) -> ReadMessage {
        ReadMessage::new(msg.into_bytes())
    }

    #[test]
    fn test_uint_big_endian_bytes() {
        let mut msg = WriteMessage::new();
        msg.write_uint(0x0A0B_0C0D);
        assert_eq!(msg.as_bytes(), &[0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[test]
    fn test_int_sign_magnitude() {
        // Bit 31 set marks a non-negative value; negative values carry only
        // their magnitude.
        let mut msg = WriteMessage::new();
        msg.write_int(5).write_int(-5).write_int(0);
        let mut rd = roundtrip(msg);
        assert_eq!(rd.read_uint().unwrap(), 0x8000_0005);
        assert_eq!(rd.read_uint().unwrap(), 0x0000_0005);
        assert_eq!(rd.read_uint().unwrap(), 0x8000_0000);
    }

    #[test]
    fn test_int_roundtrip() {
        let values = [0, 1, -1, 42, -42, (1 << 31) - 1, -((1 << 31) - 1)];
        let mut msg = WriteMessage::new();
        for &v in &values {
            msg.write_int(v);
        }
        let mut rd = roundtrip(msg);
        for &v in &values {
            assert_eq!(rd.read_int().unwrap(), v);
        }
        rd.require_end().unwrap();
    }

    #[test]
    #[should_panic]
    fn test_int_magnitude_overflow_panics() {
        WriteMessage::new().write_int(1 << 31);
    }

    #[test]
    fn test_double_text_encoding() {
        let mut msg = WriteMessage::new();
        msg.write_double(1.0);
        let mut rd = roundtrip(msg);
        assert_eq!(rd.read_char_array().unwrap(), "1.0000000000e+00");

        let mut msg = WriteMessage::new();
        msg.write_double(-2.5e-7);
        let mut rd = roundtrip(msg);
        assert_eq!(rd.read_char_array().unwrap(), "-2.5000000000e-07");
    }

    #[test]
    fn test_double_roundtrip() {
        let values = [0.0, 1.0, -1.0, 1.38e-23, 6.75e-8, -9.99e99, 3.5e100];
        let mut msg = WriteMessage::new();
        for &v in &values {
            msg.write_double(v);
        }
        let mut rd = roundtrip(msg);
        for &v in &values {
            assert_eq!(rd.read_double().unwrap(), v);
        }
    }

    #[test]
    fn test_char_array_length_prefix() {
        let mut msg = WriteMessage::new();
        msg.write_char_array("exit");
        assert_eq!(msg.as_bytes(), &[0, 0, 0, 4, b'e', b'x', b'i', b't']);

        let mut rd = roundtrip(msg);
        assert_eq!(rd.read_char_array().unwrap(), "exit");
        rd.require_end().unwrap();
    }

    #[test]
    fn test_array_roundtrips() {
        let ints = vec![3, -1, 4, -1, 5];
        let doubles = vec![0.25, -1.5, 1e-9];
        let vecs = vec![Vec3::new(1.0, 2.0, 3.0), Vec3::splat(-0.5)];

        let mut msg = WriteMessage::new();
        msg.write_int_array(&ints)
            .write_double_array(&doubles)
            .write_vec_array(&vecs)
            .write_uint_array(&[7, 8]);

        let mut rd = roundtrip(msg);
        assert_eq!(rd.read_int_array().unwrap(), ints);
        assert_eq!(rd.read_double_array().unwrap(), doubles);
        assert_eq!(rd.read_vec_array().unwrap(), vecs);
        assert_eq!(rd.read_uint().unwrap(), 2);
        assert_eq!(rd.read_uint().unwrap(), 7);
        assert_eq!(rd.read_uint().unwrap(), 8);
        rd.require_end().unwrap();
    }

    #[test]
    fn test_submsg_nesting() {
        let mut inner = WriteMessage::command("poll_size");
        inner.write_uint(9);

        let mut outer = WriteMessage::command("send_msg");
        outer.write_int(3).write_submsg(&inner);

        let mut rd = roundtrip(outer);
        assert_eq!(rd.read_char_array().unwrap(), "send_msg");
        assert_eq!(rd.read_int().unwrap(), 3);

        let mut sub = ReadMessage::new(rd.read_byte_array().unwrap());
        rd.require_end().unwrap();
        assert_eq!(sub.read_char_array().unwrap(), "poll_size");
        assert_eq!(sub.read_uint().unwrap(), 9);
        sub.require_end().unwrap();
    }

    #[test]
    fn test_named_fields_and_struct_arrays() {
        let mut msg = WriteMessage::new();
        msg.write_field("box_size");
        msg.write_vec(&Vec3::splat(1e-6));
        msg.write_field("comms");
        msg.write_struct_array(&[1i64, 4, 2], |m, &rank| {
            m.write_field("comm_rank");
            m.write_int(rank);
        });

        let mut rd = roundtrip(msg);
        rd.expect_field("box_size").unwrap();
        assert_eq!(rd.read_vec().unwrap(), Vec3::splat(1e-6));
        rd.expect_field("comms").unwrap();
        let count = rd.read_uint().unwrap();
        assert_eq!(count, 3);
        for expected in [1, 4, 2] {
            rd.expect_field("comm_rank").unwrap();
            assert_eq!(rd.read_int().unwrap(), expected);
        }
        rd.require_end().unwrap();

        // Mismatched names surface as protocol errors
        let mut msg = WriteMessage::new();
        msg.write_field("min_extent");
        let mut rd = roundtrip(msg);
        assert!(matches!(
            rd.expect_field("max_extent"),
            Err(WireError::FieldMismatch { .. })
        ));
    }

    #[test]
    fn test_format_driven_reading() {
        let mut msg = WriteMessage::new();
        msg.write_uint(2)
            .write_int(-7)
            .write_char_array("slave1")
            .write_double(0.5)
            .write_vec(&Vec3::new(1.0, 0.0, -1.0));

        let mut rd = roundtrip(msg);
        let values = rd.read_values("uisfvx").unwrap();
        assert_eq!(
            values,
            vec![
                WireValue::Uint(2),
                WireValue::Int(-7),
                WireValue::Str("slave1".to_string()),
                WireValue::Double(0.5),
                WireValue::Vector(Vec3::new(1.0, 0.0, -1.0)),
            ]
        );
    }

    #[test]
    fn test_end_of_message_errors() {
        // Short reads report end-of-stream
        let mut rd = ReadMessage::new(vec![0, 0]);
        assert!(matches!(rd.read_uint(), Err(WireError::Eof)));

        // Trailing bytes fail the end assertion with the leftover count
        let mut msg = WriteMessage::new();
        msg.write_uint(1).write_uint(2);
        let mut rd = roundtrip(msg);
        rd.read_uint().unwrap();
        match rd.read_values("x") {
            Err(WireError::TrailingBytes { remaining }) => assert_eq!(remaining, 4),
            other => panic!("expected trailing-bytes error, got {other:?}"),
        }

        // Unknown format codes are rejected
        let mut rd = ReadMessage::new(Vec::new());
        assert!(matches!(
            rd.read_values("q"),
            Err(WireError::UnknownCode('q'))
        ));
    }
}
