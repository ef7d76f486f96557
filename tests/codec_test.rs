/// Wire codec behaviour at field boundaries and on malformed input.
mod common;

#[cfg(test)]
mod tests {
    use super::common::{scenario_a_request, texture};
    use pretty_assertions::assert_eq;
    use resvg::tiny_skia::{Color, Pixmap};
    use skin_render_worker::codec::{self, DecodeError, ProtocolVersion, ResponseBody};
    use skin_render_worker::error::{ErrorRecord, FailureKind};
    use skin_render_worker::job::{RenderMode, RenderRequest};
    use std::time::Duration;

    #[test]
    fn test_scenario_a_decodes_exact_fields() {
        let sent = scenario_a_request();
        let bytes = codec::encode_request(&sent).unwrap();

        let decoded = codec::decode_request(&bytes).unwrap();
        assert_eq!(decoded.mode, RenderMode::Body);
        assert_eq!((decoded.width, decoded.height), (128, 128));
        assert_eq!((decoded.rotation_x, decoded.rotation_y, decoded.leg_rotation), (30, 45, 0));
        assert!(!decoded.flipped);
        assert!(decoded.slim);
        assert_eq!(decoded.source_image, sent.source_image);
    }

    #[test]
    fn test_request_survives_boundary_values() {
        let cases = [
            (RenderMode::Body, 0, 0, 1, i32::MIN, i32::MAX, 0, true, false),
            (RenderMode::Head, 1, 1, 64, -90, 90, i32::MIN, false, true),
            (RenderMode::Bust, i32::MAX as u32, 7, 256, 0, 0, i32::MAX, true, true),
        ];

        for case in cases {
            let (mode, width, height, side, rotation_x, rotation_y, leg_rotation, flipped, slim) =
                case;
            let request = RenderRequest {
                mode,
                width,
                height,
                source_image: texture(side, side, Color::from_rgba8(10, 200, 30, 255)),
                rotation_x,
                rotation_y,
                leg_rotation,
                flipped,
                slim,
            };
            let bytes = codec::encode_request(&request).unwrap();
            assert_eq!(codec::decode_request(&bytes).unwrap(), request, "mode {mode}");
        }
    }

    /// Fills a texture with xorshift noise. Color channels never exceed
    /// alpha, so the data is valid premultiplied RGBA.
    fn noise_texture(side: u32, opaque: bool) -> Pixmap {
        let mut pixmap = Pixmap::new(side, side).unwrap();
        let mut state = 0x2545_f491_u32;
        for pixel in pixmap.data_mut().chunks_exact_mut(4) {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let [r, g, b, a] = state.to_le_bytes();
            let alpha = if opaque { 255 } else { a.max(1) };
            pixel.copy_from_slice(&[r.min(alpha), g.min(alpha), b.min(alpha), alpha]);
        }
        pixmap
    }

    #[test]
    fn test_large_noisy_texture_survives() {
        let mut request = scenario_a_request();
        request.source_image = noise_texture(512, true);

        let bytes = codec::encode_request(&request).unwrap();
        assert!(bytes.len() > 300_000, "payload is only {} bytes", bytes.len());
        assert_eq!(codec::decode_request(&bytes).unwrap(), request);
    }

    #[test]
    fn test_translucent_texture_keeps_alpha() {
        let mut request = scenario_a_request();
        request.source_image = noise_texture(256, false);

        let bytes = codec::encode_request(&request).unwrap();
        let decoded = codec::decode_request(&bytes).unwrap();

        // PNG stores straight alpha; colors may shift by one unit through
        // the premultiply round trip, alpha never does.
        let sent = request.source_image.data().chunks_exact(4);
        let received = decoded.source_image.data().chunks_exact(4);
        for (before, after) in sent.zip(received) {
            assert_eq!(before[3], after[3]);
            for channel in 0..3 {
                assert!(before[channel].abs_diff(after[channel]) <= 1);
            }
        }
    }

    #[test]
    fn test_scenario_b_truncated_before_rotations() {
        let bytes = codec::encode_request(&scenario_a_request()).unwrap();
        // Drop all three rotations and both flags.
        let cut = &bytes[..bytes.len() - 14];

        let err = codec::decode_request(cut).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { field: "rotation_x", .. }));
        assert_eq!(err.kind(), FailureKind::ProtocolDecode);
        assert_eq!(err.to_record().kind, "ProtocolDecodeError");
    }

    #[test]
    fn test_wrong_image_bytes_is_image_failure() {
        let mut bytes = vec![RenderMode::Head.ordinal()];
        bytes.extend_from_slice(&16i32.to_be_bytes());
        bytes.extend_from_slice(&16i32.to_be_bytes());
        bytes.extend_from_slice(&4i32.to_be_bytes());
        bytes.extend_from_slice(b"JPEG");
        bytes.extend_from_slice(&[0; 14]);

        let err = codec::decode_request(&bytes).unwrap_err();
        assert_eq!(err.kind(), FailureKind::ImageDecode);
        assert_eq!(err.to_record().kind, "ImageDecodeError");
    }

    #[test]
    fn test_failure_response_carries_record() {
        let record = ErrorRecord {
            kind: FailureKind::Render.as_str().to_string(),
            message: "odd width 3".to_string(),
            stack_frames: vec!["frame one".to_string(), "frame two".to_string()],
        };
        let bytes = codec::encode_response(
            &Err(record.clone()),
            "w1",
            Duration::from_millis(42),
            ProtocolVersion::V2,
        )
        .unwrap();
        assert_eq!(bytes[0], 0);

        let response = codec::decode_response(&bytes, ProtocolVersion::V2).unwrap();
        assert_eq!(response.worker_name, "w1");
        assert_eq!(response.elapsed_ms, Some(42));
        assert_eq!(response.body, ResponseBody::Failure(record));
        assert!(!response.is_success());
        assert!(response.image().is_none());
    }

    #[test]
    fn test_success_response_payload_is_png() {
        let image = texture(4, 3, Color::from_rgba8(255, 0, 0, 255));
        let bytes = codec::encode_response(
            &Ok(image.clone()),
            "w1",
            Duration::ZERO,
            ProtocolVersion::V1,
        )
        .unwrap();

        // status, u16 name length, name, then the PNG with no elapsed field.
        assert_eq!(&bytes[..5], &[1, 0, 2, b'w', b'1']);
        assert_eq!(&bytes[5..], codec::encode_png(&image).unwrap().as_slice());

        let response = codec::decode_response(&bytes, ProtocolVersion::V1).unwrap();
        assert_eq!(response.elapsed_ms, None);
        assert_eq!(response.image().unwrap().unwrap(), image);
    }
}
