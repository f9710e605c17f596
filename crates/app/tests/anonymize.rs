mod common;

use anonymizer::{Anonymizer, PipelineError, RegionPolicy};
use common::{
    BagFixture, FailingRefiner, FixedDetector, IMU_TYPE, QOS, QuadrantRefiner, header,
    noisy_square, patterned_raw, png_image, raw_image, read_all, square, variance,
};
use rosbag_io::{
    BagMetadata, BagReader, COMPRESSED_IMAGE_TYPE, Frame, IMAGE_TYPE, PixelEncoding, RawImage,
    decode_image, staging_path,
};

fn decoded(message: &rosbag_io::BagMessage) -> Frame {
    decode_image(message).unwrap().unwrap().0
}

fn anonymizer(
    fixture: &BagFixture,
    region: RegionPolicy,
    detections: Vec<ml_core::Detection>,
) -> Anonymizer {
    let mut config = fixture.config(region);
    config.blur.kernel_size = 15;
    config.blur.sigma_x = 0.0;
    Anonymizer::new(
        config,
        Box::new(FixedDetector { detections }),
        Some(Box::new(QuadrantRefiner)),
    )
    .unwrap()
}

#[test]
fn non_image_messages_pass_through_untouched() {
    let frame = noisy_square(32, 32, 8, 24);
    let fixture = BagFixture::new(&[
        ("/imu", IMU_TYPE, 10, vec![0, 1, 0, 0, 7, 7, 7, 7]),
        ("/cam", IMAGE_TYPE, 20, raw_image(&frame, PixelEncoding::Bgr8, 1)),
        ("/imu", IMU_TYPE, 30, vec![0, 1, 0, 0, 9, 9]),
        ("/tf", "tf2_msgs/msg/TFMessage", 30, vec![0, 1, 0, 0]),
    ]);
    let summary = anonymizer(&fixture, RegionPolicy::Box, vec![])
        .run()
        .unwrap();
    assert_eq!(summary.passthrough, 3);
    assert_eq!(summary.images, 1);

    let input = read_all(&fixture.input);
    let output = read_all(&fixture.output);
    assert_eq!(output.len(), input.len());
    for (before, after) in input.iter().zip(&output) {
        assert_eq!(after.topic, before.topic);
        assert_eq!(after.type_name, before.type_name);
        assert_eq!(after.timestamp, before.timestamp);
        if !before.is_image() {
            assert_eq!(after.data, before.data);
        }
    }

    let reader = BagReader::open(&fixture.output).unwrap();
    assert!(reader.qos_profile_map().values().all(|qos| qos == QOS));
}

#[test]
fn output_bag_is_indexed_and_keeps_silent_topics() {
    let frame = noisy_square(16, 16, 4, 12);
    let fixture = BagFixture::with_silent_topics(
        &[
            ("/cam", IMAGE_TYPE, 100, raw_image(&frame, PixelEncoding::Bgr8, 1)),
            ("/imu", IMU_TYPE, 250, vec![0, 1, 0, 0]),
        ],
        &[("/diagnostics", "diagnostic_msgs/msg/DiagnosticArray")],
    );
    anonymizer(&fixture, RegionPolicy::Box, vec![])
        .run()
        .unwrap();

    let reader = BagReader::open(&fixture.output).unwrap();
    assert_eq!(reader.topics().len(), 3);
    assert_eq!(
        reader.qos_profile_map().get("/diagnostics").map(String::as_str),
        Some(QOS)
    );

    let metadata = BagMetadata::load(&fixture.output).unwrap().unwrap();
    assert_eq!(metadata.message_count, 2);
    assert_eq!(metadata.starting_time.nanoseconds_since_epoch, 100);
    assert_eq!(metadata.duration.nanoseconds, 150);
    assert_eq!(metadata.topic("/cam").unwrap().message_count, 1);
    assert_eq!(metadata.topic("/diagnostics").unwrap().message_count, 0);
}

#[test]
fn image_count_and_order_are_preserved_per_topic() {
    let frame = noisy_square(32, 32, 8, 24);
    let mut messages = Vec::new();
    for i in 0..5i64 {
        messages.push(("/front", IMAGE_TYPE, i * 100, raw_image(&frame, PixelEncoding::Rgb8, 1)));
        messages.push(("/rear", COMPRESSED_IMAGE_TYPE, i * 100 + 50, png_image(&frame, 1)));
    }
    let fixture = BagFixture::new(&messages);
    anonymizer(&fixture, RegionPolicy::Box, vec![square(8.0, 24.0, 0.9, 0)])
        .run()
        .unwrap();

    let output = read_all(&fixture.output);
    for topic in ["/front", "/rear"] {
        let stamps: Vec<i64> = output
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.timestamp)
            .collect();
        let expected: Vec<i64> = messages
            .iter()
            .filter(|(t, ..)| *t == topic)
            .map(|(_, _, ts, _)| *ts)
            .collect();
        assert_eq!(stamps, expected);
    }
    assert!(
        output
            .iter()
            .filter(|m| m.topic == "/front")
            .all(|m| m.type_name == IMAGE_TYPE)
    );
    assert!(
        output
            .iter()
            .filter(|m| m.topic == "/rear")
            .all(|m| m.type_name == COMPRESSED_IMAGE_TYPE)
    );
}

#[test]
fn compressed_image_box_is_blurred_and_surroundings_kept() {
    let frame = noisy_square(64, 64, 16, 48);
    let fixture = BagFixture::new(&[("/cam", COMPRESSED_IMAGE_TYPE, 42, png_image(&frame, 3))]);
    anonymizer(&fixture, RegionPolicy::Box, vec![square(16.0, 48.0, 0.8, 0)])
        .run()
        .unwrap();

    let output = read_all(&fixture.output);
    assert_eq!(output.len(), 1);
    assert_eq!(output[0].topic, "/cam");
    assert_eq!(output[0].timestamp, 42);
    assert_eq!(output[0].type_name, COMPRESSED_IMAGE_TYPE);

    let (blurred, source) = decode_image(&output[0]).unwrap().unwrap();
    assert_eq!(source.header, header(3));
    assert!(variance(&blurred, 16, 48) < variance(&frame, 16, 48) / 4.0);

    // Output is JPEG, so the flat surroundings are compared with a small tolerance.
    for y in 0..64 {
        for x in 0..64 {
            if (16..48).contains(&x) && (16..48).contains(&y) {
                continue;
            }
            let value = blurred.pixel(x, y)[0] as i32;
            assert!((value - 128).abs() <= 3, "pixel ({x},{y}) changed to {value}");
        }
    }
}

#[test]
fn raw_image_keeps_encoding_and_untouched_pixels() {
    let frame = noisy_square(48, 40, 8, 32);
    let fixture = BagFixture::new(&[("/cam", IMAGE_TYPE, 7, raw_image(&frame, PixelEncoding::Rgb8, 2))]);
    anonymizer(&fixture, RegionPolicy::Box, vec![square(8.0, 32.0, 0.7, 1)])
        .run()
        .unwrap();

    let output = read_all(&fixture.output);
    let raw = RawImage::from_cdr(&output[0].data).unwrap();
    assert_eq!(raw.encoding, "rgb8");
    assert_eq!(raw.header, header(2));

    let blurred = raw.to_frame().unwrap();
    assert!(variance(&blurred, 8, 32) < variance(&frame, 8, 32) / 4.0);
    for y in 0..40 {
        for x in 0..48 {
            if !((8..32).contains(&x) && (8..32).contains(&y)) {
                assert_eq!(blurred.pixel(x, y), frame.pixel(x, y));
            }
        }
    }
}

#[test]
fn threshold_above_every_score_leaves_frames_identical() {
    let frame = noisy_square(32, 32, 4, 28);
    let fixture = BagFixture::new(&[("/cam", IMAGE_TYPE, 1, raw_image(&frame, PixelEncoding::Bgr8, 1))]);
    let mut config = fixture.config(RegionPolicy::Box);
    config.detector.confidence = 0.95;
    let detections = vec![square(4.0, 28.0, 0.9, 0), square(0.0, 10.0, 0.94, 1)];
    let summary = Anonymizer::new(config, Box::new(FixedDetector { detections }), None)
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.detections, 0);

    let output = read_all(&fixture.output);
    assert_eq!(decoded(&output[0]), frame);
}

#[test]
fn empty_detections_write_raw_bytes_back_unchanged() {
    let encodings = [
        PixelEncoding::Bgra8,
        PixelEncoding::Rgba8,
        PixelEncoding::Mono16,
        PixelEncoding::Bgr16,
        PixelEncoding::Rgb16,
    ];
    let inputs: Vec<RawImage> = encodings
        .iter()
        .map(|&encoding| patterned_raw(24, 16, encoding, 1))
        .collect();
    let messages: Vec<_> = ["/bgra", "/rgba", "/depth", "/bgr16", "/rgb16"]
        .into_iter()
        .zip(&inputs)
        .enumerate()
        .map(|(i, (topic, image))| (topic, IMAGE_TYPE, i as i64, image.to_cdr()))
        .collect();
    let fixture = BagFixture::new(&messages);
    anonymizer(&fixture, RegionPolicy::Box, vec![])
        .run()
        .unwrap();

    let output = read_all(&fixture.output);
    assert_eq!(output.len(), inputs.len());
    for (message, input) in output.iter().zip(&inputs) {
        assert_eq!(&RawImage::from_cdr(&message.data).unwrap(), input, "{}", message.topic);
    }
}

#[test]
fn blurring_16_bit_images_keeps_bytes_outside_the_box() {
    let mut input = patterned_raw(32, 32, PixelEncoding::Mono16, 1);
    input.is_bigendian = true;
    let fixture = BagFixture::new(&[("/depth", IMAGE_TYPE, 1, input.to_cdr())]);
    anonymizer(&fixture, RegionPolicy::Box, vec![square(8.0, 24.0, 0.9, 0)])
        .run()
        .unwrap();

    let output = RawImage::from_cdr(&read_all(&fixture.output)[0].data).unwrap();
    assert_eq!(output.encoding, "mono16");
    assert!(output.is_bigendian);
    assert_eq!(output.step, input.step);
    let mut changed = 0;
    for y in 0..32usize {
        for x in 0..32usize {
            let at = y * 64 + x * 2;
            let (before, after) = (&input.data[at..at + 2], &output.data[at..at + 2]);
            if (8..24).contains(&x) && (8..24).contains(&y) {
                changed += usize::from(before != after);
            } else {
                assert_eq!(before, after, "({x},{y})");
            }
        }
    }
    assert!(changed > 128, "only {changed} pixels blurred");
}

#[test]
fn mask_region_blurs_only_masked_pixels() {
    let frame = noisy_square(64, 64, 16, 48);
    let fixture = BagFixture::new(&[("/cam", IMAGE_TYPE, 1, raw_image(&frame, PixelEncoding::Bgr8, 1))]);
    anonymizer(&fixture, RegionPolicy::Mask, vec![square(16.0, 48.0, 0.9, 0)])
        .run()
        .unwrap();

    let blurred = decoded(&read_all(&fixture.output)[0]);
    assert!(variance(&blurred, 16, 32) < variance(&frame, 16, 32) / 4.0);
    for y in 0..64 {
        for x in 0..64 {
            if !((16..32).contains(&x) && (16..32).contains(&y)) {
                assert_eq!(blurred.pixel(x, y), frame.pixel(x, y), "({x},{y})");
            }
        }
    }
}

#[test]
fn segmentation_failure_aborts_without_publishing_output() {
    let frame = noisy_square(32, 32, 8, 24);
    let fixture = BagFixture::new(&[
        ("/imu", IMU_TYPE, 1, vec![0, 1, 0, 0]),
        ("/cam", IMAGE_TYPE, 2, raw_image(&frame, PixelEncoding::Bgr8, 1)),
    ]);
    let config = fixture.config(RegionPolicy::Mask);
    let detector = FixedDetector {
        detections: vec![square(8.0, 24.0, 0.9, 0)],
    };
    let err = Anonymizer::new(config, Box::new(detector), Some(Box::new(FailingRefiner)))
        .unwrap()
        .run()
        .unwrap_err();

    assert!(matches!(err, PipelineError::Segmentation { index: 0, .. }));
    assert!(!fixture.output.exists());
    assert!(staging_path(&fixture.output).exists());
}

#[test]
fn unknown_raw_encoding_fails_before_writing() {
    let mut image = RawImage::from_frame(&Frame::filled(4, 4, [0, 0, 0]), header(1), PixelEncoding::Bgr8);
    image.encoding = "yuv422".into();
    let fixture = BagFixture::new(&[
        ("/imu", IMU_TYPE, 1, vec![0, 1, 0, 0]),
        ("/cam", IMAGE_TYPE, 2, image.to_cdr()),
    ]);
    let err = anonymizer(&fixture, RegionPolicy::Box, vec![])
        .run()
        .unwrap_err();

    assert!(matches!(err, PipelineError::UnsupportedEncoding(name) if name == "yuv422"));
    assert!(!fixture.output.exists());
    assert!(!staging_path(&fixture.output).exists());
}

#[test]
fn compress_flag_turns_raw_images_into_jpeg() {
    let frame = noisy_square(32, 32, 8, 24);
    let fixture = BagFixture::new(&[("/cam", IMAGE_TYPE, 5, raw_image(&frame, PixelEncoding::Mono8, 4))]);
    let mut config = fixture.config(RegionPolicy::Box);
    config.rosbag.output_save_compressed_image = true;
    Anonymizer::new(config, Box::new(FixedDetector { detections: vec![] }), None)
        .unwrap()
        .run()
        .unwrap();

    let output = read_all(&fixture.output);
    assert_eq!(output[0].type_name, COMPRESSED_IMAGE_TYPE);
    let (_, source) = decode_image(&output[0]).unwrap().unwrap();
    assert_eq!(source.header, header(4));
}

#[test]
fn debug_preview_does_not_change_output() {
    let frame = noisy_square(32, 32, 8, 24);
    let messages = [("/cam", IMAGE_TYPE, 5, raw_image(&frame, PixelEncoding::Bgr8, 1))];
    let detections = vec![square(8.0, 24.0, 0.9, 0)];

    let plain = BagFixture::new(&messages);
    anonymizer(&plain, RegionPolicy::Box, detections.clone())
        .run()
        .unwrap();

    let debug = BagFixture::new(&messages);
    let mut config = debug.config(RegionPolicy::Box);
    config.blur.kernel_size = 15;
    config.blur.sigma_x = 0.0;
    config.debug.print_on_terminal = true;
    config.debug.show_on_image = true;
    Anonymizer::new(config.clone(), Box::new(FixedDetector { detections }), None)
        .unwrap()
        .run()
        .unwrap();

    assert!(config.debug.preview_path.is_file());
    assert_eq!(
        decoded(&read_all(&debug.output)[0]),
        decoded(&read_all(&plain.output)[0])
    );
}
