#![allow(dead_code)]

use std::path::Path;

use rosbag_io::{BagWriter, QosProfileMap, WriterOptions};

pub const RELIABLE_QOS: &str = "- history: 3\n  depth: 0\n  reliability: 1\n  durability: 2\n";
pub const BEST_EFFORT_QOS: &str = "- history: 3\n  depth: 0\n  reliability: 2\n  durability: 2\n";

pub fn qos_map(topics: &[&str]) -> QosProfileMap {
    topics
        .iter()
        .enumerate()
        .map(|(idx, topic)| {
            let profile = if idx % 2 == 0 {
                RELIABLE_QOS
            } else {
                BEST_EFFORT_QOS
            };
            (topic.to_string(), profile.to_string())
        })
        .collect()
}

/// Write `messages` as (topic, type, timestamp, payload) into a fresh bag.
pub fn write_bag(path: &Path, qos: QosProfileMap, messages: &[(&str, &str, i64, Vec<u8>)]) {
    let mut writer = BagWriter::create(path, WriterOptions::default(), qos).unwrap();
    for (topic, type_name, timestamp, data) in messages {
        writer.write_any(data, type_name, topic, *timestamp).unwrap();
    }
    writer.finish().unwrap();
}
