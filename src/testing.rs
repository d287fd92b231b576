//! Signal and corpus generators shared by the unit tests.

use std::f32::consts::PI;
use std::path::Path;

use crate::config::CryClass;

pub fn sine(freq: f32, sample_rate: u32, duration: f32) -> Vec<f32> {
    let num_samples = (sample_rate as f32 * duration) as usize;
    (0..num_samples)
        .map(|i| 0.5 * (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
        .collect()
}

/// Writes 16-bit mono PCM.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for &s in samples {
        writer
            .write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .unwrap();
    }
    writer.finalize().unwrap();
}

/// Creates one directory per class, each holding `files_per_class` short
/// tones whose pitch depends on the class so the classes are separable.
pub fn write_corpus(root: &Path, files_per_class: usize, sample_rate: u32, duration: f32) {
    for (idx, class) in CryClass::ALL.iter().enumerate() {
        let dir = root.join(class.as_str());
        std::fs::create_dir_all(&dir).unwrap();
        for file in 0..files_per_class {
            let freq = 200.0 + idx as f32 * 450.0 + file as f32 * 7.0;
            write_wav(
                &dir.join(format!("{}_{file}.wav", class.as_str())),
                &sine(freq, sample_rate, duration),
                sample_rate,
            );
        }
        std::fs::write(dir.join("notes.txt"), "not audio").unwrap();
    }
}
