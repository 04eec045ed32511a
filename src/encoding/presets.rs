//! Command lines for the external encoder
//!
//! Two invocations are needed:
//!
//! - **Capture**: read the device continuously and cut the stream into
//!   fixed-duration segment files that wrap around after the configured count
//!   (`-f segment -segment_wrap N`). Every segment starts on a keyframe with
//!   reset timestamps so any contiguous run of segments can be concatenated.
//! - **Concat**: stream-copy an ordered list of segments into one container
//!   (`-f concat -c copy`), no re-encode.
//!
//! Both run with `-loglevel error -nostats` so that everything the process
//! writes to stderr is a diagnostic worth classifying.

use std::path::Path;

use crate::config::EncoderSettings;

/// Arguments for the long-running capture process
pub fn capture_args(
    settings: &EncoderSettings,
    device: &Path,
    segment_duration_secs: f64,
    segment_wrap: u32,
    output_pattern: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostats".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
    ];

    // Input
    args.extend([
        "-f".into(),
        settings.input_format.clone(),
        "-framerate".into(),
        settings.framerate.to_string(),
        "-video_size".into(),
        format!("{}x{}", settings.width, settings.height),
        "-i".into(),
        device.to_string_lossy().into_owned(),
    ]);

    // Encoder: low latency, one keyframe per segment boundary
    args.extend([
        "-c:v".into(),
        settings.video_codec.clone(),
        "-b:v".into(),
        settings.bitrate.clone(),
        "-preset".into(),
        settings.preset.clone(),
        "-tune".into(),
        "zerolatency".into(),
        "-profile:v".into(),
        "baseline".into(),
        "-level".into(),
        "3.1".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-force_key_frames".into(),
        format!("expr:gte(t,n_forced*{})", format_secs(segment_duration_secs)),
    ]);

    // Segment muxer
    args.extend([
        "-f".into(),
        "segment".into(),
        "-segment_time".into(),
        format_secs(segment_duration_secs),
        "-segment_wrap".into(),
        segment_wrap.to_string(),
        "-reset_timestamps".into(),
        "1".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        "-flush_packets".into(),
        "1".into(),
        "-fflags".into(),
        "+genpts".into(),
        output_pattern.to_string_lossy().into_owned(),
    ]);

    args
}

/// Arguments for concatenating the segments listed in `list_file` into `output`
pub fn concat_args(list_file: &Path, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-nostats".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list_file.to_string_lossy().into_owned(),
        "-c".into(),
        "copy".into(),
        "-movflags".into(),
        "+faststart".into(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Seconds without a trailing `.0` for whole values (`0.5`, `2`)
fn format_secs(secs: f64) -> String {
    if secs.fract() == 0.0 {
        format!("{}", secs as u64)
    } else {
        format!("{}", secs)
    }
}
