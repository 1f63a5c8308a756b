//! Audio stream mapping for the assemble stage
//!
//! Editors want uncompressed audio in predictable layouts: a stereo track
//! is always present, and sources with more than two channels additionally
//! keep a 5.1 Surround track in front of it. The optional voice channel
//! leaves the container entirely and lands in a sibling .wav.

use std::path::Path;

/// Channel counts with a well-known layout; only then may the encoder be
/// told not to guess
fn has_concrete_layout(channels: u32) -> bool {
    matches!(channels, 1 | 2 | 6 | 8)
}

/// Audio argv chunk for the final container
///
/// `audio_input` is the ffmpeg input index carrying the source audio.
/// Returns an empty chunk when the job has no audio at all.
pub fn assemble_audio_args(main_channels: u32, audio_input: usize) -> Vec<String> {
    if main_channels == 0 {
        return Vec::new();
    }

    let stream = format!("{}:a:0", audio_input);
    let mut args: Vec<String> = Vec::new();
    let mut track = 0usize;

    if main_channels > 2 {
        // Surround first, stereo behind it
        args.extend([
            "-map".to_string(),
            stream.clone(),
            format!("-codec:a:{}", track),
            "pcm_s24le".to_string(),
            format!("-ac:a:{}", track),
            "6".to_string(),
            format!("-metadata:s:a:{}", track),
            "title=Surround".to_string(),
        ]);
        track += 1;
    }

    args.extend([
        "-map".to_string(),
        stream,
        format!("-codec:a:{}", track),
        "pcm_s24le".to_string(),
        format!("-ac:a:{}", track),
        "2".to_string(),
        format!("-metadata:s:a:{}", track),
        "title=Stereo".to_string(),
    ]);

    if has_concrete_layout(main_channels) {
        args.extend(["-guess_layout_max".to_string(), "0".to_string()]);
    }

    args
}

/// Argv chunk writing the voice stream to a sibling .wav
///
/// The voice channel is usually mono; it is upgraded to stereo so every
/// player treats it alike.
pub fn voice_split_args(audio_input: usize, wav_path: &Path) -> Vec<String> {
    vec![
        "-map".to_string(),
        format!("{}:a:1", audio_input),
        "-codec:a".to_string(),
        "pcm_s24le".to_string(),
        "-ac".to_string(),
        "2".to_string(),
        wav_path.display().to_string(),
    ]
}
