//! A stand-in for both `ffprobe` and `ffmpeg`, built only for integration
//! tests (invoked via `CARGO_BIN_EXE_mediabox-mock-ffmpeg`). Mode is
//! selected by argv shape: `-show_streams` means "act like ffprobe",
//! anything else means "act like ffmpeg and materialize the requested
//! output file".

use std::env;
use std::fs;
use std::io::Write;

fn main() {
    let argv: Vec<String> = env::args().skip(1).collect();

    if let Ok(capture_path) = env::var("MEDIABOX_MOCK_CAPTURE_PATH") {
        if let Some(parent) = std::path::Path::new(&capture_path).parent() {
            let _ = fs::create_dir_all(parent);
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&capture_path)
            .expect("mock must open capture file");
        let line = serde_json::to_string(&argv).expect("argv must serialize");
        writeln!(file, "{line}").expect("mock must write capture line");
    }

    if argv.iter().any(|a| a == "-show_streams") {
        run_ffprobe();
    } else {
        run_ffmpeg(&argv);
    }
}

fn run_ffprobe() {
    let json = env::var("MEDIABOX_MOCK_PROBE_JSON").unwrap_or_else(|_| default_probe_json());
    print!("{json}");
    let code: i32 = env::var("MEDIABOX_MOCK_FFPROBE_EXIT_CODE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    std::process::exit(code);
}

fn default_probe_json() -> String {
    r#"{"streams":[{"index":0,"codec_type":"video","codec_name":"h264","width":1920,"height":1080,"pix_fmt":"yuv420p","disposition":{"default":1,"forced":0}},{"index":1,"codec_type":"audio","codec_name":"aac","channels":2,"channel_layout":"stereo","tags":{"language":"eng"},"disposition":{"default":1,"forced":0}}],"format":{"format_name":"mov,mp4,m4a,3gp,3g2,mj2","duration":"120.0","bit_rate":"1000000"}}"#.to_string()
}

fn run_ffmpeg(argv: &[String]) {
    if let Ok(stderr_text) = env::var("MEDIABOX_MOCK_FFMPEG_STDERR") {
        eprint!("{stderr_text}");
    }

    let code: i32 = env::var("MEDIABOX_MOCK_FFMPEG_EXIT_CODE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if code == 0 {
        if let Some(output) = argv.last() {
            if let Some(parent) = std::path::Path::new(output).parent() {
                let _ = fs::create_dir_all(parent);
            }
            fs::write(output, b"mock media payload").expect("mock must write output file");
        }
    }

    std::process::exit(code);
}
