//! Oatmeal frame dissector for raw serial captures.
//!
//! Reads a byte capture (a file, or stdin with `-`), locates frames the
//! same way the port receiver does, validates their check bytes, and prints
//! one decoded line per frame. Bytes belonging to no valid frame are
//! summarised as noise. Corrupt frames are reported, not fatal; only I/O
//! failures exit non-zero.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing::debug;

use oatmeal::codec::checksum::validate_frame;
use oatmeal::codec::{is_token_byte, MAX_MSG_LEN, MIN_MSG_LEN};
use oatmeal::{ArgParser, Flag, Message};

/// Frame dissector for raw Oatmeal serial captures
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a raw byte capture, or '-' for stdin
    input: PathBuf,

    /// Show raw frame bytes as hex
    #[arg(short = 'x', long)]
    hex: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("oatmeal_dissect=debug".parse()?),
            )
            .init();
    }

    if args.no_color {
        colored::control::set_override(false);
    }

    let data = if args.input.as_os_str() == "-" {
        let mut buf = Vec::new();
        io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read stdin")?;
        buf
    } else {
        fs::read(&args.input)
            .with_context(|| format!("Failed to read capture file: {:?}", args.input))?
    };
    debug!(len = data.len(), "capture loaded");

    let summary = dissect_capture(&data, args.hex);
    println!(
        "{} frames, {} corrupt, {} noise bytes",
        summary.frames, summary.corrupt, summary.noise_bytes
    );

    Ok(())
}

#[derive(Debug, Default)]
struct Summary {
    frames: usize,
    corrupt: usize,
    noise_bytes: usize,
}

/// Walk the capture with the receiver's frame-boundary rules, printing one
/// line per candidate frame.
fn dissect_capture(data: &[u8], show_hex: bool) -> Summary {
    let mut summary = Summary::default();
    let mut pos = 0;
    let mut noise_run = 0usize;

    while pos < data.len() {
        if data[pos] != b'<' {
            // The newline terminating each frame is expected, not noise.
            if data[pos] != b'\n' {
                noise_run += 1;
            }
            pos += 1;
            continue;
        }
        match scan_candidate(&data[pos..]) {
            Some(len) => {
                flush_noise(&mut summary, &mut noise_run, pos);
                let frame = &data[pos..pos + len];
                print_frame(pos, frame, show_hex, &mut summary);
                pos += len;
            }
            None => {
                noise_run += 1;
                pos += 1;
            }
        }
    }
    flush_noise(&mut summary, &mut noise_run, data.len());
    summary
}

/// Length of the candidate frame at the start of `data`: everything up to
/// the first `>` plus the two check bytes, as the receiver would take it.
/// `None` when the capture ends first or another `<` interrupts.
fn scan_candidate(data: &[u8]) -> Option<usize> {
    for (i, &b) in data.iter().enumerate().skip(1) {
        match b {
            b'>' => {
                let len = i + 3;
                return (len <= data.len() && len <= MAX_MSG_LEN).then_some(len);
            }
            b'<' => return None,
            _ => {
                if i >= MAX_MSG_LEN {
                    return None;
                }
            }
        }
    }
    None
}

fn flush_noise(summary: &mut Summary, noise_run: &mut usize, at: usize) {
    if *noise_run > 0 {
        println!(
            "{}",
            format!("{:06x}  .. {} noise bytes", at - *noise_run, noise_run).dimmed()
        );
        summary.noise_bytes += *noise_run;
        *noise_run = 0;
    }
}

fn print_frame(offset: usize, frame: &[u8], show_hex: bool, summary: &mut Summary) {
    let valid = frame.len() >= MIN_MSG_LEN && validate_frame(frame);
    if !valid {
        summary.corrupt += 1;
        println!(
            "{:06x}  {}  {}",
            offset,
            "BAD ".red().bold(),
            String::from_utf8_lossy(frame)
        );
        return;
    }
    summary.frames += 1;

    let msg = match Message::from_frame(frame) {
        Some(msg) => msg,
        None => return,
    };
    let cmd = printable(&msg.cmd());
    let token = printable(&msg.token());
    let flag = flag_name(msg.flag());
    let rendered = render_args(&msg);

    print!(
        "{:06x}  {}  {} {:10} {}  {}",
        offset,
        "OK  ".green(),
        cmd.bold(),
        flag,
        token,
        rendered
    );
    if show_hex {
        print!("  {}", hex_string(frame).dimmed());
    }
    println!();
}

fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if is_token_byte(b) {
                char::from(b)
            } else {
                '.'
            }
        })
        .collect()
}

fn flag_name(flag: u8) -> String {
    match Flag::from_wire(flag) {
        Some(Flag::Request) => "request".into(),
        Some(Flag::Ack) => "ack".into(),
        Some(Flag::Done) => "done".into(),
        Some(Flag::Failed) => "failed".into(),
        Some(Flag::Background) => "background".into(),
        None => format!("flag 0x{flag:02x}"),
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Render a payload by walking the argument grammar with the library
/// parser. Anything unparseable is shown raw and flagged.
fn render_args(msg: &Message) -> String {
    let mut parser = ArgParser::from_msg(msg);
    let mut out = String::from("(");
    let mut first = true;
    loop {
        if parser.finished() {
            out.push(')');
            return out;
        }
        if !first {
            out.push_str(", ");
        }
        if !render_value(&mut parser, &mut out) {
            return format!(
                "(unparseable args: {:?})",
                String::from_utf8_lossy(msg.args())
            );
        }
        first = false;
    }
}

/// Render the next value, trying each argument type in turn.
fn render_value(parser: &mut ArgParser, out: &mut String) -> bool {
    use std::fmt::Write as _;

    if parser.parse_null() {
        out.push_str("None");
        return true;
    }
    // Strings and blobs go before numbers: a blob like 0"…" would
    // otherwise be misread as the integer zero.
    let mut buf = [0u8; MAX_MSG_LEN];
    let mut probe = *parser;
    if let Some(n) = probe.parse_str(&mut buf) {
        *parser = probe;
        let _ = write!(out, "{:?}", String::from_utf8_lossy(&buf[..n]));
        return true;
    }
    let mut probe = *parser;
    if let Some(n) = probe.parse_bytes(&mut buf) {
        *parser = probe;
        out.push_str("0x");
        for &b in &buf[..n] {
            let _ = write!(out, "{b:02x}");
        }
        return true;
    }
    // Numbers: prefer an integer reading over a real one, but only when it
    // consumes as much input, so "1.5" is not cut short at "1".
    let mut as_int = *parser;
    let int_val = as_int.parse::<i64>();
    let mut as_uint = *parser;
    let uint_val = as_uint.parse::<u64>();
    let mut as_real = *parser;
    let real_val = as_real.parse::<f64>();
    let real_rem = as_real.remaining().len();
    if let Some(i) = int_val {
        if real_val.is_none() || as_int.remaining().len() <= real_rem {
            *parser = as_int;
            let _ = write!(out, "{i}");
            return true;
        }
    } else if let Some(u) = uint_val {
        if real_val.is_none() || as_uint.remaining().len() <= real_rem {
            *parser = as_uint;
            let _ = write!(out, "{u}");
            return true;
        }
    }
    if let Some(r) = real_val {
        *parser = as_real;
        let _ = write!(out, "{r}");
        return true;
    }
    if let Some(b) = parser.parse::<bool>() {
        out.push_str(if b { "True" } else { "False" });
        return true;
    }
    if parser.parse_list_start() {
        out.push('[');
        let mut first = true;
        loop {
            if parser.parse_list_end() {
                out.push(']');
                return true;
            }
            if !first {
                out.push_str(", ");
            }
            if !render_value(parser, out) {
                return false;
            }
            first = false;
        }
    }
    if parser.parse_dict_start() {
        out.push('{');
        let mut first = true;
        loop {
            if parser.parse_dict_end() {
                out.push('}');
                return true;
            }
            if !first {
                out.push_str(", ");
            }
            let Some(key) = parser.parse_dict_key() else {
                return false;
            };
            let _ = write!(out, "{key}=");
            if !render_value(parser, out) {
                return false;
            }
            first = false;
        }
    }
    false
}
