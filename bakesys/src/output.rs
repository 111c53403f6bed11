/*!
Titled output streams.

Every subprocess the executor drives gets its own output stream; each line
is prefixed with a colored title so interleaved logs from concurrent builds
remain attributable.
*/

use std::io::Write;
use std::sync::Mutex;

use rand::seq::SliceRandom;

/// Writes lines for one subprocess, prefixed with its title.
pub struct OutputStream {
    prefix: Vec<u8>,
}

impl OutputStream {
    fn new(title: &str, color: Option<&str>) -> Self {
        let mut prefix = Vec::new();
        if !title.is_empty() {
            match color {
                Some(color) => {
                    prefix.extend_from_slice(color.as_bytes());
                    prefix.extend_from_slice(title.as_bytes());
                    prefix.extend_from_slice(b"\x1b[0m: ");
                }
                None => {
                    prefix.extend_from_slice(title.as_bytes());
                    prefix.extend_from_slice(b": ");
                }
            }
        }
        Self { prefix }
    }

    /// Write a single line. Set `err` to route it to stderr.
    pub fn write(&self, line: &[u8], err: bool) {
        let write_to = |stream: &mut dyn Write| {
            let _ = stream.write_all(&self.prefix);
            let _ = stream.write_all(line);
            if !line.ends_with(b"\n") {
                let _ = stream.write_all(b"\n");
            }
            let _ = stream.flush();
        };
        if err {
            write_to(&mut std::io::stderr().lock());
        } else {
            write_to(&mut std::io::stdout().lock());
        }
    }

    pub fn write_str(&self, line: &str) {
        self.write(line.as_bytes(), false);
    }
}

/// Creates titled output streams, cycling through a shuffled palette of
/// ANSI colors. White and black variants are avoided, leaving twelve
/// usable colors.
pub struct OutputStreamer {
    use_color: bool,
    remaining_colors: Mutex<Vec<&'static str>>,
}

const COLORS: &[&str] = &[
    "\x1b[31m", "\x1b[32m", "\x1b[33m", "\x1b[34m", "\x1b[35m", "\x1b[36m", "\x1b[31;1m",
    "\x1b[32;1m", "\x1b[33;1m", "\x1b[34;1m", "\x1b[35;1m", "\x1b[36;1m",
];

impl OutputStreamer {
    pub fn new(use_color: bool) -> Self {
        Self {
            use_color,
            remaining_colors: Mutex::new(Vec::new()),
        }
    }

    pub fn start_stream(&self, title: &str) -> OutputStream {
        let color = if self.use_color {
            let mut remaining = self.remaining_colors.lock().unwrap();
            if remaining.is_empty() {
                *remaining = COLORS.to_vec();
                remaining.shuffle(&mut rand::thread_rng());
            }
            remaining.pop()
        } else {
            None
        };
        OutputStream::new(title, color)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_construction() {
        let plain = OutputStream::new("app", None);
        assert_eq!(plain.prefix, b"app: ");

        let colored = OutputStream::new("app", Some("\x1b[31m"));
        assert_eq!(colored.prefix, b"\x1b[31mapp\x1b[0m: ");

        let untitled = OutputStream::new("", Some("\x1b[31m"));
        assert!(untitled.prefix.is_empty());
    }

    #[test]
    fn color_palette_cycles() {
        let streamer = OutputStreamer::new(true);
        for _ in 0..(COLORS.len() * 2 + 1) {
            let stream = streamer.start_stream("title");
            assert!(!stream.prefix.is_empty());
        }
    }
}
