/*!
Build context packaging.

A build context is an immutable description of the files handed to the
container builder: a base directory, an optional umask used to normalize
file modes, and an ordered list of ignore patterns. Contexts can be written
out as deterministic tar archives and hashed three ways: a full hash over
all file content, a cheap symbolic hash over the context parameters, and a
partial hash restricted to files matching a set of patterns.
*/

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use serde_json::json;
use snafu::{ensure, ResultExt};
use walkdir::WalkDir;

use crate::error::{ContextReadSnafu, ContextSnafu, Result};
use crate::hashing::HashWriter;

/// A file injected into the archive after the on-disk walk, placed at the
/// archive root. Used to deliver the rendered build document to the
/// builder.
#[derive(Clone, Debug)]
pub struct ExtraFile {
    pub name: String,
    pub mode: u32,
    pub data: Vec<u8>,
}

/// One segment of an ignore pattern compiled to regex text.
#[derive(Debug)]
enum Segment {
    /// `**`: any number of directory separators, including zero.
    AnyDirs,
    Text { regex: String, simple: bool },
}

fn push_escaped(out: &mut String, ch: char) {
    if ch.is_ascii_punctuation() || ch == ' ' {
        out.push('\\');
    }
    out.push(ch);
}

/// Compile a single path segment of an ignore pattern. The grammar follows
/// Go's `path/filepath.Match` with `**` as a whole-segment extension.
fn compile_segment(segment: &str) -> Result<Segment> {
    if segment == "**" {
        return Ok(Segment::AnyDirs);
    }

    let chars: Vec<char> = segment.chars().collect();
    let mut result = String::new();
    let mut simple = true;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        i += 1;

        match ch {
            '\\' => {
                ensure!(
                    i < chars.len(),
                    ContextSnafu {
                        message: "Trailing escape character",
                    }
                );
                push_escaped(&mut result, chars[i]);
                i += 1;
            }
            '*' => {
                simple = false;
                result.push_str("[^/]*");
            }
            '?' => {
                simple = false;
                result.push_str("[^/]?");
            }
            ']' => {
                return ContextSnafu {
                    message: "Unmatched ']' should be escaped",
                }
                .fail()
            }
            '[' => {
                simple = false;
                result.push('[');
                if i < chars.len() && chars[i] == '^' {
                    result.push('^');
                    i += 1;
                }

                let mut range_start: Option<char> = None;
                let mut cclass_empty = true;
                let mut char_avail = false;
                let mut last_char = '\0';
                loop {
                    ensure!(
                        i < chars.len(),
                        ContextSnafu {
                            message: "Unclosed character class",
                        }
                    );
                    let mut ch = chars[i];
                    i += 1;

                    if ch == '\\' {
                        ensure!(
                            i < chars.len(),
                            ContextSnafu {
                                message: "Trailing escape character",
                            }
                        );
                        ch = chars[i];
                        i += 1;
                    } else if ch == ']' {
                        ensure!(
                            range_start.is_none(),
                            ContextSnafu {
                                message: "Unclosed character range",
                            }
                        );
                        ensure!(
                            !cclass_empty,
                            ContextSnafu {
                                message: "Empty character class",
                            }
                        );
                        break;
                    } else if ch == '-' {
                        ensure!(
                            char_avail,
                            ContextSnafu {
                                message: "Unexpected '-' in character class",
                            }
                        );
                        range_start = Some(last_char);
                        result.push('-');
                        char_avail = false;
                        continue;
                    } else if ch == '[' {
                        return ContextSnafu {
                            message: "'[' in character class should be escaped",
                        }
                        .fail();
                    }

                    if let Some(start) = range_start {
                        ensure!(
                            start <= ch,
                            ContextSnafu {
                                message: "Invalid character range",
                            }
                        );
                        range_start = None;
                    } else {
                        char_avail = true;
                        last_char = ch;
                    }
                    push_escaped(&mut result, ch);
                    cclass_empty = false;
                }
                result.push(']');
            }
            _ => push_escaped(&mut result, ch),
        }
    }

    Ok(Segment::Text { regex: result, simple })
}

/// Compile a whole ignore pattern into regex text. The produced expression
/// matches the pattern itself and everything beneath a match. With
/// `match_prefix` set (used for un-ignore patterns) it additionally matches
/// every proper path prefix, provided all pattern segments before the last
/// are simple literals; this keeps the ancestor directories of an
/// un-ignored path alive.
pub(crate) fn compile_pattern(pattern: &str, match_prefix: bool) -> Result<String> {
    let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    ensure!(
        !segments.is_empty(),
        ContextSnafu {
            message: "Empty pattern",
        }
    );

    let mut pieces = Vec::with_capacity(segments.len());
    for segment in &segments {
        pieces.push(compile_segment(segment)?);
    }

    let prefix_ok = match_prefix
        && pieces[..pieces.len() - 1]
            .iter()
            .all(|piece| matches!(piece, Segment::Text { simple: true, .. }));

    fn piece_text(piece: &Segment) -> String {
        match piece {
            Segment::AnyDirs => "(?:/[^/]+)*".to_string(),
            Segment::Text { regex, .. } => format!("/{regex}"),
        }
    }

    // Anything beneath a full match also matches.
    let mut regex = format!(
        "{}(?:/.*)?",
        piece_text(&pieces[pieces.len() - 1])
    );
    for piece in pieces[..pieces.len() - 1].iter().rev() {
        if prefix_ok {
            regex = format!("{}(?:{})?", piece_text(piece), regex);
        } else {
            regex = format!("{}{}", piece_text(piece), regex);
        }
    }
    Ok(regex)
}

/// A compiled ignore pattern. A leading `!` marks an un-ignore pattern.
#[derive(Debug)]
pub struct ContextPattern {
    pub ignoring: bool,
    regex: Regex,
    regex_text: String,
}

impl ContextPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let (ignoring, body) = match pattern.strip_prefix('!') {
            Some(rest) => (false, rest),
            None => (true, pattern),
        };
        let regex_text = compile_pattern(body, !ignoring)?;
        let regex = Regex::new(&format!("^(?:{regex_text})$")).map_err(|err| {
            ContextSnafu {
                message: format!("invalid pattern {pattern:?}: {err}"),
            }
            .build()
        })?;
        Ok(Self {
            ignoring,
            regex,
            regex_text,
        })
    }

    /// Match against a path with a leading separator, e.g. `/a/b.txt`.
    fn matches(&self, slashed_path: &str) -> bool {
        self.regex.is_match(slashed_path)
    }
}

/// Immutable description of a build context. A `base_dir` of `None` means a
/// synthetic empty context.
pub struct BuildContext {
    base_dir: Option<PathBuf>,
    umask: Option<u32>,
    patterns: Vec<ContextPattern>,
    file_digests: Mutex<HashMap<PathBuf, String>>,
    full_hash_memo: Mutex<Option<String>>,
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("base_dir", &self.base_dir)
            .field("umask", &self.umask)
            .field("patterns", &self.patterns.len())
            .finish()
    }
}

impl BuildContext {
    /// Compile a context from its configuration. Blank lines and comment
    /// lines in the ignore list are skipped.
    pub fn new<I, S>(base_dir: Option<PathBuf>, umask: Option<u32>, ignore_lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut patterns = Vec::new();
        for line in ignore_lines {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            patterns.push(ContextPattern::new(line)?);
        }
        Ok(Self {
            base_dir,
            umask,
            patterns,
            file_digests: Mutex::new(HashMap::new()),
            full_hash_memo: Mutex::new(None),
        })
    }

    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    /// Evaluate the ignore patterns against a relative path. The last
    /// pattern that applies wins; a path is delivered iff the final outcome
    /// is not ignored.
    pub fn ignored(&self, rel_path: &str) -> bool {
        let slashed = format!("/{rel_path}");
        let mut ignored = false;
        for pattern in &self.patterns {
            if pattern.ignoring == ignored {
                continue;
            }
            if pattern.matches(&slashed) {
                ignored = pattern.ignoring;
            }
        }
        ignored
    }

    fn normalize_mode(&self, mode: u32) -> u32 {
        match self.umask {
            Some(umask) => {
                let user = mode & 0o700;
                (user | (user >> 3) | (user >> 6)) & !umask & 0o777
            }
            None => mode & 0o777,
        }
    }

    /// Write the context as a tar archive (optionally gzip-compressed) with
    /// any `extra_files` appended at the archive root. The output is a pure
    /// function of the on-disk contents (modulo mtime and ownership), the
    /// umask, and the pattern list.
    pub fn write_archive<W: Write>(
        &self,
        writer: W,
        compress: bool,
        extra_files: &[ExtraFile],
    ) -> Result<()> {
        if compress {
            let encoder = GzEncoder::new(writer, Compression::default());
            let encoder = self.write_archive_raw(encoder, extra_files)?;
            encoder.finish().map_err(archive_error)?;
        } else {
            self.write_archive_raw(writer, extra_files)?;
        }
        Ok(())
    }

    fn write_archive_raw<W: Write>(&self, writer: W, extra_files: &[ExtraFile]) -> Result<W> {
        let mut builder = tar::Builder::new(writer);

        let root_mode = match &self.base_dir {
            Some(dir) => std::fs::symlink_metadata(dir)
                .context(ContextReadSnafu { path: dir.clone() })?
                .permissions()
                .mode(),
            None => 0o777,
        };
        let mut header = entry_header(tar::EntryType::Directory, self.normalize_mode(root_mode), 0);
        builder
            .append_data(&mut header, ".", std::io::empty())
            .map_err(archive_error)?;

        if let Some(base_dir) = self.base_dir.clone() {
            for entry in self.walk_entries(&base_dir)? {
                let (rel, path, meta) = entry;
                let name = format!("./{rel}");
                let mode = self.normalize_mode(meta.permissions().mode());
                let file_type = meta.file_type();

                if file_type.is_dir() {
                    let mut header = entry_header(tar::EntryType::Directory, mode, 0);
                    builder
                        .append_data(&mut header, name, std::io::empty())
                        .map_err(archive_error)?;
                } else if file_type.is_file() {
                    let mut header = entry_header(tar::EntryType::Regular, mode, meta.len());
                    let file = File::open(&path).context(ContextReadSnafu { path: path.clone() })?;
                    builder
                        .append_data(&mut header, name, file)
                        .map_err(archive_error)?;
                } else if file_type.is_symlink() {
                    let target =
                        std::fs::read_link(&path).context(ContextReadSnafu { path: path.clone() })?;
                    let mut header = entry_header(tar::EntryType::Symlink, mode, 0);
                    builder
                        .append_link(&mut header, name, target)
                        .map_err(archive_error)?;
                } else if file_type.is_fifo() {
                    let mut header = entry_header(tar::EntryType::Fifo, mode, 0);
                    builder
                        .append_data(&mut header, name, std::io::empty())
                        .map_err(archive_error)?;
                } else if file_type.is_char_device() || file_type.is_block_device() {
                    let entry_type = if file_type.is_char_device() {
                        tar::EntryType::Char
                    } else {
                        tar::EntryType::Block
                    };
                    let mut header = entry_header(entry_type, mode, 0);
                    header
                        .set_device_major(dev_major(meta.rdev()))
                        .map_err(archive_error)?;
                    header
                        .set_device_minor(dev_minor(meta.rdev()))
                        .map_err(archive_error)?;
                    builder
                        .append_data(&mut header, name, std::io::empty())
                        .map_err(archive_error)?;
                } else {
                    return ContextSnafu {
                        message: format!("unsupported file type at {}", path.display()),
                    }
                    .fail();
                }
            }
        }

        for extra in extra_files {
            let mut header = entry_header(
                tar::EntryType::Regular,
                self.normalize_mode(extra.mode),
                extra.data.len() as u64,
            );
            builder
                .append_data(&mut header, format!("./{}", extra.name), extra.data.as_slice())
                .map_err(archive_error)?;
        }

        builder.into_inner().map_err(archive_error)
    }

    /// Walk the base directory with each directory's children sorted,
    /// returning surviving entries as (relative path, absolute path,
    /// metadata) tuples. The root itself is not included.
    fn walk_entries(
        &self,
        base_dir: &Path,
    ) -> Result<Vec<(String, PathBuf, std::fs::Metadata)>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(base_dir)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|err| {
                ContextSnafu {
                    message: format!("failed to walk {}: {err}", base_dir.display()),
                }
                .build()
            })?;
            let rel = entry
                .path()
                .strip_prefix(base_dir)
                .map_err(|_| {
                    ContextSnafu {
                        message: format!("walk escaped base directory {}", base_dir.display()),
                    }
                    .build()
                })?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if self.ignored(&rel) {
                continue;
            }
            let meta = entry.metadata().map_err(|err| {
                ContextSnafu {
                    message: format!("failed to stat {}: {err}", entry.path().display()),
                }
                .build()
            })?;
            entries.push((rel, entry.into_path(), meta));
        }
        Ok(entries)
    }

    /// Full hash over the context: every delivered entry's metadata plus the
    /// content digest of every regular file. Stable across runs.
    pub fn full_hash(&self) -> Result<String> {
        if let Some(hash) = self.full_hash_memo.lock().unwrap().clone() {
            return Ok(hash);
        }

        let mut writer = HashWriter::new();
        writer.update_value(&json!(["BuildContext", "full", self.umask]));
        self.hash_entries(&mut writer, None)?;
        let hash = writer.finish();
        *self.full_hash_memo.lock().unwrap() = Some(hash.clone());
        Ok(hash)
    }

    /// Symbolic hash over the context parameters alone; never reads files.
    /// Useful for quickly comparing contexts within one invocation but not
    /// across file modifications.
    pub fn symbolic_hash(&self) -> String {
        let patterns: Vec<serde_json::Value> = self
            .patterns
            .iter()
            .map(|pattern| json!([pattern.ignoring, pattern.regex_text]))
            .collect();
        let base_dir = self
            .base_dir
            .as_ref()
            .map(|dir| dir.to_string_lossy().into_owned());
        crate::hashing::hash_value(&json!([
            "BuildContext",
            "symbolic",
            self.umask,
            base_dir,
            patterns
        ]))
    }

    /// Like [`full_hash`] but restricted to non-directory entries matching
    /// at least one of `patterns`. `**` is not permitted in this restricted
    /// form.
    pub fn partial_hash(&self, patterns: &[String]) -> Result<String> {
        let mut restrict = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            ensure!(
                !pattern.split('/').any(|segment| segment == "**"),
                ContextSnafu {
                    message: format!("'**' not supported in partial hash pattern {pattern:?}"),
                }
            );
            let text = compile_pattern(pattern, false)?;
            let regex = Regex::new(&format!("^(?:{text})$")).map_err(|err| {
                ContextSnafu {
                    message: format!("invalid pattern {pattern:?}: {err}"),
                }
                .build()
            })?;
            restrict.push(regex);
        }

        let mut writer = HashWriter::new();
        writer.update_value(&json!(["BuildContext", "partial", self.umask, patterns]));
        self.hash_entries(&mut writer, Some(&restrict))?;
        Ok(writer.finish())
    }

    fn hash_entries(&self, writer: &mut HashWriter, restrict: Option<&[Regex]>) -> Result<()> {
        let base_dir = match self.base_dir.clone() {
            Some(dir) => dir,
            None => return Ok(()),
        };

        for (rel, path, meta) in self.walk_entries(&base_dir)? {
            let file_type = meta.file_type();
            if let Some(restrict) = restrict {
                let slashed = format!("/{rel}");
                if file_type.is_dir() || !restrict.iter().any(|regex| regex.is_match(&slashed)) {
                    continue;
                }
            }

            let type_tag = if file_type.is_dir() {
                "dir"
            } else if file_type.is_file() {
                "file"
            } else if file_type.is_symlink() {
                "symlink"
            } else if file_type.is_fifo() {
                "fifo"
            } else if file_type.is_char_device() {
                "char"
            } else if file_type.is_block_device() {
                "block"
            } else {
                return ContextSnafu {
                    message: format!("unsupported file type at {}", path.display()),
                }
                .fail();
            };

            let link_target = if file_type.is_symlink() {
                std::fs::read_link(&path)
                    .context(ContextReadSnafu { path: path.clone() })?
                    .to_string_lossy()
                    .into_owned()
            } else {
                String::new()
            };
            let size = if file_type.is_file() { meta.len() } else { 0 };
            let (major, minor) = if file_type.is_char_device() || file_type.is_block_device() {
                (dev_major(meta.rdev()), dev_minor(meta.rdev()))
            } else {
                (0, 0)
            };

            writer.update_value(&json!([
                rel,
                type_tag,
                self.normalize_mode(meta.permissions().mode()),
                size,
                link_target,
                major,
                minor
            ]));
            if file_type.is_file() {
                let digest = self.file_digest(&path)?;
                writer.update(digest.as_bytes());
            }
        }
        Ok(())
    }

    /// Content digest of a regular file, memoized for the lifetime of the
    /// context.
    fn file_digest(&self, path: &Path) -> Result<String> {
        if let Some(digest) = self.file_digests.lock().unwrap().get(path) {
            return Ok(digest.clone());
        }
        let mut file = File::open(path).context(ContextReadSnafu {
            path: path.to_path_buf(),
        })?;
        let mut writer = HashWriter::new();
        std::io::copy(&mut file, &mut writer).context(ContextReadSnafu {
            path: path.to_path_buf(),
        })?;
        let digest = writer.finish();
        self.file_digests
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), digest.clone());
        Ok(digest)
    }
}

fn entry_header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    let _ = header.set_username("root");
    let _ = header.set_groupname("root");
    header
}

fn archive_error(err: std::io::Error) -> crate::error::Error {
    ContextSnafu {
        message: format!("failed to write archive: {err}"),
    }
    .build()
}

fn dev_major(rdev: u64) -> u32 {
    (((rdev >> 32) & 0xffff_f000) | ((rdev >> 8) & 0xfff)) as u32
}

fn dev_minor(rdev: u64) -> u32 {
    (((rdev >> 12) & 0xffff_ff00) | (rdev & 0xff)) as u32
}
