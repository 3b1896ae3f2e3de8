//! Content transformations shared by the file operations of every backend

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::config::DEFAULT_READ_MAX_BYTES;
use crate::error::{GatewayError, Result};

/// Timestamped backup location for `path`: `path.<unix-millis>.bak`
pub fn backup_path(path: &str) -> String {
    format!("{}.{}.bak", path, Utc::now().timestamp_millis())
}

/// Join a directory and a file name with the separator of the target dialect
pub fn join_path(directory: &str, filename: &str, posix: bool) -> String {
    let sep = if posix { '/' } else { '\\' };
    if directory.is_empty() {
        return filename.to_string();
    }
    if directory.ends_with('/') || directory.ends_with('\\') {
        format!("{}{}", directory, filename)
    } else {
        format!("{}{}{}", directory, sep, filename)
    }
}

/// Whether `path` is absolute in the target dialect
pub fn is_absolute(path: &str, posix: bool) -> bool {
    if posix {
        return path.starts_with('/');
    }
    let bytes = path.as_bytes();
    path.starts_with('\\')
        || path.starts_with('/')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

/// Resolve `path` against `base` unless it is already absolute
pub fn resolve(base: &str, path: &str, posix: bool) -> String {
    if path.is_empty() {
        base.to_string()
    } else if is_absolute(path, posix) {
        path.to_string()
    } else {
        join_path(base, path, posix)
    }
}

/// Replace every match of `pattern` in `content`.
///
/// `replacement` may reference capture groups (`$1`, `${name}`).
pub fn replace_regex(content: &str, pattern: &str, replacement: &str) -> Result<String> {
    let re = Regex::new(pattern)
        .map_err(|e| GatewayError::invalid_params(format!("Invalid pattern '{}': {}", pattern, e)))?;
    Ok(re.replace_all(content, replacement).into_owned())
}

/// Escape a literal needle and replacement so that [`replace_regex`]
/// performs a plain text substitution.
pub fn literal_pattern(needle: &str, replacement: &str) -> (String, String) {
    (regex::escape(needle), replacement.replace('$', "$$"))
}

/// Append `addition` to `existing`
pub fn amend(existing: &str, addition: &str) -> String {
    let mut content = String::with_capacity(existing.len() + addition.len());
    content.push_str(existing);
    content.push_str(addition);
    content
}

/// Which part of a file `read_file` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// First line to return, 1-based
    pub start_line: Option<usize>,
    /// Last line to return, inclusive
    pub end_line: Option<usize>,
    /// Upper bound on the returned content
    pub max_bytes: u64,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            start_line: None,
            end_line: None,
            max_bytes: DEFAULT_READ_MAX_BYTES,
        }
    }
}

impl ReadOptions {
    pub fn lines(mut self, start_line: Option<usize>, end_line: Option<usize>) -> Self {
        self.start_line = start_line;
        self.end_line = end_line;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn has_line_range(&self) -> bool {
        self.start_line.is_some() || self.end_line.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.start_line == Some(0) || self.end_line == Some(0) {
            return Err(GatewayError::invalid_params("Line numbers start at 1"));
        }
        if let (Some(start), Some(end)) = (self.start_line, self.end_line) {
            if end < start {
                return Err(GatewayError::invalid_params(format!(
                    "endLine {} is before startLine {}",
                    end, start
                )));
            }
        }
        if self.max_bytes == 0 {
            return Err(GatewayError::invalid_params("maxBytes must be positive"));
        }
        Ok(())
    }
}

/// Result of `read_file`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileContent {
    pub content: String,
    /// More of the selected range exists past `max_bytes`
    pub truncated: bool,
}

/// Read the selected lines of `reader`, stopping once `max_bytes` are
/// collected. Never buffers more than `max_bytes + 1` bytes of content.
pub async fn read_bounded<R>(reader: R, options: &ReadOptions) -> Result<FileContent>
where
    R: AsyncRead + Unpin,
{
    options.validate()?;

    let limit = options.max_bytes;
    let start = options.start_line.unwrap_or(1);
    let mut reader = BufReader::new(reader);
    let mut out = Vec::new();
    let mut truncated = false;

    let mut line_no = 1;
    while line_no < start {
        if !skip_line(&mut reader).await? {
            return Ok(FileContent::default());
        }
        line_no += 1;
    }

    while options.end_line.is_none_or(|end| line_no <= end) {
        let budget = limit + 1 - out.len() as u64;
        let read = (&mut reader).take(budget).read_until(b'\n', &mut out).await?;
        if read == 0 {
            break;
        }
        if out.len() as u64 > limit {
            out.truncate(limit as usize);
            truncated = true;
            break;
        }
        line_no += 1;
    }

    Ok(FileContent {
        content: decode_prefix(out),
        truncated,
    })
}

/// Consume one line without keeping it; false at end of input
async fn skip_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<bool> {
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(false);
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(true);
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

/// Decode bytes cut at an arbitrary offset, dropping a partial trailing character
fn decode_prefix(mut bytes: Vec<u8>) -> String {
    if let Err(e) = std::str::from_utf8(&bytes) {
        if e.error_len().is_none() {
            bytes.truncate(e.valid_up_to());
        }
    }
    String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_path_format() {
        let backup = backup_path("/etc/app.conf");
        let stamp = backup
            .strip_prefix("/etc/app.conf.")
            .and_then(|s| s.strip_suffix(".bak"))
            .unwrap();
        assert!(stamp.parse::<i64>().unwrap() > 1_600_000_000_000);
    }

    #[test]
    fn test_join_and_resolve() {
        assert_eq!(join_path("/srv", "a.txt", true), "/srv/a.txt");
        assert_eq!(join_path("/srv/", "a.txt", true), "/srv/a.txt");
        assert_eq!(join_path("C:\\data", "a.txt", false), "C:\\data\\a.txt");
        assert_eq!(resolve("/home/u", "notes.md", true), "/home/u/notes.md");
        assert_eq!(resolve("/home/u", "/etc/hosts", true), "/etc/hosts");
        assert_eq!(resolve("C:\\u", "D:\\x.txt", false), "D:\\x.txt");
        assert_eq!(resolve("/home/u", "", true), "/home/u");
    }

    #[test]
    fn test_replace_regex_all_occurrences() {
        let out = replace_regex("port=80\nport=8080\n", r"port=(\d+)", "port=[$1]").unwrap();
        assert_eq!(out, "port=[80]\nport=[8080]\n");
    }

    #[test]
    fn test_invalid_pattern() {
        let err = replace_regex("x", "(", "y").unwrap_err();
        assert!(matches!(err, GatewayError::InvalidParams(_)));
    }

    #[test]
    fn test_literal_pattern_ignores_metacharacters() {
        let (pattern, replacement) = literal_pattern("a.b*(c)", "$1 cost $5");
        let out = replace_regex("xa.b*(c)y axbbc", &pattern, &replacement).unwrap();
        assert_eq!(out, "x$1 cost $5y axbbc");
    }

    #[test]
    fn test_amend() {
        assert_eq!(amend("line1\n", "line2\n"), "line1\nline2\n");
        assert_eq!(amend("", "x"), "x");
    }

    async fn read(input: &str, options: ReadOptions) -> FileContent {
        read_bounded(input.as_bytes(), &options).await.unwrap()
    }

    #[tokio::test]
    async fn test_read_whole_input() {
        let out = read("a\nb\n", ReadOptions::default()).await;
        assert_eq!(out.content, "a\nb\n");
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn test_read_line_range() {
        let input = "one\ntwo\nthree\nfour\n";
        let out = read(input, ReadOptions::default().lines(Some(2), Some(3))).await;
        assert_eq!(out.content, "two\nthree\n");

        let out = read(input, ReadOptions::default().lines(Some(4), None)).await;
        assert_eq!(out.content, "four\n");

        let out = read(input, ReadOptions::default().lines(None, Some(1))).await;
        assert_eq!(out.content, "one\n");

        let out = read(input, ReadOptions::default().lines(Some(9), None)).await;
        assert_eq!(out, FileContent::default());
    }

    #[tokio::test]
    async fn test_read_stops_at_max_bytes() {
        let out = read("abcdef\nghij\n", ReadOptions::default().with_max_bytes(4)).await;
        assert_eq!(out.content, "abcd");
        assert!(out.truncated);

        // Exactly at the limit is not truncated
        let out = read("abcd", ReadOptions::default().with_max_bytes(4)).await;
        assert_eq!(out.content, "abcd");
        assert!(!out.truncated);

        let out = read("ab\ncd\nef", ReadOptions::default().with_max_bytes(6)).await;
        assert_eq!(out.content, "ab\ncd\n");
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn test_read_range_is_bounded_too() {
        let input = "skip me\n0123456789\nmore\n";
        let options = ReadOptions::default().lines(Some(2), None).with_max_bytes(5);
        let out = read(input, options).await;
        assert_eq!(out.content, "01234");
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn test_read_cut_inside_a_character() {
        let out = read("h\u{e9}llo", ReadOptions::default().with_max_bytes(2)).await;
        assert_eq!(out.content, "h");
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn test_read_options_are_validated() {
        for options in [
            ReadOptions::default().lines(Some(0), None),
            ReadOptions::default().lines(None, Some(0)),
            ReadOptions::default().lines(Some(5), Some(2)),
            ReadOptions::default().with_max_bytes(0),
        ] {
            let err = read_bounded("x".as_bytes(), &options).await.unwrap_err();
            assert!(matches!(err, GatewayError::InvalidParams(_)), "{:?}", options);
        }
        assert!(ReadOptions::default().lines(Some(3), Some(3)).validate().is_ok());
    }
}
