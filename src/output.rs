//! Line reading for child process pipes.
//!
//! Child output is not guaranteed to be UTF-8. Lines are decoded lossily so
//! a stray byte never ends the read loop; a reader that stopped early would
//! close the pipe and the child's next write would die with SIGPIPE.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead};

/// Reads `\n`-terminated lines, decoding invalid UTF-8 with U+FFFD.
pub(crate) struct LossyLines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LossyLines<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Next line without its `\n` or `\r\n`, or `None` at EOF.
    pub(crate) async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }

    pub(crate) fn into_inner(self) -> R {
        self.reader
    }
}

/// Read everything left in `reader` and throw it away.
pub(crate) async fn discard<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<u64> {
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_utf8_does_not_end_the_stream() {
        let input: &[u8] = b"first\n\xff\xfe broken\r\nlast";
        let mut lines = LossyLines::new(input);

        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("first"));
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("\u{fffd}\u{fffd} broken")
        );
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("last"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_lines_are_kept() {
        let input: &[u8] = b"\n\nx\n";
        let mut lines = LossyLines::new(input);
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("x"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }
}
